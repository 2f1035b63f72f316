use serde::{Deserialize, Serialize};
use trackcore::processing::{anchor_position, StatusReport};
use trackcore::EngineConfig;

/// Where one configured anchor sits in the layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnchorModel {
    pub source_id: String,
    pub role: usize,
    pub x: f64,
    pub y: f64,
}

/// Static layout served alongside live status, for drawing the floor plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LayoutModel {
    pub distance: f64,
    pub receivers: usize,
    pub anchors: Vec<AnchorModel>,
}

impl LayoutModel {
    pub fn from_engine(config: &EngineConfig) -> Self {
        let anchors = config
            .anchors
            .iter()
            .filter_map(|(source_id, role)| {
                anchor_position(role, config.distance).map(|position| AnchorModel {
                    source_id: source_id.to_string(),
                    role,
                    x: position.x,
                    y: position.y,
                })
            })
            .collect();
        Self {
            distance: config.distance,
            receivers: config.receivers,
            anchors,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusModel {
    pub layout: LayoutModel,
    pub status: StatusReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackcore::AnchorMap;

    #[test]
    fn layout_places_anchors_on_the_triangle() {
        let config = EngineConfig::new(3, 8.0, AnchorMap::from_ordered(["a", "b", "c"]));
        let layout = LayoutModel::from_engine(&config);
        assert_eq!(layout.anchors.len(), 3);
        let c = layout.anchors.iter().find(|anchor| anchor.source_id == "c").unwrap();
        assert_eq!((c.role, c.x, c.y), (2, 8.0, 8.0));
    }
}
