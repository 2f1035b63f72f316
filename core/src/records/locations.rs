use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::prelude::{ArchiveError, Position};

/// Latest estimate for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLocation {
    #[serde(skip)]
    pub device_id: String,
    pub x: f64,
    pub y: f64,
    pub observation_count: u64,
}

/// `deviceId -> {x, y, observationCount}`; entries are overwritten, never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LocationTable {
    devices: BTreeMap<String, DeviceLocation>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `position` for `device_id` and bumps its observation count.
    pub fn record(&mut self, device_id: &str, position: Position) -> DeviceLocation {
        let entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceLocation {
                device_id: device_id.to_string(),
                x: 0.0,
                y: 0.0,
                observation_count: 0,
            });
        entry.x = position.x;
        entry.y = position.y;
        entry.observation_count += 1;
        entry.clone()
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceLocation> {
        self.devices.get(device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceLocation> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).map_err(|source| ArchiveError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}
