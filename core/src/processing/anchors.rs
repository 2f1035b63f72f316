use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::prelude::{ConfigError, Position};

/// Explicit assignment of receiver sources to anchor roles.
///
/// Role 0 sits at `(0, 0)`, role 1 at `(D, 0)` and role 2 at `(D, D)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorMap {
    roles: BTreeMap<String, usize>,
}

impl AnchorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns roles 0, 1, 2, ... in iteration order.
    pub fn from_ordered<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roles = sources
            .into_iter()
            .enumerate()
            .map(|(role, source)| (source.into(), role))
            .collect();
        Self { roles }
    }

    /// Parses a `<source>=<role>` command-line entry.
    pub fn parse_entry(spec: &str) -> Result<(String, usize), ConfigError> {
        let (source, role) = spec
            .rsplit_once('=')
            .ok_or_else(|| ConfigError::InvalidAnchorSpec(spec.to_string()))?;
        let role = role
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAnchorSpec(spec.to_string()))?;
        let source = source.trim();
        if source.is_empty() {
            return Err(ConfigError::InvalidAnchorSpec(spec.to_string()));
        }
        Ok((source.to_string(), role))
    }

    pub fn assign(&mut self, source: impl Into<String>, role: usize) -> Result<(), ConfigError> {
        let source = source.into();
        if let Some(first) = self.source_for(role) {
            if first != source {
                return Err(ConfigError::DuplicateAnchorRole {
                    role,
                    first: first.to_string(),
                    second: source,
                });
            }
        }
        self.roles.insert(source, role);
        Ok(())
    }

    /// Resolves the role of a reading's source.
    ///
    /// An exact match wins; otherwise the host part of a `host:port` id is tried.
    pub fn role_of(&self, source_id: &str) -> Option<usize> {
        if let Some(role) = self.roles.get(source_id) {
            return Some(*role);
        }
        let (host, port) = source_id.rsplit_once(':')?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.roles
            .get(host)
            .or_else(|| self.roles.get(host.trim_start_matches('[').trim_end_matches(']')))
            .copied()
    }

    pub fn source_for(&self, role: usize) -> Option<&str> {
        self.roles
            .iter()
            .find(|(_, assigned)| **assigned == role)
            .map(|(source, _)| source.as_str())
    }

    pub fn validate(&self, receivers: usize) -> Result<(), ConfigError> {
        let mut seen: BTreeMap<usize, &str> = BTreeMap::new();
        for (source, role) in &self.roles {
            if *role >= receivers {
                return Err(ConfigError::AnchorOutOfRange {
                    source_id: source.clone(),
                    role: *role,
                    receivers,
                });
            }
            if let Some(first) = seen.insert(*role, source) {
                return Err(ConfigError::DuplicateAnchorRole {
                    role: *role,
                    first: first.to_string(),
                    second: source.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.roles.iter().map(|(source, role)| (source.as_str(), *role))
    }
}

/// Fixed right-triangle layout position of an anchor role.
pub fn anchor_position(role: usize, distance: f64) -> Option<Position> {
    match role {
        0 => Some(Position { x: 0.0, y: 0.0 }),
        1 => Some(Position { x: distance, y: 0.0 }),
        2 => Some(Position {
            x: distance,
            y: distance,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_sources_get_sequential_roles() {
        let anchors = AnchorMap::from_ordered(["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]);
        assert_eq!(anchors.role_of("/dev/ttyUSB1"), Some(1));
        assert_eq!(anchors.source_for(2), Some("/dev/ttyUSB2"));
        assert!(anchors.validate(3).is_ok());
    }

    #[test]
    fn network_peers_match_by_host() {
        let mut anchors = AnchorMap::new();
        anchors.assign("192.168.1.20", 0).unwrap();
        anchors.assign("::1", 1).unwrap();
        assert_eq!(anchors.role_of("192.168.1.20:53012"), Some(0));
        assert_eq!(anchors.role_of("[::1]:4000"), Some(1));
        assert_eq!(anchors.role_of("192.168.1.21:53012"), None);
    }

    #[test]
    fn duplicate_roles_are_rejected() {
        let mut anchors = AnchorMap::new();
        anchors.assign("a", 0).unwrap();
        assert!(matches!(
            anchors.assign("b", 0),
            Err(ConfigError::DuplicateAnchorRole { role: 0, .. })
        ));
    }

    #[test]
    fn roles_beyond_receiver_count_are_rejected() {
        let anchors = AnchorMap::from_ordered(["a", "b", "c"]);
        assert!(matches!(
            anchors.validate(2),
            Err(ConfigError::AnchorOutOfRange { role: 2, .. })
        ));
    }

    #[test]
    fn parses_command_line_entries() {
        assert_eq!(
            AnchorMap::parse_entry("/dev/ttyUSB0=2").unwrap(),
            ("/dev/ttyUSB0".to_string(), 2)
        );
        assert!(AnchorMap::parse_entry("nope").is_err());
        assert!(AnchorMap::parse_entry("=1").is_err());
        assert!(AnchorMap::parse_entry("a=x").is_err());
    }

    #[test]
    fn layout_is_a_right_triangle() {
        assert_eq!(
            anchor_position(2, 10.0),
            Some(Position { x: 10.0, y: 10.0 })
        );
        assert_eq!(anchor_position(3, 10.0), None);
    }
}
