use log::{debug, info, warn};
use std::fmt::Display;

use crate::wire::Reading;

/// Scoped log sink used for pipeline and data-quality events.
#[derive(Debug, Clone, Copy)]
pub struct LogManager {
    scope: &'static str,
}

impl LogManager {
    pub fn new(scope: &'static str) -> Self {
        Self { scope }
    }

    pub fn record(&self, message: &str) {
        info!("[{}] {}", self.scope, message);
    }

    pub fn trace(&self, message: &str) {
        debug!("[{}] {}", self.scope, message);
    }

    /// Reports a raw line that produced no reading.
    pub fn rejected_line(&self, source_id: &str, raw: &[u8], reason: &dyn Display) {
        warn!(
            "[{}] dropped line from {}: {} (line {:?})",
            self.scope,
            source_id,
            reason,
            String::from_utf8_lossy(raw).trim_end()
        );
    }

    /// Reports a group that was discarded without a location.
    pub fn dropped_group(&self, device_id: &str, tag: &str, readings: &[Reading], reason: &dyn Display) {
        warn!(
            "[{}] dropped group {}/{}: {} (members [{}])",
            self.scope,
            device_id,
            tag,
            reason,
            describe_members(readings)
        );
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new("trackcore")
    }
}

/// Renders `source=strength` pairs for log lines.
pub fn describe_members(readings: &[Reading]) -> String {
    readings
        .iter()
        .map(|reading| format!("{}={}", reading.source_id, reading.signal_strength))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::CorrelationTag;

    #[test]
    fn members_render_source_and_strength() {
        let readings = vec![
            Reading {
                device_id: "AA:BB:CC:DD:EE:FF".into(),
                tag: CorrelationTag::canonical("1"),
                signal_strength: -40,
                observed_at: 0.0,
                source_id: "r0".into(),
            },
            Reading {
                device_id: "AA:BB:CC:DD:EE:FF".into(),
                tag: CorrelationTag::canonical("1"),
                signal_strength: -61,
                observed_at: 0.1,
                source_id: "r1".into(),
            },
        ];
        assert_eq!(describe_members(&readings), "r0=-40, r1=-61");
    }
}
