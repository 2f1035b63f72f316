use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Canonical correlation tag width.
pub const TAG_WIDTH: usize = 8;

/// Length of a colon-separated MAC address.
pub const DEVICE_ID_LEN: usize = 17;

/// Opaque key tying together the readings of one beacon across receivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationTag(String);

impl CorrelationTag {
    /// Left-pads `raw` with `'0'` to eight characters. Longer tags are kept whole.
    pub fn canonical(raw: &str) -> Self {
        Self(format!("{:0>width$}", raw, width = TAG_WIDTH))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One receiver's observation of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub tag: CorrelationTag,
    pub signal_strength: i32,
    /// Seconds on the process-local monotonic clock.
    pub observed_at: f64,
    pub source_id: String,
}

/// Monotonic clock shared by every parser clone of one process.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_tags_are_zero_padded() {
        assert_eq!(CorrelationTag::canonical("1a2b3c").as_str(), "001a2b3c");
        assert_eq!(CorrelationTag::canonical("7").as_str(), "00000007");
    }

    #[test]
    fn padded_tags_keep_original_suffix() {
        for raw in ["", "f", "abc", "1234567"] {
            let tag = CorrelationTag::canonical(raw);
            assert_eq!(tag.as_str().len(), TAG_WIDTH);
            assert!(tag.as_str().ends_with(raw));
            assert!(tag.as_str()[..TAG_WIDTH - raw.len()].chars().all(|c| c == '0'));
        }
    }

    #[test]
    fn long_tags_are_not_truncated() {
        assert_eq!(CorrelationTag::canonical("12345678").as_str(), "12345678");
        assert_eq!(
            CorrelationTag::canonical("deadbeef42").as_str(),
            "deadbeef42"
        );
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let first = clock.now_secs();
        let second = clock.now_secs();
        assert!(second >= first);
    }
}
