use std::collections::HashSet;
use std::sync::Arc;

use crate::prelude::ParseRejection;
use crate::wire::reading::{CorrelationTag, MonotonicClock, Reading, DEVICE_ID_LEN};

/// Result of parsing a line that was well formed.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Accepted(Reading),
    /// The device is not on the configured allow-list.
    Filtered { device_id: String },
}

/// Stateless parser for `<deviceId> <signalStrength> <correlationTag>` lines.
///
/// Clones share the allow-list and the monotonic clock.
#[derive(Debug, Clone)]
pub struct LineParser {
    allow_list: Arc<HashSet<String>>,
    clock: MonotonicClock,
}

impl LineParser {
    pub fn new<I, S>(allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_clock(allow_list, MonotonicClock::new())
    }

    pub fn with_clock<I, S>(allow_list: I, clock: MonotonicClock) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_list: Arc::new(allow_list.into_iter().map(Into::into).collect()),
            clock,
        }
    }

    /// Parser without an allow-list.
    pub fn unfiltered() -> Self {
        Self::new(Vec::<String>::new())
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    pub fn parse(&self, raw: &[u8], source_id: &str) -> Result<ParseOutcome, ParseRejection> {
        let observed_at = self.clock.now_secs();
        if !raw.is_ascii() {
            return Err(ParseRejection::NonAscii);
        }
        // ASCII is valid UTF-8.
        let line = std::str::from_utf8(raw).map_err(|_| ParseRejection::NonAscii)?;

        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        let &[device_id, signal, tag] = fields.as_slice() else {
            return Err(ParseRejection::MalformedLine {
                fields: fields.len(),
            });
        };

        if device_id.len() != DEVICE_ID_LEN {
            return Err(ParseRejection::MalformedIdentifier(device_id.to_string()));
        }
        let signal_strength: i32 = signal
            .parse()
            .map_err(|_| ParseRejection::MalformedSignalValue(signal.to_string()))?;

        if !self.allow_list.is_empty() && !self.allow_list.contains(device_id) {
            return Ok(ParseOutcome::Filtered {
                device_id: device_id.to_string(),
            });
        }

        Ok(ParseOutcome::Accepted(Reading {
            device_id: device_id.to_string(),
            tag: CorrelationTag::canonical(tag),
            signal_strength,
            observed_at,
            source_id: source_id.to_string(),
        }))
    }
}
