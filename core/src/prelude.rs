use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::processing::anchors::AnchorMap;
use crate::processing::store::CompletedGroup;

/// Number of anchor roles the ratio heuristic understands.
pub const ANCHOR_ROLES: usize = 3;

/// Shared configuration for the aggregation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Group size that counts as complete.
    pub receivers: usize,
    /// Anchor distance unit `D`.
    pub distance: f64,
    #[serde(default)]
    pub anchors: AnchorMap,
    /// Age after which an incomplete group is dropped, 0 disables expiry.
    #[serde(default)]
    pub expire_after_secs: u64,
}

impl EngineConfig {
    pub fn new(receivers: usize, distance: f64, anchors: AnchorMap) -> Self {
        Self {
            receivers,
            distance,
            anchors,
            expire_after_secs: 0,
        }
    }

    pub fn expire_after(&self) -> Option<Duration> {
        (self.expire_after_secs > 0).then(|| Duration::from_secs(self.expire_after_secs))
    }

    /// Rejects configurations that cannot produce a single completed group.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receivers == 0 {
            return Err(ConfigError::NoReceivers);
        }
        if !(self.distance.is_finite() && self.distance > 0.0) {
            return Err(ConfigError::InvalidDistance(self.distance));
        }
        self.anchors.validate(self.receivers)
    }
}

/// A 2-D coordinate in anchor distance units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Why a raw line did not become a reading.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseRejection {
    #[error("expected 3 fields, found {fields}")]
    MalformedLine { fields: usize },
    #[error("line is not ASCII")]
    NonAscii,
    #[error("device identifier `{0}` is not 17 characters")]
    MalformedIdentifier(String),
    #[error("signal strength `{0}` is not an integer")]
    MalformedSignalValue(String),
    #[error("line exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },
}

/// Group membership conflicts detected by the correlation store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("source {source_id} already reported tag {tag} for {device_id}")]
    AmbiguousGroupMembership {
        device_id: String,
        tag: String,
        source_id: String,
    },
}

/// Estimation failures; the group is dropped without a location.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    #[error("estimator needs {expected} readings, group has {actual}")]
    UnsupportedAnchorCount { expected: usize, actual: usize },
    #[error("signal strengths {a} and {b} sum to zero")]
    DegenerateSignal { a: i32, b: i32 },
}

/// Startup configuration problems.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no receivers configured")]
    NoReceivers,
    #[error("anchor distance must be positive, got {0}")]
    InvalidDistance(f64),
    #[error("anchor role {role} for {source_id} is outside 0..{receivers}")]
    AnchorOutOfRange {
        source_id: String,
        role: usize,
        receivers: usize,
    },
    #[error("anchor role {role} assigned to both {first} and {second}")]
    DuplicateAnchorRole {
        role: usize,
        first: String,
        second: String,
    },
    #[error("invalid anchor assignment `{0}`, expected <source>=<role>")]
    InvalidAnchorSpec(String),
    #[error("serial port {0} has no anchor role")]
    UnanchoredSource(String),
}

/// Raised when the aggregation task is no longer running.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("aggregator has shut down")]
    Closed,
}

/// Raw-reading archive import/export failures.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("archive i/o on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive format: {0}")]
    Format(#[from] serde_json::Error),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

pub type EstimationResult<T> = Result<T, EstimationError>;

/// Seam for turning a completed group into a coordinate.
///
/// Implementations run inside the aggregation task and must stay cheap and
/// synchronous.
pub trait PositionEstimator: Send {
    fn estimate(&self, group: &CompletedGroup) -> EstimationResult<Position>;

    fn name(&self) -> &'static str;
}
