pub mod aggregator;
pub mod anchors;
pub mod estimator;
pub mod store;

pub use aggregator::{
    Aggregator, AggregatorCommand, AggregatorHandle, Snapshot, StatusReport, DEFAULT_QUEUE_DEPTH,
};
pub use anchors::{anchor_position, AnchorMap};
pub use estimator::RatioEstimator;
pub use store::{CompletedGroup, CorrelationStore, GroupOrdering, StaleGroup};
