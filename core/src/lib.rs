//! Aggregation and position-estimation core for multi-receiver beacon tracking.
//!
//! Receivers report `<mac> <rssi> <tag>` lines; readings sharing a device and
//! correlation tag are grouped until every receiver has reported, then the
//! group is turned into a 2-D position estimate.

pub mod prelude;
pub mod processing;
pub mod records;
pub mod source;
pub mod telemetry;
pub mod wire;

pub use prelude::{EngineConfig, Position, PositionEstimator};
pub use processing::{Aggregator, AggregatorHandle, AnchorMap, RatioEstimator};
pub use records::{DeviceLocation, LocationTable, RawArchive};
pub use wire::{LineParser, Reading};
