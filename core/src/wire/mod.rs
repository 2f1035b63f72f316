pub mod parser;
pub mod reading;

pub use parser::{LineParser, ParseOutcome};
pub use reading::{CorrelationTag, MonotonicClock, Reading, DEVICE_ID_LEN, TAG_WIDTH};
