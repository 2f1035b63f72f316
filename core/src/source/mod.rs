//! Receiver sources: concurrent producers of raw lines.
//!
//! Every running source parses its own lines and posts readings to the
//! aggregation task through an [`AggregatorHandle`].

pub mod network;
pub mod serial;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::prelude::{AggregatorError, ParseRejection};
use crate::processing::AggregatorHandle;
use crate::telemetry::{LogManager, MetricsRecorder};
use crate::wire::{LineParser, ParseOutcome, Reading};

pub use network::NetworkListener;
pub use serial::SerialSource;

/// Default per-source line cap.
pub const DEFAULT_LINE_CAP: u64 = 1024;

/// Longest accepted line, newline included.
pub const MAX_LINE_BYTES: usize = 256;

/// Source-level failures. They end one source, never the process.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("failed to open serial device {path}: {source}")]
    OpenFailure {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("failed to bind listener on {addr}: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read failure on {source_id}: {source}")]
    ReadFailure {
        source_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{source_id} stopped: {source}")]
    AggregatorClosed {
        source_id: String,
        #[source]
        source: AggregatorError,
    },
}

/// Why a source's read loop ended.
#[derive(Debug)]
pub enum SourceOutcome {
    CapReached,
    Cancelled,
    EndOfStream,
    Failed(SourceError),
}

impl SourceOutcome {
    pub(crate) fn closed(source_id: &str, source: AggregatorError) -> Self {
        SourceOutcome::Failed(SourceError::AggregatorClosed {
            source_id: source_id.to_string(),
            source,
        })
    }
}

/// Terminal state reported to the supervisor.
#[derive(Debug)]
pub struct SourceReport {
    pub source_id: String,
    pub lines: u64,
    pub outcome: SourceOutcome,
}

impl SourceReport {
    pub fn new(source_id: impl Into<String>, lines: u64, outcome: SourceOutcome) -> Self {
        Self {
            source_id: source_id.into(),
            lines,
            outcome,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Failed(_))
    }

    /// True when the source never started: the device did not open or the port did not bind.
    pub fn is_open_failure(&self) -> bool {
        matches!(
            self.outcome,
            SourceOutcome::Failed(SourceError::OpenFailure { .. })
                | SourceOutcome::Failed(SourceError::BindFailure { .. })
        )
    }
}

/// What happened to one raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDisposition {
    Submitted,
    Filtered,
    Rejected,
}

/// Everything a running source needs besides its own I/O handle.
#[derive(Clone)]
pub struct SourceContext {
    parser: LineParser,
    handle: AggregatorHandle,
    metrics: Arc<MetricsRecorder>,
    line_cap: u64,
    cancel: CancellationToken,
    logger: LogManager,
}

impl SourceContext {
    pub fn new(
        parser: LineParser,
        handle: AggregatorHandle,
        metrics: Arc<MetricsRecorder>,
        line_cap: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            parser,
            handle,
            metrics,
            line_cap,
            cancel,
            logger: LogManager::new("source"),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A cap of 0 never stops the source.
    pub fn cap_reached(&self, lines: u64) -> bool {
        self.line_cap > 0 && lines >= self.line_cap
    }

    /// Parses, counts and logs one line. `Err` carries the non-submitted disposition.
    fn classify(&self, raw: &[u8], source_id: &str) -> Result<Reading, LineDisposition> {
        self.metrics.record_line();
        match self.parser.parse(raw, source_id) {
            Ok(ParseOutcome::Accepted(reading)) => {
                self.metrics.record_accepted();
                self.logger.trace(&format!(
                    "{}: {} ({}) from {} @ {:.6}",
                    reading.device_id,
                    reading.signal_strength,
                    reading.tag,
                    reading.source_id,
                    reading.observed_at
                ));
                Ok(reading)
            }
            Ok(ParseOutcome::Filtered { .. }) => {
                self.metrics.record_filtered();
                Err(LineDisposition::Filtered)
            }
            Err(reason) => {
                self.metrics.record_rejected();
                self.logger.rejected_line(source_id, raw, &reason);
                Err(LineDisposition::Rejected)
            }
        }
    }

    /// Counts and logs a line that outgrew [`MAX_LINE_BYTES`]; only its head is logged.
    pub fn reject_overlong(&self, head: &[u8], source_id: &str) {
        self.metrics.record_line();
        self.metrics.record_rejected();
        self.logger.rejected_line(
            source_id,
            &head[..head.len().min(32)],
            &ParseRejection::LineTooLong {
                limit: MAX_LINE_BYTES,
            },
        );
    }

    pub async fn deliver(
        &self,
        raw: &[u8],
        source_id: &str,
    ) -> Result<LineDisposition, AggregatorError> {
        match self.classify(raw, source_id) {
            Ok(reading) => {
                self.handle.submit(reading).await?;
                Ok(LineDisposition::Submitted)
            }
            Err(disposition) => Ok(disposition),
        }
    }

    pub fn deliver_blocking(
        &self,
        raw: &[u8],
        source_id: &str,
    ) -> Result<LineDisposition, AggregatorError> {
        match self.classify(raw, source_id) {
            Ok(reading) => {
                self.handle.blocking_submit(reading)?;
                Ok(LineDisposition::Submitted)
            }
            Err(disposition) => Ok(disposition),
        }
    }
}

/// A configured receiver source.
pub enum ReceiverSource {
    Serial(SerialSource),
    Network(NetworkListener),
}

impl ReceiverSource {
    pub fn id(&self) -> String {
        match self {
            ReceiverSource::Serial(source) => source.path().to_string(),
            ReceiverSource::Network(listener) => listener.bind_addr().to_string(),
        }
    }

    /// Runs the source on the current runtime until it reaches a terminal state.
    pub fn spawn(self, ctx: SourceContext) -> JoinHandle<SourceReport> {
        match self {
            ReceiverSource::Serial(source) => source.spawn(ctx),
            ReceiverSource::Network(listener) => listener.spawn(ctx),
        }
    }
}
