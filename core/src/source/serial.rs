//! Serial receiver source.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::source::{SourceContext, SourceError, SourceOutcome, SourceReport, MAX_LINE_BYTES};

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Read timeout; bounds how long a cancelled source keeps its port open.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// A receiver attached over a serial device.
#[derive(Debug, Clone)]
pub struct SerialSource {
    path: String,
    baud_rate: u32,
}

impl SerialSource {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Opens the device as 8N1 without flow control.
    pub fn open(&self) -> Result<Box<dyn SerialPort>, SourceError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| SourceError::OpenFailure {
                path: self.path.clone(),
                source,
            })?;
        log::info!("Opened serial port: {} at {} baud", self.path, self.baud_rate);
        Ok(port)
    }

    /// Reads the device on a blocking thread until cap, cancellation or error.
    pub fn spawn(self, ctx: SourceContext) -> JoinHandle<SourceReport> {
        tokio::task::spawn_blocking(move || self.run_blocking(ctx))
    }

    fn run_blocking(self, ctx: SourceContext) -> SourceReport {
        let port = match self.open() {
            Ok(port) => port,
            Err(err) => {
                log::error!("{}", err);
                return SourceReport::new(self.path, 0, SourceOutcome::Failed(err));
            }
        };
        let report = pump_blocking(BufReader::new(port), &self.path, &ctx);
        log::info!(
            "Exiting serial source {} after {} lines ({:?})",
            self.path,
            report.lines,
            report.outcome
        );
        report
    }
}

/// Line loop over any blocking reader.
///
/// Timeouts are not errors: the partial line is kept and cancellation is
/// checked before reading again. A line longer than [`MAX_LINE_BYTES`] is
/// rejected once and the rest of it is skipped up to the next newline.
pub fn pump_blocking<R: BufRead>(mut reader: R, source_id: &str, ctx: &SourceContext) -> SourceReport {
    let mut line = Vec::with_capacity(64);
    let mut lines = 0u64;
    let mut skipping = false;

    let outcome = loop {
        if ctx.is_cancelled() {
            break SourceOutcome::Cancelled;
        }

        let budget = (MAX_LINE_BYTES - line.len()) as u64;
        match (&mut reader).take(budget).read_until(b'\n', &mut line) {
            Ok(0) => {
                if !line.is_empty() && !skipping {
                    lines += 1;
                    if let Err(err) = ctx.deliver_blocking(&line, source_id) {
                        break SourceOutcome::closed(source_id, err);
                    }
                }
                break SourceOutcome::EndOfStream;
            }
            Ok(_) if line.ends_with(b"\n") => {
                if std::mem::take(&mut skipping) {
                    line.clear();
                    continue;
                }
                lines += 1;
                let delivered = ctx.deliver_blocking(&line, source_id);
                line.clear();
                if let Err(err) = delivered {
                    break SourceOutcome::closed(source_id, err);
                }
                if ctx.cap_reached(lines) {
                    break SourceOutcome::CapReached;
                }
            }
            Ok(_) if line.len() >= MAX_LINE_BYTES => {
                let first = !skipping;
                if first {
                    lines += 1;
                    ctx.reject_overlong(&line, source_id);
                }
                line.clear();
                skipping = true;
                if first && ctx.cap_reached(lines) {
                    break SourceOutcome::CapReached;
                }
            }
            Ok(_) => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(source) => {
                break SourceOutcome::Failed(SourceError::ReadFailure {
                    source_id: source_id.to_string(),
                    source,
                })
            }
        }
    };

    SourceReport::new(source_id, lines, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::EngineConfig;
    use crate::processing::{Aggregator, AnchorMap, RatioEstimator, Snapshot};
    use crate::telemetry::MetricsRecorder;
    use crate::wire::LineParser;
    use std::io::Cursor;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    type Harness = (
        SourceContext,
        tokio::task::JoinHandle<Snapshot>,
        CancellationToken,
        Arc<MetricsRecorder>,
    );

    fn context(cap: u64) -> Harness {
        let metrics = Arc::new(MetricsRecorder::new());
        let config = EngineConfig::new(3, 10.0, AnchorMap::from_ordered(["a", "b", "c"]));
        let aggregator =
            Aggregator::new(&config, Box::new(RatioEstimator::new(10.0)), metrics.clone()).unwrap();
        let shutdown = CancellationToken::new();
        let (handle, task) = aggregator.spawn(64, shutdown.clone());
        let ctx = SourceContext::new(
            LineParser::unfiltered(),
            handle,
            metrics.clone(),
            cap,
            CancellationToken::new(),
        );
        (ctx, task, shutdown, metrics)
    }

    /// Reader that times out once between every chunk.
    struct Flaky {
        chunks: Vec<&'static [u8]>,
        timed_out: bool,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(std::io::Error::new(ErrorKind::TimedOut, "timeout"));
            }
            self.timed_out = false;
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[tokio::test]
    async fn pump_stops_at_line_cap() {
        let (ctx, task, shutdown, metrics) = context(2);
        let input = b"AA:BB:CC:DD:EE:FF -40 1\nAA:BB:CC:DD:EE:FF -41 2\nAA:BB:CC:DD:EE:FF -42 3\n";
        let report = tokio::task::spawn_blocking(move || {
            pump_blocking(Cursor::new(&input[..]), "a", &ctx)
        })
        .await
        .unwrap();

        assert!(matches!(report.outcome, SourceOutcome::CapReached));
        assert_eq!(report.lines, 2);
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(metrics.snapshot().accepted, 2);
    }

    #[tokio::test]
    async fn pump_counts_rejected_lines_toward_cap_and_reaches_eof() {
        let (ctx, task, shutdown, metrics) = context(0);
        let input = b"garbage\nAA:BB:CC:DD:EE:FF nope 1\nAA:BB:CC:DD:EE:FF -42 3";
        let report = tokio::task::spawn_blocking(move || {
            pump_blocking(Cursor::new(&input[..]), "a", &ctx)
        })
        .await
        .unwrap();

        assert!(matches!(report.outcome, SourceOutcome::EndOfStream));
        assert_eq!(report.lines, 3);
        shutdown.cancel();
        let snapshot = task.await.unwrap();
        let counters = metrics.snapshot();
        assert_eq!(counters.rejected, 2);
        assert_eq!(counters.accepted, 1);
        assert_eq!(snapshot.flushed_groups, 1);
    }

    #[tokio::test]
    async fn partial_lines_survive_read_timeouts() {
        let (ctx, task, shutdown, metrics) = context(0);
        let reader = BufReader::new(Flaky {
            chunks: vec![b"AA:BB:CC:", b"DD:EE:FF -4", b"0 1a\n"],
            timed_out: false,
        });
        let report = tokio::task::spawn_blocking(move || pump_blocking(reader, "a", &ctx))
            .await
            .unwrap();

        assert_eq!(report.lines, 1);
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(metrics.snapshot().accepted, 1);
        assert_eq!(metrics.snapshot().rejected, 0);
    }

    #[tokio::test]
    async fn overlong_line_is_rejected_once_and_skipped() {
        let (ctx, task, shutdown, metrics) = context(0);
        let mut input = vec![b'A'; MAX_LINE_BYTES * 3];
        input.extend_from_slice(b"\nAA:BB:CC:DD:EE:FF -40 1\n");
        let report = tokio::task::spawn_blocking(move || {
            pump_blocking(Cursor::new(input), "a", &ctx)
        })
        .await
        .unwrap();

        assert!(matches!(report.outcome, SourceOutcome::EndOfStream));
        assert_eq!(report.lines, 2);
        shutdown.cancel();
        task.await.unwrap();
        let counters = metrics.snapshot();
        assert_eq!(counters.rejected, 1);
        assert_eq!(counters.accepted, 1);
    }

    #[tokio::test]
    async fn closed_aggregator_is_a_failure_not_a_stop() {
        let (ctx, task, shutdown, _) = context(0);
        shutdown.cancel();
        task.await.unwrap();
        let report = tokio::task::spawn_blocking(move || {
            pump_blocking(Cursor::new(&b"AA:BB:CC:DD:EE:FF -40 1\n"[..]), "a", &ctx)
        })
        .await
        .unwrap();

        assert!(matches!(
            report.outcome,
            SourceOutcome::Failed(SourceError::AggregatorClosed { .. })
        ));
        assert!(report.is_failure());
        assert!(!report.is_open_failure());
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_reading() {
        let (ctx, task, shutdown, _) = context(0);
        ctx.cancel_token().cancel();
        let report = tokio::task::spawn_blocking(move || {
            pump_blocking(Cursor::new(&b"AA:BB:CC:DD:EE:FF -40 1\n"[..]), "a", &ctx)
        })
        .await
        .unwrap();
        assert!(matches!(report.outcome, SourceOutcome::Cancelled));
        assert_eq!(report.lines, 0);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn missing_device_is_an_open_failure() {
        let (ctx, task, shutdown, _) = context(0);
        let source = SerialSource::new("/dev/this-port-does-not-exist", DEFAULT_BAUD);
        let report = source.spawn(ctx).await.unwrap();
        assert!(report.is_open_failure());
        assert_eq!(report.source_id, "/dev/this-port-does-not-exist");
        shutdown.cancel();
        task.await.unwrap();
    }
}
