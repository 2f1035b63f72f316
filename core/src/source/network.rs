//! TCP receiver source.
//!
//! One listener per configured port; every accepted connection is an
//! independent line stream identified by its peer address.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::source::{SourceContext, SourceError, SourceOutcome, SourceReport, MAX_LINE_BYTES};

/// A listening socket accepting receiver connections.
#[derive(Debug, Clone)]
pub struct NetworkListener {
    bind_addr: SocketAddr,
}

impl NetworkListener {
    /// Listens on all IPv4 interfaces.
    pub fn new(port: u16) -> Self {
        Self::with_bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn bind(&self) -> Result<TcpListener, SourceError> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| SourceError::BindFailure {
                addr: self.bind_addr.to_string(),
                source,
            })
    }

    pub fn spawn(self, ctx: SourceContext) -> JoinHandle<SourceReport> {
        tokio::spawn(async move {
            let listener = match self.bind().await {
                Ok(listener) => listener,
                Err(err) => {
                    log::error!("{}", err);
                    return SourceReport::new(self.bind_addr.to_string(), 0, SourceOutcome::Failed(err));
                }
            };
            serve(listener, ctx).await
        })
    }
}

/// Accepts connections until cancelled, then waits for open connections to close.
///
/// Connection failures only end that connection; the listener keeps accepting.
pub async fn serve(listener: TcpListener, ctx: SourceContext) -> SourceReport {
    let listen_id = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "tcp".to_string());
    log::info!("Listening for receivers on {}", listen_id);

    let mut connections: JoinSet<SourceReport> = JoinSet::new();
    let mut lines = 0u64;

    loop {
        tokio::select! {
            _ = ctx.cancel_token().cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("{} connected to {}", peer, listen_id);
                    connections.spawn(handle_connection(stream, peer, ctx.clone()));
                }
                Err(err) => log::warn!("accept on {} failed: {}", listen_id, err),
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                lines += settle(finished);
            }
        }
    }

    while let Some(finished) = connections.join_next().await {
        lines += settle(finished);
    }
    log::info!("Listener {} stopped after {} lines", listen_id, lines);
    SourceReport::new(listen_id, lines, SourceOutcome::Cancelled)
}

fn settle(finished: Result<SourceReport, tokio::task::JoinError>) -> u64 {
    match finished {
        Ok(report) => {
            match &report.outcome {
                SourceOutcome::Failed(err) => log::warn!("connection closed: {}", err),
                outcome => log::info!(
                    "connection {} finished after {} lines ({:?})",
                    report.source_id,
                    report.lines,
                    outcome
                ),
            }
            report.lines
        }
        Err(err) => {
            log::error!("UnknownError: connection task failed: {}", err);
            0
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: SourceContext) -> SourceReport {
    pump_async(BufReader::new(stream), &peer.to_string(), &ctx).await
}

/// Async line loop; cancellation interrupts a pending read.
///
/// Lines longer than [`MAX_LINE_BYTES`] are rejected and skipped up to the next newline.
pub async fn pump_async<R>(mut reader: R, source_id: &str, ctx: &SourceContext) -> SourceReport
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let mut lines = 0u64;
    let mut skipping = false;

    let outcome = loop {
        let mut limited = (&mut reader).take((MAX_LINE_BYTES - line.len()) as u64);
        let read = tokio::select! {
            _ = ctx.cancel_token().cancelled() => break SourceOutcome::Cancelled,
            read = limited.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => break SourceOutcome::EndOfStream,
            Ok(_) if skipping => {
                skipping = !line.ends_with(b"\n");
                line.clear();
            }
            Ok(_) if line.len() >= MAX_LINE_BYTES && !line.ends_with(b"\n") => {
                lines += 1;
                ctx.reject_overlong(&line, source_id);
                line.clear();
                skipping = true;
                if ctx.cap_reached(lines) {
                    break SourceOutcome::CapReached;
                }
            }
            Ok(_) => {
                lines += 1;
                let delivered = ctx.deliver(&line, source_id).await;
                line.clear();
                if let Err(err) = delivered {
                    break SourceOutcome::closed(source_id, err);
                }
                if ctx.cap_reached(lines) {
                    break SourceOutcome::CapReached;
                }
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
    use crate::processing::{Aggregator, AggregatorHandle, AnchorMap, RatioEstimator};
    use crate::telemetry::MetricsRecorder;
    use crate::wire::LineParser;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    fn start(anchors: AnchorMap, cap: u64) -> (SourceContext, AggregatorHandle, CancellationToken) {
        let metrics = Arc::new(MetricsRecorder::new());
        let config = EngineConfig::new(3, 10.0, anchors);
        let aggregator =
            Aggregator::new(&config, Box::new(RatioEstimator::new(10.0)), metrics.clone()).unwrap();
        let (handle, _task) = aggregator.spawn(64, CancellationToken::new());
        let cancel = CancellationToken::new();
        let ctx = SourceContext::new(
            LineParser::unfiltered(),
            handle.clone(),
            metrics,
            cap,
            cancel.clone(),
        );
        (ctx, handle, cancel)
    }

    #[tokio::test]
    async fn async_pump_reads_until_end_of_stream() {
        let (ctx, handle, _) = start(AnchorMap::new(), 0);
        let input: &[u8] = b"AA:BB:CC:DD:EE:FF -40 1\nbad line\nAA:BB:CC:DD:EE:FF -41 2";
        let report = pump_async(input, "peer", &ctx).await;
        assert!(matches!(report.outcome, SourceOutcome::EndOfStream));
        assert_eq!(report.lines, 3);
        let status = handle.status().await.unwrap();
        assert_eq!(status.metrics.accepted, 2);
        assert_eq!(status.metrics.rejected, 1);
    }

    #[tokio::test]
    async fn async_pump_honours_cap() {
        let (ctx, _, _) = start(AnchorMap::new(), 1);
        let input: &[u8] = b"AA:BB:CC:DD:EE:FF -40 1\nAA:BB:CC:DD:EE:FF -41 2\n";
        let report = pump_async(input, "peer", &ctx).await;
        assert!(matches!(report.outcome, SourceOutcome::CapReached));
        assert_eq!(report.lines, 1);
    }

    #[tokio::test]
    async fn async_pump_skips_overlong_line() {
        let (ctx, handle, _) = start(AnchorMap::new(), 0);
        let mut input = vec![b'7'; MAX_LINE_BYTES + 10];
        input.extend_from_slice(b"\nAA:BB:CC:DD:EE:FF -40 1\n");
        let report = pump_async(&input[..], "peer", &ctx).await;
        assert!(matches!(report.outcome, SourceOutcome::EndOfStream));
        assert_eq!(report.lines, 2);
        let status = handle.status().await.unwrap();
        assert_eq!(status.metrics.rejected, 1);
        assert_eq!(status.metrics.accepted, 1);
    }

    #[tokio::test]
    async fn async_pump_reports_closed_aggregator() {
        let metrics = Arc::new(MetricsRecorder::new());
        let config = EngineConfig::new(3, 10.0, AnchorMap::new());
        let aggregator =
            Aggregator::new(&config, Box::new(RatioEstimator::new(10.0)), metrics.clone()).unwrap();
        let shutdown = CancellationToken::new();
        let (handle, task) = aggregator.spawn(4, shutdown.clone());
        shutdown.cancel();
        task.await.unwrap();

        let ctx = SourceContext::new(LineParser::unfiltered(), handle, metrics, 0, CancellationToken::new());
        let input: &[u8] = b"AA:BB:CC:DD:EE:FF -40 1\n";
        let report = pump_async(input, "peer", &ctx).await;
        assert!(matches!(
            report.outcome,
            SourceOutcome::Failed(SourceError::AggregatorClosed { .. })
        ));
        assert!(report.is_failure());
    }

    #[tokio::test]
    async fn connections_from_three_peers_complete_a_group() {
        let (ctx, handle, cancel) = start(AnchorMap::new(), 0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, ctx));

        for strength in [-40, -60, -50] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(format!("AA:BB:CC:DD:EE:FF {} 1a2b3c\n", strength).as_bytes())
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        }

        let mut located = None;
        for _ in 0..100 {
            let locations = handle.locations().await.unwrap();
            if let Some(location) = locations.get("AA:BB:CC:DD:EE:FF") {
                located = Some(location.clone());
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let location = located.expect("group from three connections completes");
        assert_eq!(location.observation_count, 1);

        cancel.cancel();
        let report = server.await.unwrap();
        assert!(matches!(report.outcome, SourceOutcome::Cancelled));
        assert_eq!(report.lines, 3);
    }

    #[tokio::test]
    async fn dropped_connection_does_not_stop_listener() {
        let (ctx, handle, cancel) = start(AnchorMap::new(), 0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, ctx));

        drop(TcpStream::connect(addr).await.unwrap());
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"AA:BB:CC:DD:EE:FF -40 1\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        let mut accepted = 0;
        for _ in 0..100 {
            accepted = handle.status().await.unwrap().metrics.accepted;
            if accepted == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(accepted, 1);

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (ctx, _, _) = start(AnchorMap::new(), 0);
        let report = NetworkListener::with_bind_addr(taken.local_addr().unwrap())
            .spawn(ctx)
            .await
            .unwrap();
        assert!(report.is_open_failure());
    }
}
