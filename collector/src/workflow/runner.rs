use crate::generator::profile::{build_beacon_lines, BeaconConfig, SyntheticDevice};
use crate::gui_bridge::bridge::StatusBridge;
use crate::gui_bridge::model::LayoutModel;
use crate::workflow::config::CollectorConfig;
use crate::workflow::remote::RemoteFetcher;
use anyhow::Context;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trackcore::processing::{Aggregator, AggregatorHandle, RatioEstimator, Snapshot};
use trackcore::source::{SourceContext, SourceReport};
use trackcore::telemetry::MetricsRecorder;
use trackcore::wire::LineParser;
use trackcore::{AnchorMap, EngineConfig};

pub struct RunSummary {
    pub snapshot: Snapshot,
    pub reports: Vec<SourceReport>,
}

impl RunSummary {
    pub fn open_failures(&self) -> usize {
        self.reports.iter().filter(|report| report.is_open_failure()).count()
    }
}

pub struct SimulationSummary {
    pub snapshot: Snapshot,
    pub devices: Vec<SyntheticDevice>,
}

#[derive(Clone)]
pub struct Runner {
    config: CollectorConfig,
}

impl Runner {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    fn start_aggregator(
        &self,
        engine: &EngineConfig,
    ) -> anyhow::Result<(AggregatorHandle, JoinHandle<Snapshot>, CancellationToken, Arc<MetricsRecorder>)> {
        let metrics = Arc::new(MetricsRecorder::new());
        let estimator = Box::new(RatioEstimator::new(engine.distance));
        let aggregator = Aggregator::new(engine, estimator, metrics.clone())
            .context("initializing aggregator")?;
        let stop = CancellationToken::new();
        let (handle, task) = aggregator.spawn(self.config.queue_depth, stop.clone());
        Ok((handle, task, stop, metrics))
    }

    /// Runs every configured source until all have stopped or `shutdown` fires,
    /// then drains the aggregator and persists the outputs.
    pub async fn execute(&self, shutdown: CancellationToken) -> anyhow::Result<RunSummary> {
        let engine = self.config.to_engine_config()?;
        let (handle, aggregator_task, aggregator_stop, metrics) = self.start_aggregator(&engine)?;
        let background = shutdown.child_token();

        let mut services = Vec::new();
        if let Some(addr) = self.config.http {
            let bridge = StatusBridge::new(addr, LayoutModel::from_engine(&engine));
            let (_, server) = bridge.spawn(handle.clone(), background.clone())?;
            services.push(server);
        }
        if !self.config.remotes.is_empty() {
            match &self.config.location {
                Some(location) => {
                    for peer in &self.config.remotes {
                        let fetcher = RemoteFetcher::new(peer.clone(), location.clone());
                        services.push(fetcher.spawn(handle.clone(), background.clone()));
                    }
                }
                None => log::warn!("--remote given without --location; remote archives are not fetched"),
            }
        }

        let parser = LineParser::new(self.config.filters.iter().cloned());
        let ctx = SourceContext::new(
            parser,
            handle.clone(),
            metrics,
            self.config.counter,
            shutdown.child_token(),
        );
        let sources = self.config.sources();
        if sources.is_empty() {
            log::warn!("No serial ports or network ports configured");
        }
        let tasks: Vec<_> = sources
            .into_iter()
            .map(|source| {
                log::info!("Starting source {}", source.id());
                source.spawn(ctx.clone())
            })
            .collect();
        drop(ctx);

        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(report) => {
                    if report.is_failure() {
                        log::error!("Source {} failed: {:?}", report.source_id, report.outcome);
                    } else {
                        log::info!(
                            "Source {} stopped after {} lines ({:?})",
                            report.source_id,
                            report.lines,
                            report.outcome
                        );
                    }
                    reports.push(report);
                }
                Err(err) => log::error!("UnknownError: source task failed: {}", err),
            }
        }
        log::info!("All sources stopped");

        background.cancel();
        for service in services {
            if let Err(err) = service.await {
                log::error!("UnknownError: background task failed: {}", err);
            }
        }
        drop(handle);

        aggregator_stop.cancel();
        let snapshot = aggregator_task.await.context("joining aggregator task")?;
        self.persist(&snapshot)?;
        Ok(RunSummary { snapshot, reports })
    }

    /// Feeds generated traffic through the same parse and aggregation path.
    pub async fn simulate(&self, beacons: &BeaconConfig) -> anyhow::Result<SimulationSummary> {
        let (devices, lines) = build_beacon_lines(beacons)?;
        let mut engine = EngineConfig::new(
            beacons.receivers.len(),
            beacons.distance,
            AnchorMap::from_ordered(beacons.receivers.iter().cloned()),
        );
        engine.expire_after_secs = self.config.expire_secs;
        let (handle, aggregator_task, aggregator_stop, metrics) = self.start_aggregator(&engine)?;

        let ctx = SourceContext::new(
            LineParser::new(self.config.filters.iter().cloned()),
            handle,
            metrics,
            0,
            CancellationToken::new(),
        );
        for line in &lines {
            ctx.deliver(line.line.as_bytes(), &line.source_id)
                .await
                .context("submitting simulated line")?;
        }
        drop(ctx);

        aggregator_stop.cancel();
        let snapshot = aggregator_task.await.context("joining aggregator task")?;
        self.persist(&snapshot)?;
        Ok(SimulationSummary { snapshot, devices })
    }

    fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        if let Some(path) = &self.config.json {
            snapshot
                .archive
                .save(path)
                .with_context(|| format!("writing archive {}", path.display()))?;
            log::info!(
                "Wrote {} readings for {} devices to {}",
                snapshot.archive.reading_count(),
                snapshot.archive.device_count(),
                path.display()
            );
        }
        if let Some(path) = &self.config.locations {
            snapshot
                .locations
                .save(path)
                .with_context(|| format!("writing locations {}", path.display()))?;
            log::info!("Wrote {} locations to {}", snapshot.locations.len(), path.display());
        }
        Ok(())
    }
}
