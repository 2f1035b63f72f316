//! Single owner of the correlation store.
//!
//! Producers never touch the store directly. They post readings into one
//! bounded channel and a dedicated task applies them one at a time, so group
//! completion is decided by exactly one `ingest` call.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::prelude::{
    AggregatorError, ArchiveError, ConfigError, EngineConfig, PositionEstimator, StoreError,
    ANCHOR_ROLES,
};
use crate::processing::store::{CompletedGroup, CorrelationStore, GroupOrdering};
use crate::records::{DeviceLocation, LocationTable, RawArchive};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use crate::wire::Reading;

/// Default depth of the reading queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Messages accepted by the aggregation task.
pub enum AggregatorCommand {
    Reading(Reading),
    MergeArchive {
        archive: RawArchive,
        reply: oneshot::Sender<usize>,
    },
    Locations(oneshot::Sender<LocationTable>),
    Archive(oneshot::Sender<RawArchive>),
    Status(oneshot::Sender<StatusReport>),
}

/// Lightweight view of the aggregation state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub receivers: usize,
    pub estimator: &'static str,
    pub pending_groups: usize,
    pub located_devices: usize,
    pub archived_readings: usize,
    pub metrics: MetricsSnapshot,
}

/// Final state handed back when the aggregation task stops.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub locations: LocationTable,
    pub archive: RawArchive,
    pub metrics: MetricsSnapshot,
    /// Incomplete groups moved into the archive at shutdown.
    pub flushed_groups: usize,
}

pub struct Aggregator {
    store: CorrelationStore,
    estimator: Box<dyn PositionEstimator>,
    locations: LocationTable,
    archive: RawArchive,
    metrics: Arc<MetricsRecorder>,
    expire_after: Option<Duration>,
    logger: LogManager,
}

impl Aggregator {
    pub fn new(
        config: &EngineConfig,
        estimator: Box<dyn PositionEstimator>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let logger = LogManager::new("aggregator");

        if config.receivers != ANCHOR_ROLES {
            log::warn!(
                "{} receivers configured but the {} estimator needs {}; groups will not be located",
                config.receivers,
                estimator.name(),
                ANCHOR_ROLES
            );
        }
        if config.anchors.len() < config.receivers {
            log::warn!(
                "only {} of {} receivers have an anchor role; affected groups use arrival order",
                config.anchors.len(),
                config.receivers
            );
        }
        for (source, role) in config.anchors.iter() {
            logger.record(&format!("anchor role {} -> {}", role, source));
        }

        Ok(Self {
            store: CorrelationStore::new(config.receivers, config.anchors.clone()),
            estimator,
            locations: LocationTable::new(),
            archive: RawArchive::new(),
            metrics,
            expire_after: config.expire_after(),
            logger,
        })
    }

    /// Applies one reading; returns the new location if it completed a group.
    pub fn ingest(&mut self, reading: Reading) -> Option<DeviceLocation> {
        self.ingest_at(reading, Instant::now())
    }

    pub fn ingest_at(&mut self, reading: Reading, now: Instant) -> Option<DeviceLocation> {
        match self.store.ingest_at(reading, now) {
            Ok(None) => None,
            Ok(Some(group)) => self.complete(group),
            Err(err @ StoreError::AmbiguousGroupMembership { .. }) => {
                self.metrics.record_ambiguous();
                log::warn!("[aggregator] AmbiguousGroupMembership: {}", err);
                None
            }
        }
    }

    fn complete(&mut self, group: CompletedGroup) -> Option<DeviceLocation> {
        self.metrics.record_completed();
        self.archive
            .record(&group.device_id, &group.tag, &group.readings);

        if group.ordering == GroupOrdering::Arrival {
            log::warn!(
                "[aggregator] anchor roles unknown for {}/{}, estimating in arrival order",
                group.device_id,
                group.tag
            );
        }

        match self.estimator.estimate(&group) {
            Ok(position) if position.x.is_finite() && position.y.is_finite() => {
                self.metrics.record_estimated();
                let location = self.locations.record(&group.device_id, position);
                self.logger.trace(&format!(
                    "device {} is at {:.3} {:.3} (observation {})",
                    location.device_id, location.x, location.y, location.observation_count
                ));
                Some(location)
            }
            Ok(position) => {
                self.metrics.record_unknown();
                self.logger.dropped_group(
                    &group.device_id,
                    group.tag.as_str(),
                    &group.readings,
                    &format!("UnknownError: non-finite estimate {:?}", position),
                );
                None
            }
            Err(err) => {
                self.metrics.record_estimation_failure();
                self.logger
                    .dropped_group(&group.device_id, group.tag.as_str(), &group.readings, &err);
                None
            }
        }
    }

    /// Drops groups older than the configured expiry age. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let Some(max_age) = self.expire_after else {
            return 0;
        };
        let stale = self.store.expire(max_age, now);
        for group in &stale {
            self.metrics.record_expired();
            self.logger.dropped_group(
                &group.device_id,
                group.tag.as_str(),
                &group.readings,
                &format!("incomplete after {:.1}s", group.age.as_secs_f64()),
            );
        }
        stale.len()
    }

    /// Merges a previously exported archive into the local one.
    pub fn merge_archive(&mut self, archive: RawArchive) -> usize {
        let added = self.archive.merge(archive);
        self.logger
            .record(&format!("merged {} archived readings", added));
        added
    }

    pub fn locations(&self) -> &LocationTable {
        &self.locations
    }

    pub fn archive(&self) -> &RawArchive {
        &self.archive
    }

    pub fn pending_groups(&self) -> usize {
        self.store.pending_groups()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            receivers: self.store.receivers(),
            estimator: self.estimator.name(),
            pending_groups: self.store.pending_groups(),
            located_devices: self.locations.len(),
            archived_readings: self.archive.reading_count(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Moves pending groups into the archive and returns the final state.
    pub fn finish(mut self) -> Snapshot {
        let pending = self.store.drain(Instant::now());
        for group in &pending {
            self.archive
                .record(&group.device_id, &group.tag, &group.readings);
        }
        if !pending.is_empty() {
            self.logger.record(&format!(
                "archived {} incomplete groups at shutdown",
                pending.len()
            ));
        }
        Snapshot {
            locations: self.locations,
            archive: self.archive,
            metrics: self.metrics.snapshot(),
            flushed_groups: pending.len(),
        }
    }

    /// Starts the aggregation task.
    ///
    /// The task stops when `shutdown` fires (after draining queued commands) or
    /// when every handle has been dropped.
    pub fn spawn(
        self,
        queue_depth: usize,
        shutdown: CancellationToken,
    ) -> (AggregatorHandle, JoinHandle<Snapshot>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let task = tokio::spawn(self.run(rx, shutdown));
        (AggregatorHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<AggregatorCommand>,
        shutdown: CancellationToken,
    ) -> Snapshot {
        let mut sweep = self.expire_after.map(|age| {
            let mut interval = time::interval(sweep_period(age));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        self.logger.record(&format!(
            "aggregating groups of {} with the {} estimator",
            self.store.receivers(),
            self.estimator.name()
        ));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(command) = rx.recv().await {
                        self.apply(command);
                    }
                    break;
                }
                command = rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = next_sweep(&mut sweep) => {
                    self.expire(time::Instant::now().into_std());
                }
            }
        }

        let snapshot = self.finish();
        log::info!(
            "[aggregator] stopped: {} completed, {} located devices",
            snapshot.metrics.completed,
            snapshot.locations.len()
        );
        snapshot
    }

    fn apply(&mut self, command: AggregatorCommand) {
        match command {
            AggregatorCommand::Reading(reading) => {
                // Same clock as the sweep interval.
                self.ingest_at(reading, time::Instant::now().into_std());
            }
            AggregatorCommand::MergeArchive { archive, reply } => {
                let _ = reply.send(self.merge_archive(archive));
            }
            AggregatorCommand::Locations(reply) => {
                let _ = reply.send(self.locations.clone());
            }
            AggregatorCommand::Archive(reply) => {
                let _ = reply.send(self.archive.clone());
            }
            AggregatorCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn sweep_period(max_age: Duration) -> Duration {
    (max_age / 4).max(Duration::from_millis(100))
}

/// Cloneable entry point into the aggregation task.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    pub async fn submit(&self, reading: Reading) -> Result<(), AggregatorError> {
        self.tx
            .send(AggregatorCommand::Reading(reading))
            .await
            .map_err(|_| AggregatorError::Closed)
    }

    /// Submits from a blocking thread. Must not be called from async context.
    pub fn blocking_submit(&self, reading: Reading) -> Result<(), AggregatorError> {
        self.tx
            .blocking_send(AggregatorCommand::Reading(reading))
            .map_err(|_| AggregatorError::Closed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> AggregatorCommand,
    ) -> Result<T, AggregatorError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| AggregatorError::Closed)?;
        response.await.map_err(|_| AggregatorError::Closed)
    }

    pub async fn locations(&self) -> Result<LocationTable, AggregatorError> {
        self.request(AggregatorCommand::Locations).await
    }

    pub async fn archive(&self) -> Result<RawArchive, AggregatorError> {
        self.request(AggregatorCommand::Archive).await
    }

    pub async fn status(&self) -> Result<StatusReport, AggregatorError> {
        self.request(AggregatorCommand::Status).await
    }

    pub async fn merge_archive(&self, archive: RawArchive) -> Result<usize, AggregatorError> {
        self.request(|reply| AggregatorCommand::MergeArchive { archive, reply })
            .await
    }

    /// Loads an exported archive file and merges it into local state.
    ///
    /// File I/O happens on the caller's task, outside the aggregation loop.
    pub async fn ingest_archive<P: AsRef<Path>>(&self, path: P) -> Result<usize, ArchiveError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ArchiveError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let archive = RawArchive::from_json(&bytes)?;
        Ok(self.merge_archive(archive).await?)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
