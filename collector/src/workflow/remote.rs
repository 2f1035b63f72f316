use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trackcore::AggregatorHandle;

/// Wait between successful fetches.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Doubling retry delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

/// Periodically copies a peer collector's archive and merges it.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    peer: String,
    remote_path: String,
    target: PathBuf,
    program: String,
    refresh: Duration,
}

impl RemoteFetcher {
    pub fn new(peer: impl Into<String>, remote_path: impl Into<String>) -> Self {
        let peer = peer.into();
        Self {
            target: PathBuf::from(format!("./export_{}.json", peer)),
            peer,
            remote_path: remote_path.into(),
            program: "scp".to_string(),
            refresh: REFRESH_INTERVAL,
        }
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn remote_spec(&self) -> String {
        format!("root@{}:{}", self.peer, self.remote_path)
    }

    /// Copies the remote archive over the local target.
    pub async fn fetch_once(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.target).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("clearing {}", self.target.display()))
            }
        }
        let status = Command::new(&self.program)
            .arg("-q")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.remote_spec())
            .arg(&self.target)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("running {} for {}", self.program, self.peer))?;
        if !status.success() {
            bail!("{} from {} exited with {}", self.program, self.peer, status);
        }
        Ok(())
    }

    pub fn spawn(self, handle: AggregatorHandle, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(handle, cancel))
    }

    async fn run(self, handle: AggregatorHandle, cancel: CancellationToken) {
        let mut backoff = Backoff::default();
        log::info!(
            "Fetching archives from {} into {} every {:?}",
            self.peer,
            self.target().display(),
            self.refresh
        );

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.fetch_once() => fetched,
            };

            let delay = match fetched {
                Ok(()) => match handle.ingest_archive(&self.target).await {
                    Ok(added) => {
                        log::info!("Merged {} readings from {}", added, self.peer);
                        backoff.reset();
                        self.refresh
                    }
                    Err(err) if handle.is_closed() => {
                        log::info!("Aggregator closed, stopping fetch from {}: {}", self.peer, err);
                        break;
                    }
                    Err(err) => {
                        log::warn!("Archive from {} unusable: {}", self.peer, err);
                        backoff.next_delay()
                    }
                },
                Err(err) => {
                    let delay = backoff.next_delay();
                    log::warn!("Fetch from {} failed, retrying in {:?}: {:#}", self.peer, delay, err);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::info!("Stopped fetching from {}", self.peer);
    }
}
