use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use trackcore::prelude::{ConfigError, EngineConfig};
use trackcore::processing::{AnchorMap, DEFAULT_QUEUE_DEPTH};
use trackcore::source::serial::DEFAULT_BAUD;
use trackcore::source::{NetworkListener, ReceiverSource, SerialSource, DEFAULT_LINE_CAP};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub verbose: bool,
    pub baud: u32,
    /// Device allow-list; empty accepts every device.
    pub filters: Vec<String>,
    /// Serial device paths.
    pub ports: Vec<String>,
    /// TCP listen ports.
    pub network: Vec<u16>,
    pub distance: f64,
    /// Lines per source before it stops; 0 is unbounded.
    pub counter: u64,
    /// Raw-reading archive output.
    pub json: Option<PathBuf>,
    /// Location table output.
    pub locations: Option<PathBuf>,
    pub remotes: Vec<String>,
    /// Archive path on the remote collectors.
    pub location: Option<String>,
    /// `<source>=<role>` entries.
    pub anchors: Vec<String>,
    pub receivers: Option<usize>,
    pub expire_secs: u64,
    pub http: Option<SocketAddr>,
    pub queue_depth: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            baud: DEFAULT_BAUD,
            filters: Vec::new(),
            ports: Vec::new(),
            network: Vec::new(),
            distance: 10.0,
            counter: DEFAULT_LINE_CAP,
            json: None,
            locations: None,
            remotes: Vec::new(),
            location: None,
            anchors: Vec::new(),
            receivers: None,
            expire_secs: 0,
            http: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl CollectorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading collector config {}", path_ref.display()))?;
        let config: CollectorConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing collector config {}", path_ref.display()))?;
        Ok(config)
    }

    /// Explicit anchors win; otherwise serial ports take roles in the order given.
    pub fn anchor_map(&self) -> Result<AnchorMap, ConfigError> {
        if self.anchors.is_empty() {
            return Ok(AnchorMap::from_ordered(self.ports.iter().cloned()));
        }
        let mut anchors = AnchorMap::new();
        for spec in &self.anchors {
            let (source, role) = AnchorMap::parse_entry(spec)?;
            anchors.assign(source, role)?;
        }
        if let Some(port) = self.ports.iter().find(|port| anchors.role_of(port).is_none()) {
            return Err(ConfigError::UnanchoredSource(port.clone()));
        }
        Ok(anchors)
    }

    pub fn to_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let anchors = self.anchor_map().context("resolving anchor roles")?;
        let receivers = self.receivers.unwrap_or(anchors.len());
        let mut engine = EngineConfig::new(receivers, self.distance, anchors);
        engine.expire_after_secs = self.expire_secs;
        engine.validate().with_context(|| {
            if self.ports.is_empty() && self.receivers.is_none() {
                "validating engine config (network-only setups need --receivers)".to_string()
            } else {
                "validating engine config".to_string()
            }
        })?;
        Ok(engine)
    }

    pub fn sources(&self) -> Vec<ReceiverSource> {
        let serial = self
            .ports
            .iter()
            .map(|path| ReceiverSource::Serial(SerialSource::new(path.clone(), self.baud)));
        let network = self
            .network
            .iter()
            .map(|port| ReceiverSource::Network(NetworkListener::new(*port)));
        serial.chain(network).collect()
    }
}
