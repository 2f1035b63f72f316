use anyhow::{ensure, Context};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use trackcore::processing::anchor_position;
use trackcore::Position;

/// Configuration for generating synthetic receiver traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub devices: usize,
    /// Correlation tags emitted per device.
    pub events: usize,
    pub distance: f64,
    /// Peak signal jitter in dB.
    pub noise: f64,
    pub seed: u64,
    /// Source ids of the virtual receivers, in anchor-role order.
    pub receivers: Vec<String>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            devices: 3,
            events: 32,
            distance: 10.0,
            noise: 2.0,
            seed: 0,
            receivers: vec!["sim-0".into(), "sim-1".into(), "sim-2".into()],
        }
    }
}

/// One line as a receiver would report it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticLine {
    pub source_id: String,
    pub line: String,
}

/// A simulated device and where it really is.
#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    pub device_id: String,
    pub position: Position,
}

pub fn synthetic_device_id(index: usize) -> String {
    let [_, _, hi, lo] = (index as u32).to_be_bytes();
    format!("02:5A:00:00:{:02X}:{:02X}", hi, lo)
}

/// Places devices uniformly inside the anchor square, away from the edges.
pub fn place_devices(config: &BeaconConfig, rng: &mut StdRng) -> Vec<SyntheticDevice> {
    let (low, high) = (0.1 * config.distance, 0.9 * config.distance);
    (0..config.devices)
        .map(|index| SyntheticDevice {
            device_id: synthetic_device_id(index),
            position: Position {
                x: rng.gen_range(low..high),
                y: rng.gen_range(low..high),
            },
        })
        .collect()
}

/// Log-distance path loss with a -30 dBm reference at one metre.
fn signal_at(device: &Position, anchor: &Position) -> f64 {
    let range = ((device.x - anchor.x).powi(2) + (device.y - anchor.y).powi(2)).sqrt();
    -30.0 - 20.0 * (1.0 + range).log10()
}

pub fn build_beacon_lines(config: &BeaconConfig) -> anyhow::Result<(Vec<SyntheticDevice>, Vec<SyntheticLine>)> {
    ensure!(config.distance > 0.0, "simulated anchor distance must be positive");
    ensure!(!config.receivers.is_empty(), "simulation needs at least one receiver");
    let line_count = config
        .devices
        .checked_mul(config.events)
        .and_then(|count| count.checked_mul(config.receivers.len()))
        .context("overflow computing synthetic line count")?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let devices = place_devices(config, &mut rng);
    let mut lines = Vec::with_capacity(line_count);

    for event in 0..config.events {
        let mut window = Vec::with_capacity(config.devices * config.receivers.len());
        for device in &devices {
            for (role, receiver) in config.receivers.iter().enumerate() {
                let anchor = anchor_position(role, config.distance).unwrap_or(Position { x: 0.0, y: 0.0 });
                let jitter = if config.noise > 0.0 {
                    rng.gen_range(-config.noise..config.noise)
                } else {
                    0.0
                };
                let strength = (signal_at(&device.position, &anchor) + jitter).round() as i32;
                window.push(SyntheticLine {
                    source_id: receiver.clone(),
                    line: format!("{} {} {:x}\n", device.device_id, strength, event),
                });
            }
        }
        // Receivers report the same advertisement in no particular order.
        window.shuffle(&mut rng);
        lines.extend(window);
    }

    Ok((devices, lines))
}
