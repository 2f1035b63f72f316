use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::prelude::ArchiveError;
use crate::wire::{CorrelationTag, Reading};

/// A reading as stored in the raw-reading archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedReading {
    pub signal_strength: i32,
    pub observed_at: f64,
    pub source_id: String,
}

impl From<&Reading> for ArchivedReading {
    fn from(reading: &Reading) -> Self {
        Self {
            signal_strength: reading.signal_strength,
            observed_at: reading.observed_at,
            source_id: reading.source_id.clone(),
        }
    }
}

/// Older exports stored each reading as `[strength, observedAt, source]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ArchivedEntry {
    Record(ArchivedReading),
    Tuple(i32, f64, String),
}

impl From<ArchivedEntry> for ArchivedReading {
    fn from(entry: ArchivedEntry) -> Self {
        match entry {
            ArchivedEntry::Record(reading) => reading,
            ArchivedEntry::Tuple(signal_strength, observed_at, source_id) => Self {
                signal_strength,
                observed_at,
                source_id,
            },
        }
    }
}

type ArchiveMap = BTreeMap<String, BTreeMap<String, Vec<ArchivedReading>>>;

/// `deviceId -> correlationTag -> readings` history of everything ingested.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RawArchive {
    devices: ArchiveMap,
}

impl<'de> Deserialize<'de> for RawArchive {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, BTreeMap<String, Vec<ArchivedEntry>>>::deserialize(deserializer)?;
        let devices = raw
            .into_iter()
            .map(|(device, tags)| {
                let tags = tags
                    .into_iter()
                    .map(|(tag, entries)| (tag, entries.into_iter().map(Into::into).collect()))
                    .collect();
                (device, tags)
            })
            .collect();
        Ok(Self { devices })
    }
}

impl RawArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, device_id: &str, tag: &CorrelationTag, readings: &[Reading]) {
        self.devices
            .entry(device_id.to_string())
            .or_default()
            .entry(tag.as_str().to_string())
            .or_default()
            .extend(readings.iter().map(ArchivedReading::from));
    }

    /// Appends readings from `other` that are not already archived. Returns how many were added.
    pub fn merge(&mut self, other: RawArchive) -> usize {
        let mut added = 0;
        for (device, tags) in other.devices {
            let local_tags = self.devices.entry(device).or_default();
            for (tag, readings) in tags {
                let local = local_tags.entry(tag).or_default();
                for reading in readings {
                    if !local.contains(&reading) {
                        local.push(reading);
                        added += 1;
                    }
                }
            }
        }
        added
    }

    pub fn readings(&self, device_id: &str, tag: &str) -> Option<&[ArchivedReading]> {
        self.devices
            .get(device_id)
            .and_then(|tags| tags.get(tag))
            .map(Vec::as_slice)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn reading_count(&self) -> usize {
        self.devices
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ArchiveError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| ArchiveError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).map_err(|source| ArchiveError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}
