use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::prelude::StoreError;
use crate::processing::anchors::AnchorMap;
use crate::wire::{CorrelationTag, Reading};

/// How the readings of a completed group were ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrdering {
    /// Every reading mapped to a distinct anchor role; index == role.
    AnchorRoles,
    /// Roles could not be recovered; readings are in arrival order.
    Arrival,
}

/// A group that reached the configured receiver count.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedGroup {
    pub device_id: String,
    pub tag: CorrelationTag,
    pub readings: Vec<Reading>,
    pub ordering: GroupOrdering,
}

/// A group removed from the store before completing.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleGroup {
    pub device_id: String,
    pub tag: CorrelationTag,
    pub readings: Vec<Reading>,
    pub age: Duration,
}

struct PendingGroup {
    readings: Vec<Reading>,
    opened_at: Instant,
}

/// Live incomplete groups keyed by device and correlation tag.
pub struct CorrelationStore {
    receivers: usize,
    anchors: AnchorMap,
    groups: HashMap<String, HashMap<CorrelationTag, PendingGroup>>,
}

impl CorrelationStore {
    pub fn new(receivers: usize, anchors: AnchorMap) -> Self {
        Self {
            receivers,
            anchors,
            groups: HashMap::new(),
        }
    }

    pub fn receivers(&self) -> usize {
        self.receivers
    }

    pub fn ingest(&mut self, reading: Reading) -> Result<Option<CompletedGroup>, StoreError> {
        self.ingest_at(reading, Instant::now())
    }

    /// Appends `reading` to its group and evicts the group once it is complete.
    pub fn ingest_at(
        &mut self,
        reading: Reading,
        now: Instant,
    ) -> Result<Option<CompletedGroup>, StoreError> {
        let anchors = &self.anchors;
        let role = anchors.role_of(&reading.source_id);
        let device_groups = self.groups.entry(reading.device_id.clone()).or_default();
        let group = device_groups
            .entry(reading.tag.clone())
            .or_insert_with(|| PendingGroup {
                readings: Vec::with_capacity(self.receivers),
                opened_at: now,
            });

        // Two sources sharing an anchor role (e.g. two connections from one host)
        // cannot both belong to a group.
        if group.readings.iter().any(|existing| {
            existing.source_id == reading.source_id
                || (role.is_some() && anchors.role_of(&existing.source_id) == role)
        }) {
            return Err(StoreError::AmbiguousGroupMembership {
                device_id: reading.device_id,
                tag: reading.tag.to_string(),
                source_id: reading.source_id,
            });
        }

        group.readings.push(reading);
        if group.readings.len() < self.receivers {
            return Ok(None);
        }

        let device_id = group.readings[0].device_id.clone();
        let tag = group.readings[0].tag.clone();
        let readings = self
            .take(&device_id, &tag)
            .map(|pending| pending.readings)
            .unwrap_or_default();
        let (readings, ordering) = self.arrange(readings);

        Ok(Some(CompletedGroup {
            device_id,
            tag,
            readings,
            ordering,
        }))
    }

    /// Drops groups that have been incomplete for longer than `max_age`.
    pub fn expire(&mut self, max_age: Duration, now: Instant) -> Vec<StaleGroup> {
        let mut stale = Vec::new();
        for (device_id, device_groups) in self.groups.iter_mut() {
            device_groups.retain(|tag, group| {
                let age = now.saturating_duration_since(group.opened_at);
                if age <= max_age {
                    return true;
                }
                stale.push(StaleGroup {
                    device_id: device_id.clone(),
                    tag: tag.clone(),
                    readings: std::mem::take(&mut group.readings),
                    age,
                });
                false
            });
        }
        self.groups.retain(|_, device_groups| !device_groups.is_empty());
        stale
    }

    /// Empties the store, returning every pending group.
    pub fn drain(&mut self, now: Instant) -> Vec<StaleGroup> {
        self.groups
            .drain()
            .flat_map(|(device_id, device_groups)| {
                device_groups.into_iter().map(move |(tag, group)| StaleGroup {
                    device_id: device_id.clone(),
                    tag,
                    age: now.saturating_duration_since(group.opened_at),
                    readings: group.readings,
                })
            })
            .collect()
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.values().map(HashMap::len).sum()
    }

    pub fn contains(&self, device_id: &str, tag: &CorrelationTag) -> bool {
        self.groups
            .get(device_id)
            .is_some_and(|device_groups| device_groups.contains_key(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn take(&mut self, device_id: &str, tag: &CorrelationTag) -> Option<PendingGroup> {
        let device_groups = self.groups.get_mut(device_id)?;
        let group = device_groups.remove(tag);
        if device_groups.is_empty() {
            self.groups.remove(device_id);
        }
        group
    }

    fn arrange(&self, readings: Vec<Reading>) -> (Vec<Reading>, GroupOrdering) {
        let mut slots: Vec<Option<usize>> = vec![None; readings.len()];
        for (index, reading) in readings.iter().enumerate() {
            match self.anchors.role_of(&reading.source_id) {
                Some(role) if role < slots.len() && slots[role].is_none() => {
                    slots[role] = Some(index);
                }
                _ => return (readings, GroupOrdering::Arrival),
            }
        }

        let mut taken: Vec<Option<Reading>> = readings.into_iter().map(Some).collect();
        let ordered = slots
            .into_iter()
            .flatten()
            .filter_map(|index| taken[index].take())
            .collect();
        (ordered, GroupOrdering::AnchorRoles)
    }
}
