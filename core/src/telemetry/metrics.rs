use serde::Serialize;
use std::sync::Mutex;

/// Counters shared by every producer and the aggregation task.
pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub lines: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub rejected: u64,
    pub ambiguous: u64,
    pub completed: u64,
    pub estimated: u64,
    pub estimation_failures: u64,
    pub expired: u64,
    pub unknown: u64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    fn bump(&self, field: impl FnOnce(&mut MetricsSnapshot) -> &mut u64) {
        if let Ok(mut metrics) = self.inner.lock() {
            *field(&mut *metrics) += 1;
        }
    }

    pub fn record_line(&self) {
        self.bump(|m| &mut m.lines);
    }

    pub fn record_accepted(&self) {
        self.bump(|m| &mut m.accepted);
    }

    pub fn record_filtered(&self) {
        self.bump(|m| &mut m.filtered);
    }

    pub fn record_rejected(&self) {
        self.bump(|m| &mut m.rejected);
    }

    pub fn record_ambiguous(&self) {
        self.bump(|m| &mut m.ambiguous);
    }

    pub fn record_completed(&self) {
        self.bump(|m| &mut m.completed);
    }

    pub fn record_estimated(&self) {
        self.bump(|m| &mut m.estimated);
    }

    pub fn record_estimation_failure(&self) {
        self.bump(|m| &mut m.estimation_failures);
    }

    pub fn record_expired(&self) {
        self.bump(|m| &mut m.expired);
    }

    pub fn record_unknown(&self) {
        self.bump(|m| &mut m.unknown);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            *metrics
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counters_start_at_zero() {
        assert_eq!(MetricsRecorder::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = Arc::new(MetricsRecorder::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        metrics.record_line();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(metrics.snapshot().lines, 1000);
    }
}
