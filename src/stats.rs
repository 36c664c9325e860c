//! Acquisition counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct AcquisitionStats {
    notifications: AtomicU64,
    batches: AtomicU64,
    samples: AtomicU64,
    malformed: AtomicU64,
    unroutable: AtomicU64,
    command_results: AtomicU64,
    overflows: AtomicU64,
}

/// Point-in-time copy of [`AcquisitionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub notifications: u64,
    pub batches: u64,
    pub samples: u64,
    pub malformed: u64,
    pub unroutable: u64,
    pub command_results: u64,
    pub overflows: u64,
}

impl AcquisitionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, samples: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_command_result(&self) {
        self.command_results.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            notifications: self.notifications.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            command_results: self.command_results.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Notifications that were dropped rather than delivered.
    pub fn dropped(&self) -> u64 {
        self.malformed + self.unroutable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = AcquisitionStats::new();
        stats.record_notification();
        stats.record_notification();
        stats.record_batch(8);
        stats.record_unroutable();

        let snap = stats.snapshot();
        assert_eq!(snap.notifications, 2);
        assert_eq!(snap.batches, 1);
        assert_eq!(snap.samples, 8);
        assert_eq!(snap.unroutable, 1);
        assert_eq!(snap.dropped(), 1);

        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["samples"], 8);
    }
}
