use std::sync::atomic::{AtomicU64, Ordering};

use crate::queue::InsertOutcome;

#[derive(Default)]
pub(crate) struct QueueStats {
    queued: AtomicU64,
    dropped_disconnected: AtomicU64,
    dropped_draining: AtomicU64,
    delivered: AtomicU64,
    too_small: AtomicU64,
}

impl QueueStats {
    pub(crate) fn record_insert(&self, outcome: InsertOutcome) {
        let counter = match outcome {
            InsertOutcome::Queued => &self.queued,
            InsertOutcome::DroppedDisconnected => &self.dropped_disconnected,
            InsertOutcome::DroppedDraining => &self.dropped_draining,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_too_small(&self) {
        self.too_small.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dropped_disconnected: self.dropped_disconnected.load(Ordering::Relaxed),
            dropped_draining: self.dropped_draining.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            too_small: self.too_small.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the queue's lifetime counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub queued: u64,
    pub dropped_disconnected: u64,
    pub dropped_draining: u64,
    pub delivered: u64,
    pub too_small: u64,
}
