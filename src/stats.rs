//! Message stream and timeout statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-stream statistics
pub struct StreamStats {
    pub messages_received: AtomicU64,
    pub messages_unhandled: AtomicU64,
    pub sagas_started: AtomicU64,
    pub sagas_continued: AtomicU64,
    pub sagas_finished: AtomicU64,
    pub handler_failures: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_unhandled: AtomicU64::new(0),
            sagas_started: AtomicU64::new(0),
            sagas_continued: AtomicU64::new(0),
            sagas_finished: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_unhandled: self.messages_unhandled.load(Ordering::Relaxed),
            sagas_started: self.sagas_started.load(Ordering::Relaxed),
            sagas_continued: self.sagas_continued.load(Ordering::Relaxed),
            sagas_finished: self.sagas_finished.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub messages_received: u64,
    pub messages_unhandled: u64,
    pub sagas_started: u64,
    pub sagas_continued: u64,
    pub sagas_finished: u64,
    pub handler_failures: u64,
}

/// Timeout manager statistics
pub struct TimeoutStats {
    pub requested: AtomicU64,
    pub fired: AtomicU64,
    pub cancelled: AtomicU64,
}

impl TimeoutStats {
    pub fn new() -> Self {
        Self {
            requested: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> TimeoutStatsSnapshot {
        TimeoutStatsSnapshot {
            requested: self.requested.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl Default for TimeoutStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeoutStatsSnapshot {
    pub requested: u64,
    pub fired: u64,
    pub cancelled: u64,
}
