//! Sub-pool statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time occupancy of a sub-pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Maximum concurrently checked-out handles
    pub capacity: usize,
    /// Capacity not currently checked out
    pub free: usize,
    /// Cached idle handles
    pub idle: usize,
    /// Handles currently lent out
    pub checked_out: usize,
}

/// Cumulative sub-pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Handles constructed and connected
    pub connectors_created: u64,
    /// Handles disconnected or lost
    pub connectors_closed: u64,
    /// Successful checkouts
    pub acquisitions: u64,
    /// Checkouts that had to wait for capacity
    pub waits: u64,
    /// Total time spent waiting for capacity (milliseconds)
    pub total_wait_time_ms: u64,
    /// Idle handles discarded for a changed type or configuration
    pub stale_discards: u64,
    /// Failed idle polls
    pub poll_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connectors_created: AtomicU64,
    pub connectors_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub waits: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub stale_discards: AtomicU64,
    pub poll_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handle creation
    pub fn record_created(&self) {
        self.connectors_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handle close
    pub fn record_closed(&self) {
        self.connectors_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checkout
    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a wait for capacity
    pub fn record_wait(&self, wait_time_ms: u64) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record a stale-handle discard
    pub fn record_stale_discard(&self) {
        self.stale_discards.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed poll
    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connectors_created: self.connectors_created.load(Ordering::Relaxed),
            connectors_closed: self.connectors_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
        }
    }

    /// Average wait in milliseconds over the checkouts that waited
    pub fn avg_wait_time_ms(&self) -> f64 {
        let waits = self.waits.load(Ordering::Relaxed);
        if waits == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / waits as f64
        }
    }
}
