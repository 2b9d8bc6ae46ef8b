//! Metrics for the lock manager and connector pool
//!
//! Uses the `metrics` crate facade; without an installed recorder every call is a no-op.
//!
//! # Metric Naming Convention
//!
//! - `weft_lock_*` - lock manager and global lock registry
//! - `weft_pool_*` - connector pool

use std::time::Duration;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};

// ============================================================================
// Lock Metrics
// ============================================================================

/// Lock manager metrics
pub struct LockMetrics;

impl LockMetrics {
    /// Global primitive acquisitions by tier
    pub fn increment_acquired(tier: &'static str) {
        metrics::counter!("weft_lock_acquired_total", "tier" => tier).increment(1);
    }

    /// No-wait attempts that hit contention
    pub fn increment_unavailable() {
        metrics::counter!("weft_lock_unavailable_total").increment(1);
    }

    /// Operations that raced with an expired lock object and were retried
    pub fn increment_expired_retries() {
        metrics::counter!("weft_lock_expired_retries_total").increment(1);
    }

    /// Bulk acquisitions that had to unwind
    pub fn increment_bulk_unwinds() {
        metrics::counter!("weft_lock_bulk_unwinds_total").increment(1);
    }

    /// Time spent blocked waiting for a lock
    pub fn record_wait(wait: Duration) {
        metrics::histogram!("weft_lock_wait_seconds").record(wait.as_secs_f64());
    }

    /// Live lock objects in a registry
    pub fn set_live_objects(namespace: &'static str, count: usize) {
        metrics::gauge!("weft_lock_live_objects", "namespace" => namespace).set(count as f64);
    }
}

// ============================================================================
// Pool Metrics
// ============================================================================

/// Connector pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    /// Connector handles constructed
    pub fn increment_created(connection: &str) {
        metrics::counter!("weft_pool_connectors_created_total", "connection" => connection.to_string())
            .increment(1);
    }

    /// Connector handles disconnected and discarded
    pub fn increment_closed(connection: &str) {
        metrics::counter!("weft_pool_connectors_closed_total", "connection" => connection.to_string())
            .increment(1);
    }

    /// Idle handles discarded because their configuration no longer matched
    pub fn increment_stale_discards(connection: &str) {
        metrics::counter!("weft_pool_stale_discards_total", "connection" => connection.to_string())
            .increment(1);
    }

    /// Time an acquirer spent blocked on an exhausted pool
    pub fn record_acquire_wait(connection: &str, wait: Duration) {
        metrics::histogram!("weft_pool_acquire_wait_seconds", "connection" => connection.to_string())
            .record(wait.as_secs_f64());
    }

    /// Handles currently checked out
    pub fn set_checked_out(connection: &str, count: usize) {
        metrics::gauge!("weft_pool_checked_out", "connection" => connection.to_string())
            .set(count as f64);
    }

    /// Number of live sub-pools
    pub fn set_pool_count(count: usize) {
        metrics::gauge!("weft_pool_pools").set(count as f64);
    }
}
