//! Per-connection sub-pool
//!
//! A [`Pool`] caches handles for one connection name. `free` counts capacity that is
//! not checked out; it is NOT the number of idle handles. Idle handles are an
//! optimization on top of that budget, which is why flushing them never changes
//! `free`.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use weft_core::metrics::PoolMetrics;
use weft_core::{Error, Result, ThreadContext};
use weft_lock::{ServiceHandle, ServiceRegistry};

use crate::connector::{ConfigParams, Connector};
use crate::factory::ConnectorCatalog;
use crate::stats::{AtomicPoolStats, PoolStats, PoolStatus};

/// A handle together with the connector type it was built from
#[derive(Debug)]
pub(crate) struct PoolEntry {
    pub(crate) type_name: String,
    pub(crate) connector: Box<dyn Connector>,
    created_at: Instant,
}

/// Outcome of a checkout attempt
#[derive(Debug)]
pub(crate) enum Checkout {
    Ready(PoolEntry),
    NotInstalled,
    /// The pool was drained; the caller must retry against a fresh pool
    Drained,
}

#[derive(Debug)]
struct PoolState {
    free: usize,
    idle: Vec<PoolEntry>,
    drained: bool,
}

/// Sub-pool for one connection name
#[derive(Debug)]
pub struct Pool {
    connection_name: String,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    services: Arc<dyn ServiceRegistry>,
    service: Mutex<Option<ServiceHandle>>,
    stats: AtomicPoolStats,
    wait_poll_interval: Duration,
}

impl Pool {
    /// Create a sub-pool and register it as an anonymous service of `service_type`
    pub fn new(
        connection_name: impl Into<String>,
        capacity: usize,
        service_type: &str,
        services: Arc<dyn ServiceRegistry>,
        wait_poll_interval: Duration,
    ) -> Result<Self> {
        let connection_name = connection_name.into();
        if capacity == 0 {
            return Err(Error::config(format!(
                "pool capacity for '{connection_name}' must be at least 1"
            )));
        }
        let service = services.register_service_begin_activity(service_type, None)?;
        debug!(
            connection = %connection_name,
            capacity,
            service = %service,
            "Created connector sub-pool"
        );
        Ok(Self {
            connection_name,
            capacity,
            state: Mutex::new(PoolState {
                free: capacity,
                idle: Vec::with_capacity(capacity),
                drained: false,
            }),
            available: Condvar::new(),
            services,
            service: Mutex::new(Some(service)),
            stats: AtomicPoolStats::new(),
            wait_poll_interval,
        })
    }

    /// Connection name this pool serves
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Maximum concurrently checked-out handles
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current occupancy
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            capacity: self.capacity,
            free: state.free,
            idle: state.idle.len(),
            checked_out: self.capacity - state.free,
        }
    }

    /// Cumulative counters
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Whether [`release_all`](Self::release_all) has run
    pub fn is_drained(&self) -> bool {
        self.state.lock().drained
    }

    /// Service registration of this pool, until drained
    pub fn service(&self) -> Option<ServiceHandle> {
        self.service.lock().clone()
    }

    /// Check out a handle of `type_name` connected with `config`, blocking while the
    /// pool is exhausted.
    pub(crate) fn acquire(
        &self,
        ctx: &ThreadContext,
        catalog: &dyn ConnectorCatalog,
        type_name: &str,
        config: &ConfigParams,
    ) -> Result<Checkout> {
        let mut state = self.state.lock();
        if state.drained {
            return Ok(Checkout::Drained);
        }

        if state.free == 0 {
            let started = Instant::now();
            while state.free == 0 {
                if state.drained {
                    return Ok(Checkout::Drained);
                }
                ctx.check_interrupted(&format!(
                    "waiting for a connector of '{}'",
                    self.connection_name
                ))?;
                self.available
                    .wait_for(&mut state, self.wait_poll_interval);
            }
            if state.drained {
                return Ok(Checkout::Drained);
            }
            let waited = started.elapsed();
            self.stats.record_wait(waited.as_millis() as u64);
            PoolMetrics::record_acquire_wait(&self.connection_name, waited);
        }

        loop {
            let mut entry = match state.idle.pop() {
                Some(entry) => entry,
                None => match self.create(ctx, catalog, type_name, config)? {
                    Some(entry) => entry,
                    None => return Ok(Checkout::NotInstalled),
                },
            };

            // A handle that cannot be attached is lost; `free` is unaffected
            if let Err(e) = entry.connector.set_thread_context(ctx) {
                warn!(
                    connection = %self.connection_name,
                    error = %e,
                    "Failed to attach connector, discarding"
                );
                self.record_closed();
                return Err(e);
            }

            let matches = entry.type_name == type_name
                && entry.connector.configuration() == Some(config);
            if !matches {
                debug!(
                    connection = %self.connection_name,
                    cached_type = %entry.type_name,
                    requested_type = type_name,
                    age_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Discarding connector with outdated configuration"
                );
                self.stats.record_stale_discard();
                PoolMetrics::increment_stale_discards(&self.connection_name);
                self.detach_and_disconnect(entry);
                continue;
            }

            state.free -= 1;
            self.stats.record_acquisition();
            PoolMetrics::set_checked_out(&self.connection_name, self.capacity - state.free);
            return Ok(Checkout::Ready(entry));
        }
    }

    fn create(
        &self,
        ctx: &ThreadContext,
        catalog: &dyn ConnectorCatalog,
        type_name: &str,
        config: &ConfigParams,
    ) -> Result<Option<PoolEntry>> {
        let Some(factory) = catalog.lookup(ctx, type_name)? else {
            debug!(connection = %self.connection_name, type_name, "Connector type not installed");
            return Ok(None);
        };
        let mut connector = factory.create().map_err(|e| match e {
            e @ Error::Instantiation { .. } => e,
            other => Error::instantiation_with_source(type_name, "factory failed", other),
        })?;
        connector.connect(config)?;

        self.stats.record_created();
        PoolMetrics::increment_created(&self.connection_name);
        debug!(connection = %self.connection_name, type_name, "Connected new connector");
        Ok(Some(PoolEntry {
            type_name: type_name.to_string(),
            connector,
            created_at: Instant::now(),
        }))
    }

    /// Return a checked-out handle.
    ///
    /// Capacity is given back even when detaching fails; the handle is then
    /// disconnected instead of cached and the detach error returned.
    pub(crate) fn release(&self, mut entry: PoolEntry) -> Result<()> {
        let mut state = self.state.lock();
        state.free += 1;
        PoolMetrics::set_checked_out(&self.connection_name, self.capacity - state.free);

        let result = match entry.connector.clear_thread_context() {
            Ok(()) if !state.drained => {
                state.idle.push(entry);
                Ok(())
            }
            Ok(()) => {
                debug!(connection = %self.connection_name, "Released into drained pool, disconnecting");
                self.disconnect(entry);
                Ok(())
            }
            Err(e) => {
                warn!(
                    connection = %self.connection_name,
                    error = %e,
                    "Failed to detach connector on release, discarding"
                );
                self.disconnect(entry);
                Err(e)
            }
        };
        self.available.notify_one();
        result
    }

    /// Run idle housekeeping on every cached handle.
    ///
    /// All handles are polled; the first failure is returned.
    pub fn poll_all(&self, ctx: &ThreadContext) -> Result<()> {
        let mut state = self.state.lock();
        let mut first_error = None;
        for entry in state.idle.iter_mut() {
            let outcome = entry
                .connector
                .set_thread_context(ctx)
                .and_then(|()| {
                    let polled = entry.connector.poll();
                    let cleared = entry.connector.clear_thread_context();
                    polled.and(cleared)
                });
            if let Err(e) = outcome {
                self.stats.record_poll_failure();
                warn!(connection = %self.connection_name, error = %e, "Connector poll failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Disconnect and discard every idle handle. Checked-out handles and `free`
    /// are untouched.
    pub fn flush_unused(&self, ctx: &ThreadContext) -> Result<()> {
        let idle = std::mem::take(&mut self.state.lock().idle);
        self.shutdown_entries(ctx, idle)
    }

    /// Flush idle handles, end the service registration and refuse further
    /// checkouts. Handles still checked out are disconnected when released.
    pub fn release_all(&self, ctx: &ThreadContext) -> Result<()> {
        let idle = {
            let mut state = self.state.lock();
            state.drained = true;
            self.available.notify_all();
            std::mem::take(&mut state.idle)
        };
        let flushed = self.shutdown_entries(ctx, idle);

        let ended = match self.service.lock().take() {
            Some(handle) => self.services.end_service_activity(&handle),
            None => Ok(()),
        };
        debug!(connection = %self.connection_name, "Drained connector sub-pool");
        flushed.and(ended)
    }

    fn shutdown_entries(&self, ctx: &ThreadContext, entries: Vec<PoolEntry>) -> Result<()> {
        let mut first_error = None;
        for mut entry in entries {
            let outcome = entry.connector.set_thread_context(ctx).and_then(|()| {
                let disconnected = entry.connector.disconnect();
                let cleared = entry.connector.clear_thread_context();
                disconnected.and(cleared)
            });
            self.record_closed();
            if let Err(e) = outcome {
                warn!(connection = %self.connection_name, error = %e, "Failed to disconnect idle connector");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Detach, then disconnect, logging failures
    fn detach_and_disconnect(&self, mut entry: PoolEntry) {
        if let Err(e) = entry.connector.clear_thread_context() {
            warn!(connection = %self.connection_name, error = %e, "Failed to detach stale connector");
        }
        self.disconnect(entry);
    }

    fn disconnect(&self, mut entry: PoolEntry) {
        if let Err(e) = entry.connector.disconnect() {
            warn!(connection = %self.connection_name, error = %e, "Failed to disconnect connector");
        }
        self.record_closed();
    }

    fn record_closed(&self) {
        self.stats.record_closed();
        PoolMetrics::increment_closed(&self.connection_name);
    }
}
