//! Connector pool keyed by connection name
//!
//! [`ConnectorPool`] lazily creates one [`Pool`] per connection name and routes
//! checkouts to it. The registry map is locked only to look up, insert or remove
//! sub-pools; work on a sub-pool always happens after that lock is released.
//!
//! ```rust,ignore
//! let pool = ConnectorPool::from_config(&config.pool, catalog, services, validator)?;
//! let ctx = ThreadContext::current();
//!
//! if let Some(mut connector) = pool.acquire(&ctx, "intranet", "web", &params, 10)? {
//!     connector.poll()?;
//!     connector.release()?;
//! }
//! ```

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use weft_core::metrics::PoolMetrics;
use weft_core::{Error, PoolSettings, Result, ThreadContext};
use weft_lock::ServiceRegistry;

use crate::connector::ConfigParams;
use crate::factory::{ConnectionValidator, ConnectorCatalog};
use crate::guard::PooledConnector;
use crate::pool::{Checkout, Pool};
use crate::stats::{PoolStats, PoolStatus};

/// One element of a batch checkout
#[derive(Debug, Clone)]
pub struct ConnectorRequest {
    /// Key fixing the acquisition order; unique within a batch
    pub ordering_key: String,
    /// Connection name (sub-pool key)
    pub connection_name: String,
    /// Connector type name
    pub type_name: String,
    /// Required configuration
    pub config: ConfigParams,
    /// Sub-pool capacity, used when the sub-pool is first created
    pub capacity: usize,
}

impl ConnectorRequest {
    /// Create a request
    pub fn new(
        ordering_key: impl Into<String>,
        connection_name: impl Into<String>,
        type_name: impl Into<String>,
        config: ConfigParams,
        capacity: usize,
    ) -> Self {
        Self {
            ordering_key: ordering_key.into(),
            connection_name: connection_name.into(),
            type_name: type_name.into(),
            config,
            capacity,
        }
    }
}

/// Pool of connector handles, one sub-pool per connection name
pub struct ConnectorPool {
    service_type_prefix: String,
    default_capacity: usize,
    wait_poll_interval: Duration,
    catalog: Arc<dyn ConnectorCatalog>,
    services: Arc<dyn ServiceRegistry>,
    validator: Arc<dyn ConnectionValidator>,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

impl ConnectorPool {
    /// Create a pool whose sub-pools register as `service_type_prefix + connection_name`
    pub fn new(
        service_type_prefix: impl Into<String>,
        catalog: Arc<dyn ConnectorCatalog>,
        services: Arc<dyn ServiceRegistry>,
        validator: Arc<dyn ConnectionValidator>,
    ) -> Result<Self> {
        let settings = PoolSettings::default().with_service_type_prefix(service_type_prefix);
        Self::from_config(&settings, catalog, services, validator)
    }

    /// Create a pool from settings, rejecting a zero capacity or poll interval
    pub fn from_config(
        settings: &PoolSettings,
        catalog: Arc<dyn ConnectorCatalog>,
        services: Arc<dyn ServiceRegistry>,
        validator: Arc<dyn ConnectionValidator>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            service_type_prefix: settings.service_type_prefix.clone(),
            default_capacity: settings.default_capacity,
            wait_poll_interval: settings.wait_poll_interval(),
            catalog,
            services,
            validator,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Capacity configured for callers without their own
    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    /// Service type a sub-pool for `connection_name` registers under
    pub fn service_type(&self, connection_name: &str) -> String {
        format!("{}{}", self.service_type_prefix, connection_name)
    }

    fn pool_for(&self, connection_name: &str, capacity: usize) -> Result<Arc<Pool>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(connection_name) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(Pool::new(
            connection_name,
            capacity,
            &self.service_type(connection_name),
            Arc::clone(&self.services),
            self.wait_poll_interval,
        )?);
        pools.insert(connection_name.to_string(), Arc::clone(&pool));
        PoolMetrics::set_pool_count(pools.len());
        Ok(pool)
    }

    /// Remove `pool` from the registry if it is still the registered one
    fn deregister(&self, pool: &Arc<Pool>) -> bool {
        let mut pools = self.pools.lock();
        let registered = pools
            .get(pool.connection_name())
            .is_some_and(|current| Arc::ptr_eq(current, pool));
        if registered {
            pools.remove(pool.connection_name());
            PoolMetrics::set_pool_count(pools.len());
        }
        registered
    }

    fn snapshot(&self) -> Vec<Arc<Pool>> {
        let pools = self.pools.lock();
        let mut snapshot: Vec<Arc<Pool>> = pools.values().cloned().collect();
        snapshot.sort_by(|a, b| a.connection_name().cmp(b.connection_name()));
        snapshot
    }

    /// Check out a handle for `connection_name`, blocking while its sub-pool is
    /// exhausted.
    ///
    /// Returns `Ok(None)` when `type_name` is not installed. `capacity` applies only
    /// when this call creates the sub-pool.
    pub fn acquire(
        &self,
        ctx: &ThreadContext,
        connection_name: &str,
        type_name: &str,
        config: &ConfigParams,
        capacity: usize,
    ) -> Result<Option<PooledConnector>> {
        loop {
            let pool = self.pool_for(connection_name, capacity)?;
            match pool.acquire(ctx, self.catalog.as_ref(), type_name, config)? {
                Checkout::Ready(entry) => return Ok(Some(PooledConnector::new(entry, pool))),
                Checkout::NotInstalled => return Ok(None),
                Checkout::Drained => {
                    debug!(connection = connection_name, "Sub-pool drained during checkout, retrying");
                    self.deregister(&pool);
                }
            }
        }
    }

    /// [`acquire`](Self::acquire) with the configured default capacity
    pub fn acquire_default(
        &self,
        ctx: &ThreadContext,
        connection_name: &str,
        type_name: &str,
        config: &ConfigParams,
    ) -> Result<Option<PooledConnector>> {
        self.acquire(ctx, connection_name, type_name, config, self.default_capacity)
    }

    /// Check out several handles at once.
    ///
    /// Requests are served in ascending `ordering_key` order so that callers sharing
    /// keys cannot deadlock on exhausted sub-pools. Results are in request order.
    /// On failure everything already checked out is released in reverse order and
    /// the triggering error returned.
    pub fn acquire_batch(
        &self,
        ctx: &ThreadContext,
        requests: &[ConnectorRequest],
    ) -> Result<Vec<Option<PooledConnector>>> {
        let mut order: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, request) in requests.iter().enumerate() {
            if order.insert(&request.ordering_key, index).is_some() {
                return Err(Error::DuplicateOrderingKey {
                    key: request.ordering_key.clone(),
                });
            }
        }

        let mut results: Vec<Option<PooledConnector>> = requests.iter().map(|_| None).collect();
        let mut acquired = Vec::with_capacity(requests.len());
        for index in order.into_values() {
            let request = &requests[index];
            match self.acquire(
                ctx,
                &request.connection_name,
                &request.type_name,
                &request.config,
                request.capacity,
            ) {
                Ok(connector) => {
                    results[index] = connector;
                    acquired.push(index);
                }
                Err(e) => {
                    for done in acquired.into_iter().rev() {
                        let Some(connector) = results[done].take() else {
                            continue;
                        };
                        if let Err(unwind) = connector.release() {
                            warn!(
                                connection = %requests[done].connection_name,
                                error = %unwind,
                                "Failed to release connector while unwinding batch"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// Return a handle to its sub-pool; `None` is a no-op
    pub fn release(&self, connector: Option<PooledConnector>) -> Result<()> {
        match connector {
            Some(connector) => connector.release(),
            None => Ok(()),
        }
    }

    /// Return several handles, attempting all before reporting the first failure
    pub fn release_batch<I>(&self, connectors: I) -> Result<()>
    where
        I: IntoIterator<Item = Option<PooledConnector>>,
    {
        let mut first_error = None;
        for connector in connectors {
            if let Err(e) = self.release(connector) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Poll idle handles of every still-valid connection; drain sub-pools whose
    /// connection no longer exists.
    pub fn poll_idle(&self, ctx: &ThreadContext) -> Result<()> {
        let mut first_error = None;
        for pool in self.snapshot() {
            let outcome = match self
                .validator
                .is_connection_name_valid(ctx, pool.connection_name())
            {
                Ok(true) => pool.poll_all(ctx),
                Ok(false) => {
                    info!(connection = pool.connection_name(), "Connection removed, draining sub-pool");
                    self.deregister(&pool);
                    pool.release_all(ctx)
                }
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Disconnect idle handles in every sub-pool; checked-out handles are untouched
    pub fn flush_idle(&self, ctx: &ThreadContext) -> Result<()> {
        let mut first_error = None;
        for pool in self.snapshot() {
            if let Err(e) = pool.flush_unused(ctx) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drain every sub-pool and empty the registry
    pub fn drain_all(&self, ctx: &ThreadContext) -> Result<()> {
        let pools: Vec<Arc<Pool>> = {
            let mut pools = self.pools.lock();
            let drained = pools.drain().map(|(_, pool)| pool).collect();
            PoolMetrics::set_pool_count(0);
            drained
        };
        info!(pools = pools.len(), "Draining connector pool");

        let mut first_error = None;
        for pool in pools {
            if let Err(e) = pool.release_all(ctx) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Connection names with a live sub-pool, sorted
    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Occupancy of the sub-pool for `connection_name`
    pub fn pool_status(&self, connection_name: &str) -> Option<PoolStatus> {
        let pool = self.pools.lock().get(connection_name).cloned()?;
        Some(pool.status())
    }

    /// Counters of the sub-pool for `connection_name`
    pub fn stats(&self, connection_name: &str) -> Option<PoolStats> {
        let pool = self.pools.lock().get(connection_name).cloned()?;
        Some(pool.stats())
    }
}

impl fmt::Debug for ConnectorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorPool")
            .field("service_type_prefix", &self.service_type_prefix)
            .field("pools", &self.connection_names())
            .finish()
    }
}
