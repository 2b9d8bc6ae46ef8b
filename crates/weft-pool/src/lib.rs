//! # weft-pool
//!
//! Pooling of expensive, stateful connector handles.
//!
//! - **Sub-pools**: one [`Pool`] per connection name, capped at a fixed number of
//!   concurrently checked-out handles
//! - **Validation**: cached handles are reused only for the same connector type and
//!   configuration; outdated ones are disconnected on the spot
//! - **Batch checkout**: [`ConnectorPool::acquire_batch`] orders requests by key so
//!   exhaustion cannot deadlock concurrent batches
//! - **Guards**: [`PooledConnector`] returns its handle on release or drop
//! - **Liveness**: every sub-pool is advertised through a
//!   [`weft_lock::ServiceRegistry`]

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connector;
pub mod connector_pool;
pub mod factory;
pub mod guard;
pub mod pool;
pub mod stats;

pub use connector::{ConfigParams, Connector};
pub use connector_pool::{ConnectorPool, ConnectorRequest};
pub use factory::{ConnectionValidator, ConnectorCatalog, ConnectorFactory, ConnectorRegistry};
pub use guard::PooledConnector;
pub use pool::Pool;
pub use stats::{AtomicPoolStats, PoolStats, PoolStatus};
