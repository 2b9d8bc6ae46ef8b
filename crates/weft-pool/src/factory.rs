//! Connector factories and the catalog of installed connector types
//!
//! The pool never constructs handles itself. It asks a [`ConnectorCatalog`] for the
//! factory registered under a connector type name; a missing entry means the type
//! is not installed.
//!
//! ```rust,ignore
//! let registry = ConnectorRegistry::new();
//! registry.register(
//!     "web",
//!     Arc::new(|| -> Result<Box<dyn Connector>> { Ok(Box::new(WebConnector::default())) }),
//! );
//! let pool = ConnectorPool::new("_REPOSITORY_POOL_", Arc::new(registry), services, validator)?;
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use weft_core::{Result, ThreadContext};

use crate::connector::Connector;

/// Builds unconnected handles of one connector type
pub trait ConnectorFactory: Send + Sync {
    /// Create a new handle
    fn create(&self) -> Result<Box<dyn Connector>>;
}

impl<F> ConnectorFactory for F
where
    F: Fn() -> Result<Box<dyn Connector>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Connector>> {
        self()
    }
}

/// Maps connector type names to factories
pub trait ConnectorCatalog: Send + Sync {
    /// Factory for `type_name`, or `None` when the type is not installed
    fn lookup(
        &self,
        ctx: &ThreadContext,
        type_name: &str,
    ) -> Result<Option<Arc<dyn ConnectorFactory>>>;
}

/// Decides whether a connection name is still configured
pub trait ConnectionValidator: Send + Sync {
    /// Whether `connection_name` is still valid
    fn is_connection_name_valid(&self, ctx: &ThreadContext, connection_name: &str)
        -> Result<bool>;
}

impl<F> ConnectionValidator for F
where
    F: Fn(&ThreadContext, &str) -> Result<bool> + Send + Sync,
{
    fn is_connection_name_valid(
        &self,
        ctx: &ThreadContext,
        connection_name: &str,
    ) -> Result<bool> {
        self(ctx, connection_name)
    }
}

/// In-memory catalog of connector factories.
///
/// Types may be installed and removed at runtime; removal only affects handles
/// created afterwards.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ConnectorFactory>>>,
}

impl ConnectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connector type, replacing any previous factory
    pub fn register(&self, type_name: impl Into<String>, factory: Arc<dyn ConnectorFactory>) {
        let type_name = type_name.into();
        debug!(type_name = %type_name, "Registered connector type");
        self.factories.write().insert(type_name, factory);
    }

    /// Remove a connector type, returning whether it was installed
    pub fn unregister(&self, type_name: &str) -> bool {
        self.factories.write().remove(type_name).is_some()
    }

    /// Whether `type_name` is installed
    pub fn is_installed(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }

    /// Installed type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl ConnectorCatalog for ConnectorRegistry {
    fn lookup(
        &self,
        _ctx: &ThreadContext,
        type_name: &str,
    ) -> Result<Option<Arc<dyn ConnectorFactory>>> {
        Ok(self.factories.read().get(type_name).cloned())
    }
}
