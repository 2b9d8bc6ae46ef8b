//! Checked-out connector guard

use std::sync::Arc;
use tracing::warn;

use weft_core::Result;

use crate::connector::Connector;
use crate::pool::{Pool, PoolEntry};

/// A connector borrowed from a sub-pool.
///
/// Returned to its sub-pool by [`release`](Self::release) or, failing that, when
/// dropped. Dropping swallows release errors after logging them; call `release` to
/// observe them.
#[derive(Debug)]
pub struct PooledConnector {
    entry: Option<PoolEntry>,
    pool: Arc<Pool>,
}

impl PooledConnector {
    pub(crate) fn new(entry: PoolEntry, pool: Arc<Pool>) -> Self {
        Self {
            entry: Some(entry),
            pool,
        }
    }

    /// Connection name of the owning sub-pool
    pub fn connection_name(&self) -> &str {
        self.pool.connection_name()
    }

    /// Connector type the handle was built from
    pub fn type_name(&self) -> &str {
        self.entry
            .as_ref()
            .map(|entry| entry.type_name.as_str())
            .unwrap_or_default()
    }

    /// Return the handle to its sub-pool
    pub fn release(mut self) -> Result<()> {
        match self.entry.take() {
            Some(entry) => self.pool.release(entry),
            None => Ok(()),
        }
    }
}

impl std::ops::Deref for PooledConnector {
    type Target = dyn Connector;

    fn deref(&self) -> &Self::Target {
        self.entry
            .as_ref()
            .expect("connector already released")
            .connector
            .as_ref()
    }
}

impl std::ops::DerefMut for PooledConnector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry
            .as_mut()
            .expect("connector already released")
            .connector
            .as_mut()
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Err(e) = self.pool.release(entry) {
                warn!(
                    connection = %self.pool.connection_name(),
                    error = %e,
                    "Failed to return dropped connector to its pool"
                );
            }
        }
    }
}
