//! Shared lock system
//!
//! A [`LockSystem`] owns the lock and critical-section registries plus the service
//! registry. It is constructed once per process and cloned into worker threads; each
//! thread asks it for its own [`LockManager`].

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use weft_core::{CoordinationConfig, Result, ThreadContext};

use crate::coordination::{CoordinationBackend, FileCoordination, InProcessCoordination};
use crate::manager::LockManager;
use crate::registry::LockRegistry;
use crate::service::{FileServiceRegistry, InMemoryServiceRegistry, ServiceRegistry};

/// Process-wide lock and service registries
#[derive(Debug, Clone)]
pub struct LockSystem {
    locks: Arc<LockRegistry>,
    sections: Arc<LockRegistry>,
    services: Arc<dyn ServiceRegistry>,
    wait_poll_interval: Duration,
}

impl LockSystem {
    /// Process-local system with default settings
    pub fn in_process() -> Self {
        let config = CoordinationConfig::default();
        Self::with_backend(
            Arc::new(InProcessCoordination),
            Arc::new(InMemoryServiceRegistry::new()),
            config.wait_poll_interval(),
        )
    }

    /// Build from configuration.
    ///
    /// With a `sync_directory` both locks and services are shared through it;
    /// otherwise everything stays in this process.
    pub fn from_config(config: &CoordinationConfig) -> Result<Self> {
        config.validate()?;
        let system = match &config.sync_directory {
            Some(dir) => {
                let backend = FileCoordination::new(
                    dir,
                    config.file_poll_interval(),
                    config.stale_mutex_timeout(),
                )?;
                let services = FileServiceRegistry::new(dir)?;
                info!(directory = %backend.directory().display(), "Using file lock coordination");
                Self::with_backend(
                    Arc::new(backend),
                    Arc::new(services),
                    config.wait_poll_interval(),
                )
            }
            None => Self::with_backend(
                Arc::new(InProcessCoordination),
                Arc::new(InMemoryServiceRegistry::new()),
                config.wait_poll_interval(),
            ),
        };
        Ok(system)
    }

    /// Assemble from explicit parts.
    ///
    /// Critical sections always use an in-process registry regardless of `backend`.
    pub fn with_backend(
        backend: Arc<dyn CoordinationBackend>,
        services: Arc<dyn ServiceRegistry>,
        wait_poll_interval: Duration,
    ) -> Self {
        Self {
            locks: Arc::new(LockRegistry::new("locks", backend, wait_poll_interval)),
            sections: Arc::new(LockRegistry::new(
                "sections",
                Arc::new(InProcessCoordination),
                wait_poll_interval,
            )),
            services,
            wait_poll_interval,
        }
    }

    /// Lock manager for the thread identified by `ctx`
    pub fn manager(&self, ctx: ThreadContext) -> LockManager {
        LockManager::new(
            ctx,
            Arc::clone(&self.locks),
            Arc::clone(&self.sections),
            self.wait_poll_interval,
        )
    }

    /// Service registry sharing this system's coordination medium
    pub fn service_registry(&self) -> Arc<dyn ServiceRegistry> {
        Arc::clone(&self.services)
    }

    /// Whether locks are visible to other processes
    pub fn is_cross_process(&self) -> bool {
        self.locks.is_cross_process()
    }

    /// Registry backing locks
    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Registry backing critical sections
    pub fn section_registry(&self) -> &Arc<LockRegistry> {
        &self.sections
    }
}

impl Default for LockSystem {
    fn default() -> Self {
        Self::in_process()
    }
}
