//! Configuration types for weft
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` environment expansion:
//!
//! ```yaml
//! coordination:
//!   sync_directory: ${WEFT_SYNC_DIR:-/var/lib/weft/sync}
//!   wait_poll_interval_ms: 100
//! pool:
//!   service_type_prefix: "_REPOSITORY_POOL_"
//!   default_capacity: 10
//! ```
//!
//! Leaving `sync_directory` unset keeps all locks process-local.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{Error, Result};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Lock coordination settings
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Connector pool settings
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Lock coordination settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinationConfig {
    /// Shared directory for cross-process locks; `None` keeps locks in-process
    #[serde(default)]
    pub sync_directory: Option<PathBuf>,

    /// How often blocked lock waiters re-check their interrupt flag (milliseconds)
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    /// Retry interval for the file backend's mutex and contended state (milliseconds)
    #[serde(default = "default_file_poll_interval_ms")]
    pub file_poll_interval_ms: u64,

    /// Age after which an abandoned mutex file is removed (milliseconds)
    #[serde(default = "default_stale_mutex_timeout_ms")]
    pub stale_mutex_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            sync_directory: None,
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            file_poll_interval_ms: default_file_poll_interval_ms(),
            stale_mutex_timeout_ms: default_stale_mutex_timeout_ms(),
        }
    }
}

impl CoordinationConfig {
    /// Set the shared synchronization directory
    pub fn with_sync_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sync_directory = Some(dir.into());
        self
    }

    /// Set the waiter poll interval
    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the file backend poll interval
    pub fn with_file_poll_interval(mut self, interval: Duration) -> Self {
        self.file_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the age after which a mutex file counts as abandoned
    pub fn with_stale_mutex_timeout(mut self, timeout: Duration) -> Self {
        self.stale_mutex_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Waiter poll interval
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    /// File backend poll interval
    pub fn file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.file_poll_interval_ms)
    }

    /// Stale mutex timeout
    pub fn stale_mutex_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_mutex_timeout_ms)
    }

    /// Reject intervals that would turn waits into busy spins
    pub fn validate(&self) -> Result<()> {
        if self.wait_poll_interval_ms == 0 {
            return Err(Error::config("coordination.wait_poll_interval_ms must be > 0"));
        }
        if self.file_poll_interval_ms == 0 {
            return Err(Error::config("coordination.file_poll_interval_ms must be > 0"));
        }
        if self.stale_mutex_timeout_ms < self.file_poll_interval_ms {
            return Err(Error::config(
                "coordination.stale_mutex_timeout_ms must not be shorter than file_poll_interval_ms",
            ));
        }
        if let Some(dir) = &self.sync_directory {
            if dir.as_os_str().is_empty() {
                return Err(Error::config("coordination.sync_directory must not be empty"));
            }
        }
        Ok(())
    }
}

/// Connector pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Prefix of the service type each sub-pool registers under
    #[serde(default = "default_service_type_prefix")]
    pub service_type_prefix: String,

    /// Capacity used when a caller does not supply one
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,

    /// How often blocked acquirers re-check their interrupt flag (milliseconds)
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            service_type_prefix: default_service_type_prefix(),
            default_capacity: default_capacity(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
        }
    }
}

impl PoolSettings {
    /// Set the service type prefix
    pub fn with_service_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.service_type_prefix = prefix.into();
        self
    }

    /// Set the default capacity
    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    /// Waiter poll interval
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    /// Reject a zero default capacity or poll interval
    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 {
            return Err(Error::config("pool.default_capacity must be > 0"));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(Error::config("pool.wait_poll_interval_ms must be > 0"));
        }
        Ok(())
    }
}

fn default_wait_poll_interval_ms() -> u64 {
    100
}

fn default_file_poll_interval_ms() -> u64 {
    25
}

fn default_stale_mutex_timeout_ms() -> u64 {
    60_000
}

fn default_service_type_prefix() -> String {
    "_CONNECTOR_POOL_".to_string()
}

fn default_capacity() -> usize {
    10
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.coordination.validate()?;
        self.pool.validate()
    }
}
