//! Connector handle abstraction
//!
//! A connector is an expensive, stateful client for an external system (a
//! repository, an authority, an output target). The pool owns handles while they
//! are idle and lends them out exclusively; a handle is never used by two threads
//! at once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use weft_core::{Result, ThreadContext};

/// Ordered name/value configuration of a connection.
///
/// Two handles built from equal `ConfigParams` are interchangeable; a change is
/// what makes the pool discard cached handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigParams {
    params: BTreeMap<String, String>,
}

impl ConfigParams {
    /// Create empty parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a parameter
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    /// Look up a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Remove a parameter, returning its value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.params.remove(name)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether there are no parameters
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for ConfigParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            params: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl fmt::Display for ConfigParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, _)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            // Values may hold credentials
            write!(f, "{name}=***")?;
        }
        f.write_str("}")
    }
}

/// A pooled connector handle.
///
/// Lifecycle: constructed by a [`ConnectorFactory`](crate::ConnectorFactory),
/// `connect`ed once, then repeatedly attached to a worker thread
/// (`set_thread_context`), used, and detached (`clear_thread_context`) until it is
/// `disconnect`ed and dropped.
pub trait Connector: Send + fmt::Debug {
    /// Establish the connection with `config`
    fn connect(&mut self, config: &ConfigParams) -> Result<()>;

    /// Tear down the connection
    fn disconnect(&mut self) -> Result<()>;

    /// Attach the handle to the calling worker
    fn set_thread_context(&mut self, ctx: &ThreadContext) -> Result<()>;

    /// Detach the handle from its worker
    fn clear_thread_context(&mut self) -> Result<()>;

    /// Periodic idle housekeeping (keep-alives, expiring sessions)
    fn poll(&mut self) -> Result<()> {
        Ok(())
    }

    /// Configuration the handle was connected with
    fn configuration(&self) -> Option<&ConfigParams>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_params_equality_ignores_insert_order() {
        let a = ConfigParams::new().with("host", "h").with("port", "1");
        let b: ConfigParams = [("port", "1"), ("host", "h")].into_iter().collect();
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with("port", "2"));
    }

    #[test]
    fn test_config_params_accessors() {
        let mut params = ConfigParams::new().with("user", "crawler");
        assert_eq!(params.get("user"), Some("crawler"));
        assert_eq!(params.get("missing"), None);
        params.set("user", "other");
        assert_eq!(params.len(), 1);
        assert_eq!(params.remove("user").as_deref(), Some("other"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_config_params_display_masks_values() {
        let params = ConfigParams::new()
            .with("password", "secret")
            .with("host", "h");
        assert_eq!(params.to_string(), "{host=***, password=***}");
    }

    #[test]
    fn test_config_params_serde() {
        let params = ConfigParams::new().with("a", "1");
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"a":"1"}"#);
        let back: ConfigParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
