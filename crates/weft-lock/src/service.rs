//! Service registry
//!
//! Long-lived components (connector sub-pools, agents) announce themselves as active
//! services under a service type so other threads or processes can see who is alive.
//! The registry is independent of the locking API and shares only the coordination
//! medium with it.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use sha2::{Digest, Sha256};
use weft_core::{Error, Result};

/// Registration token returned by [`ServiceRegistry::register_service_begin_activity`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    service_type: String,
    service_name: String,
}

impl ServiceHandle {
    /// Service type
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Service name (generated for anonymous registrations)
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_type, self.service_name)
    }
}

/// Advertises and retracts service liveness
pub trait ServiceRegistry: Send + Sync + fmt::Debug {
    /// Register a service and mark it active.
    ///
    /// With `service_name == None` a unique name is generated. Registering a name that
    /// is already active fails with a configuration error.
    fn register_service_begin_activity(
        &self,
        service_type: &str,
        service_name: Option<&str>,
    ) -> Result<ServiceHandle>;

    /// Mark a registered service inactive and forget it
    fn end_service_activity(&self, handle: &ServiceHandle) -> Result<()>;

    /// Whether the named service is currently active
    fn is_service_active(&self, service_type: &str, service_name: &str) -> Result<bool>;

    /// Names of the active services of a type, sorted
    fn active_services(&self, service_type: &str) -> Result<Vec<String>>;
}

fn resolve_name(service_name: Option<&str>) -> String {
    match service_name {
        Some(name) => name.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    }
}

/// Process-local service registry
#[derive(Debug, Default)]
pub struct InMemoryServiceRegistry {
    services: DashMap<String, BTreeSet<String>>,
}

impl InMemoryServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceRegistry for InMemoryServiceRegistry {
    fn register_service_begin_activity(
        &self,
        service_type: &str,
        service_name: Option<&str>,
    ) -> Result<ServiceHandle> {
        let name = resolve_name(service_name);
        let mut names = self.services.entry(service_type.to_string()).or_default();
        if !names.insert(name.clone()) {
            return Err(Error::config(format!(
                "service '{name}' of type '{service_type}' is already active"
            )));
        }
        debug!(service_type, service_name = %name, "Service activity started");
        Ok(ServiceHandle {
            service_type: service_type.to_string(),
            service_name: name,
        })
    }

    fn end_service_activity(&self, handle: &ServiceHandle) -> Result<()> {
        let removed = self
            .services
            .get_mut(&handle.service_type)
            .map(|mut names| names.remove(&handle.service_name))
            .unwrap_or(false);
        if !removed {
            return Err(Error::config(format!("service '{handle}' is not active")));
        }
        self.services
            .remove_if(&handle.service_type, |_, names| names.is_empty());
        debug!(service = %handle, "Service activity ended");
        Ok(())
    }

    fn is_service_active(&self, service_type: &str, service_name: &str) -> Result<bool> {
        Ok(self
            .services
            .get(service_type)
            .is_some_and(|names| names.contains(service_name)))
    }

    fn active_services(&self, service_type: &str) -> Result<Vec<String>> {
        Ok(self
            .services
            .get(service_type)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Service registry kept in the shared sync directory, visible to every process
/// using the same directory.
///
/// Layout: `<sync_directory>/services/<sha256(type)>/<hex(name)>`.
#[derive(Debug, Clone)]
pub struct FileServiceRegistry {
    root: PathBuf,
}

impl FileServiceRegistry {
    /// Create a registry under `sync_directory`
    pub fn new(sync_directory: impl AsRef<Path>) -> Result<Self> {
        let root = sync_directory.as_ref().join("services");
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::coordination_io(format!("cannot create {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    fn type_dir(&self, service_type: &str) -> PathBuf {
        self.root
            .join(hex::encode(Sha256::digest(service_type.as_bytes())))
    }

    fn entry_path(&self, service_type: &str, service_name: &str) -> PathBuf {
        self.type_dir(service_type)
            .join(hex::encode(service_name.as_bytes()))
    }
}

impl ServiceRegistry for FileServiceRegistry {
    fn register_service_begin_activity(
        &self,
        service_type: &str,
        service_name: Option<&str>,
    ) -> Result<ServiceHandle> {
        let name = resolve_name(service_name);
        let dir = self.type_dir(service_type);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::coordination_io(format!("cannot create {}", dir.display()), e))?;

        let path = self.entry_path(service_type, &name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::config(format!(
                    "service '{name}' of type '{service_type}' is already active"
                )))
            }
            Err(e) => {
                return Err(Error::coordination_io(
                    format!("cannot register service '{name}'"),
                    e,
                ))
            }
        }
        debug!(service_type, service_name = %name, "Service activity started");
        Ok(ServiceHandle {
            service_type: service_type.to_string(),
            service_name: name,
        })
    }

    fn end_service_activity(&self, handle: &ServiceHandle) -> Result<()> {
        let path = self.entry_path(&handle.service_type, &handle.service_name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(service = %handle, "Service activity ended");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::config(format!("service '{handle}' is not active")))
            }
            Err(e) => Err(Error::coordination_io(
                format!("cannot end service '{handle}'"),
                e,
            )),
        }
    }

    fn is_service_active(&self, service_type: &str, service_name: &str) -> Result<bool> {
        Ok(self.entry_path(service_type, service_name).exists())
    }

    fn active_services(&self, service_type: &str) -> Result<Vec<String>> {
        let dir = self.type_dir(service_type);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::coordination_io(
                    format!("cannot list {}", dir.display()),
                    e,
                ))
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let decoded = entry
                .file_name()
                .to_str()
                .and_then(|s| hex::decode(s).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(name) = decoded {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(registry: &dyn ServiceRegistry) {
        let named = registry
            .register_service_begin_activity("crawler", Some("agent-1"))
            .unwrap();
        assert_eq!(named.service_name(), "agent-1");
        assert_eq!(named.to_string(), "crawler/agent-1");

        let anonymous = registry
            .register_service_begin_activity("crawler", None)
            .unwrap();
        assert_ne!(anonymous.service_name(), "agent-1");
        assert!(registry
            .is_service_active("crawler", anonymous.service_name())
            .unwrap());

        let duplicate = registry.register_service_begin_activity("crawler", Some("agent-1"));
        assert!(duplicate.is_err());

        let mut expected = vec![
            "agent-1".to_string(),
            anonymous.service_name().to_string(),
        ];
        expected.sort();
        assert_eq!(registry.active_services("crawler").unwrap(), expected);
        assert!(registry.active_services("other").unwrap().is_empty());

        registry.end_service_activity(&named).unwrap();
        assert!(!registry.is_service_active("crawler", "agent-1").unwrap());
        assert!(registry.end_service_activity(&named).is_err());

        registry.end_service_activity(&anonymous).unwrap();
        assert!(registry.active_services("crawler").unwrap().is_empty());
    }

    #[test]
    fn test_in_memory_registry() {
        exercise(&InMemoryServiceRegistry::new());
    }

    #[test]
    fn test_file_registry() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileServiceRegistry::new(dir.path()).unwrap());
    }

    #[test]
    fn test_file_registry_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileServiceRegistry::new(dir.path()).unwrap();
        let b = FileServiceRegistry::new(dir.path()).unwrap();

        let handle = a
            .register_service_begin_activity("_POOL_web", Some("node/1"))
            .unwrap();
        assert!(b.is_service_active("_POOL_web", "node/1").unwrap());
        assert_eq!(b.active_services("_POOL_web").unwrap(), vec!["node/1"]);
        b.end_service_activity(&handle).unwrap();
        assert!(!a.is_service_active("_POOL_web", "node/1").unwrap());
    }
}
