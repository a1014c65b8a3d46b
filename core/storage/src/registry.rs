//! Remote registry for resolving a remote store from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::directory::DirectoryRemote;
use crate::memory::MemoryRemote;
use crate::remote::RemoteStore;
use lockbox_common::{Error, Result};

/// Factory function type for creating remote stores.
pub type RemoteFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteStore>> + Send + Sync>;

/// Registry for remote store factories.
///
/// Maps a backend name from configuration to a constructor taking that
/// backend's JSON settings.
pub struct RemoteRegistry {
    factories: HashMap<String, RemoteFactory>,
}

impl RemoteRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a remote factory.
    ///
    /// # Errors
    /// - `AlreadyExists` if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: RemoteFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Remote backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a remote store by name and configuration.
    ///
    /// # Errors
    /// - `NotFound` if the backend is not registered
    /// - `InvalidInput` if the configuration does not suit the backend
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteStore>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Remote backend '{}' is not registered", name))
        })?;
        factory(config)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
///
/// - `memory`: process-local, no settings
/// - `directory`: requires `{"root": "<path>"}`
pub fn create_default_registry() -> RemoteRegistry {
    let mut registry = RemoteRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(MemoryRemote::new()))),
    );

    registry.factories.insert(
        "directory".to_string(),
        Box::new(|config| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("Directory remote requires 'root' path".to_string())
                })?;
            Ok(Arc::new(DirectoryRemote::new(root)))
        }),
    );

    registry
}
