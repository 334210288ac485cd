//! Store registry for resolving key-value backends by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::KeyValueStore;
use outbox_common::{StoreError, StoreResult};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(Value) -> StoreResult<Arc<dyn KeyValueStore>> + Send + Sync>;

/// Registry for key-value store factories.
///
/// Allows hosts to select a backend by name and configuration.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

fn invalid(msg: String) -> StoreError {
    StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> StoreResult<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(invalid(format!("Store '{}' is already registered", name)));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not registered
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> StoreResult<Arc<dyn KeyValueStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| invalid(format!("Store '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in stores.
pub fn create_default_registry() -> StoreRegistry {
    let mut factories: HashMap<String, StoreFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config: Value| -> StoreResult<Arc<dyn KeyValueStore>> {
            let store: Arc<dyn KeyValueStore> = Arc::new(crate::memory::MemoryStore::new());
            Ok(store)
        }),
    );

    factories.insert(
        "file".to_string(),
        Box::new(|config: Value| -> StoreResult<Arc<dyn KeyValueStore>> {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid("File store requires 'root' path".to_string()))?;
            let store: Arc<dyn KeyValueStore> = Arc::new(crate::local::FileStore::new(root)?);
            Ok(store)
        }),
    );

    StoreRegistry { factories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        assert_eq!(registry.stores(), vec!["file".to_string(), "memory".to_string()]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = create_default_registry();
        let result = registry.register(
            "memory",
            Box::new(|_: Value| -> StoreResult<Arc<dyn KeyValueStore>> {
                let store: Arc<dyn KeyValueStore> = Arc::new(crate::memory::MemoryStore::new());
                Ok(store)
            }),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolve_file_store() {
        let temp = TempDir::new().unwrap();
        let registry = create_default_registry();
        let store = registry
            .resolve(
                "file",
                serde_json::json!({ "root": temp.path().to_string_lossy() }),
            )
            .unwrap();

        assert_eq!(store.name(), "file");
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_resolve_file_store_requires_root() {
        let registry = create_default_registry();
        assert!(registry.resolve("file", serde_json::json!({})).is_err());
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = create_default_registry();
        assert!(registry.resolve("sqlite", Value::Null).is_err());
    }
}
