//! In-memory secret storage implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{Secret, SecretStore, StoreError};

/// In-memory secret store for testing and development.
///
/// This store is not persistent; data is lost when the process exits.
pub struct MemoryStore {
    data: RwLock<HashMap<String, Secret>>,
    failing_keys: RwLock<Vec<String>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            failing_keys: RwLock::new(Vec::new()),
        }
    }

    /// Create a memory store with initial data.
    pub fn with_data(data: HashMap<String, Secret>) -> Self {
        Self {
            data: RwLock::new(data),
            failing_keys: RwLock::new(Vec::new()),
        }
    }

    /// Make every `set` and `delete` on `key` fail with a backend error.
    #[cfg(test)]
    pub(crate) fn fail_writes_to(&self, key: impl Into<String>) {
        self.failing_keys.write().push(key.into());
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check_writable(&self, key: &str) -> Result<(), StoreError> {
        if self.failing_keys.read().iter().any(|k| k == key) {
            return Err(StoreError::BackendError {
                message: format!("write rejected for key: {}", key),
            });
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys_count", &self.len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        self.check_writable(key)?;
        self.data.write().insert(key.to_string(), secret.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_writable(key)?;
        self.data.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_set_get() {
        let store = MemoryStore::new();
        store.set("test-key", &Secret::new("test-value")).await.unwrap();

        let retrieved = store.get("test-key").await.unwrap();
        assert_eq!(retrieved.unwrap().expose(), "test-value");
    }

    #[tokio::test]
    async fn test_memory_store_get_nonexistent() {
        let store = MemoryStore::new();
        assert!(store.get("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.set("test-key", &Secret::new("test-value")).await.unwrap();

        store.delete("test-key").await.unwrap();
        store.delete("test-key").await.unwrap();

        assert!(store.get("test-key").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_failing_key() {
        let store = MemoryStore::new();
        store.fail_writes_to("broken");

        let result = store.set("broken", &Secret::new("x")).await;
        assert!(matches!(result, Err(StoreError::BackendError { .. })));

        store.set("fine", &Secret::new("y")).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
