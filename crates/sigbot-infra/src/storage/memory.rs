//! In-memory storage for tests and throwaway runs.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use sigbot_core::storage::Storage;
use sigbot_types::error::StorageError;

/// Volatile `Storage` on a concurrent map. Clones share the same lists.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    lists: Arc<DashMap<String, Vec<Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.lists.get(key).map(|list| list.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}

impl Storage for MemoryStorage {
    async fn append(&self, key: &str, record: &Value) -> Result<(), StorageError> {
        self.lists.entry(key.to_string()).or_default().push(record.clone());
        Ok(())
    }

    async fn read_all(&self, key: &str) -> Result<Vec<Value>, StorageError> {
        Ok(self.lists.get(key).map(|list| list.clone()).unwrap_or_default())
    }

    async fn delete_all(&self, key: &str) -> Result<(), StorageError> {
        self.lists.remove(key);
        Ok(())
    }
}
