//! BoxStorage -- object-safe dynamic dispatch wrapper for Storage.
//!
//! 1. Define an object-safe `StorageDyn` trait with boxed futures
//! 2. Blanket-impl `StorageDyn` for all `T: Storage`
//! 3. `BoxStorage` wraps `Arc<dyn StorageDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use sigbot_types::error::StorageError;

use super::store::Storage;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`Storage`] with boxed futures.
pub trait StorageDyn: Send + Sync {
    fn append_boxed<'a>(&'a self, key: &'a str, record: &'a Value) -> BoxFuture<'a, Result<(), StorageError>>;

    fn read_all_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<Value>, StorageError>>;

    fn delete_all_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;
}

impl<T: Storage> StorageDyn for T {
    fn append_boxed<'a>(&'a self, key: &'a str, record: &'a Value) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(self.append(key, record))
    }

    fn read_all_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<Value>, StorageError>> {
        Box::pin(self.read_all(key))
    }

    fn delete_all_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(self.delete_all(key))
    }
}

/// Type-erased, cheaply cloneable storage handle.
///
/// The DLQ and the replay buffer share one backend chosen at startup
/// (SQLite or in-memory), so the handle is reference counted.
#[derive(Clone)]
pub struct BoxStorage {
    inner: Arc<dyn StorageDyn>,
}

impl BoxStorage {
    pub fn new<T: Storage + 'static>(storage: T) -> Self {
        Self {
            inner: Arc::new(storage),
        }
    }

    pub async fn append(&self, key: &str, record: &Value) -> Result<(), StorageError> {
        self.inner.append_boxed(key, record).await
    }

    pub async fn read_all(&self, key: &str) -> Result<Vec<Value>, StorageError> {
        self.inner.read_all_boxed(key).await
    }

    pub async fn delete_all(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete_all_boxed(key).await
    }
}

impl std::fmt::Debug for BoxStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStorage").finish_non_exhaustive()
    }
}
