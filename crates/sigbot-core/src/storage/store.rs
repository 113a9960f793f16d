//! Storage trait definition.
//!
//! A keyed list of JSON records. The runtime only ever appends, reads a whole
//! list, or clears it; ordering within a key is insertion order.

use serde_json::Value;
use sigbot_types::error::StorageError;

/// Trait for the durable list store behind the DLQ and replay buffer.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
/// Implementations live in sigbot-infra.
pub trait Storage: Send + Sync {
    /// Append one record to the end of the list stored under `key`.
    fn append(
        &self,
        key: &str,
        record: &Value,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Read every record under `key`, oldest first. Missing keys yield an empty list.
    fn read_all(&self, key: &str) -> impl std::future::Future<Output = Result<Vec<Value>, StorageError>> + Send;

    /// Remove every record under `key`.
    fn delete_all(&self, key: &str) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;
}
