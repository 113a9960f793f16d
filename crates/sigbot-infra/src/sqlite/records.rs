//! SQLite implementation of the storage port.
//!
//! Every list lives in the `records` table keyed by `list_key`; rows keep
//! insertion order through the autoincrement id. Records are stored as JSON
//! text and deserialized on read.

use std::path::Path;

use chrono::Utc;
use serde_json::Value;
use sigbot_core::storage::Storage;
use sigbot_types::error::StorageError;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `Storage`.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: DatabasePool,
}

impl SqliteStorage {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open the database file at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let pool = DatabasePool::open(path)
            .await
            .map_err(|e| StorageError::Connection(format!("{}: {e}", path.display())))?;
        Ok(Self::new(pool))
    }

    /// Number of records stored under `key`.
    pub async fn count(&self, key: &str) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM records WHERE list_key = ?")
            .bind(key)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        let count: i64 = row.try_get("n").map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl Storage for SqliteStorage {
    async fn append(&self, key: &str, record: &Value) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| StorageError::Serialization(format!("failed to serialize record: {e}")))?;

        sqlx::query("INSERT INTO records (list_key, payload, created_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(&payload)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(())
    }

    async fn read_all(&self, key: &str) -> Result<Vec<Value>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM records WHERE list_key = ? ORDER BY id")
            .bind(key)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let payload: String = row
                    .try_get("payload")
                    .map_err(|e| StorageError::Query(e.to_string()))?;
                serde_json::from_str(&payload)
                    .map_err(|e| StorageError::Serialization(format!("invalid JSON record: {e}")))
            })
            .collect()
    }

    async fn delete_all(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM records WHERE list_key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(())
    }
}
