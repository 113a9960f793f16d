//! Durable replay buffer for accepted frames.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sigbot_types::error::StorageError;
use sigbot_types::message::ReplayEntry;
use tokio::sync::Mutex;

use crate::storage::BoxStorage;

/// Bounded FIFO of accepted frames, persisted through the storage port.
///
/// Frames are appended as they are accepted into the queue and replayed once
/// at startup. `compact()` drops everything older than the processing
/// watermark so the list does not grow without bound.
pub struct ReplayBuffer {
    storage: BoxStorage,
    key: String,
    max_length: usize,
    lock: Mutex<()>,
}

impl ReplayBuffer {
    /// `max_length` is clamped to at least 1.
    pub fn new(storage: BoxStorage, key: impl Into<String>, max_length: usize) -> Self {
        Self {
            storage,
            key: key.into(),
            max_length: max_length.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Persist a frame, then trim the list to the newest `max_length` entries.
    pub async fn append(&self, raw: &str, enqueued_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.append_entry(&ReplayEntry {
            raw: raw.to_string(),
            enqueued_at,
            attempts: 0,
        })
        .await
    }

    /// Like [`append`](Self::append), keeping the entry's attempt count.
    pub async fn append_entry(&self, entry: &ReplayEntry) -> Result<(), StorageError> {
        let record = to_record(entry)?;
        let _guard = self.lock.lock().await;
        self.storage.append(&self.key, &record).await?;

        let records = self.storage.read_all(&self.key).await?;
        if records.len() > self.max_length {
            let excess = records.len() - self.max_length;
            self.rewrite(&records[excess..]).await?;
        }
        Ok(())
    }

    /// Every readable entry, oldest first. Unreadable records are skipped.
    pub async fn replay(&self) -> Result<Vec<ReplayEntry>, StorageError> {
        let _guard = self.lock.lock().await;
        let entries = self.read_entries().await?;
        if !entries.is_empty() {
            tracing::info!(key = %self.key, count = entries.len(), "recovered persisted frames");
        }
        Ok(entries)
    }

    /// Keep only entries with `enqueued_at >= min_timestamp`.
    pub async fn compact(&self, min_timestamp: DateTime<Utc>) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;
        let entries = self.read_entries().await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let retained: Vec<Value> = entries
            .iter()
            .filter(|entry| entry.enqueued_at >= min_timestamp)
            .map(to_record)
            .collect::<Result<_, _>>()?;
        let kept = retained.len();
        self.rewrite(&retained).await?;
        tracing::debug!(key = %self.key, retained = kept, "replay buffer compacted");
        Ok(kept)
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        self.storage.delete_all(&self.key).await
    }

    async fn read_entries(&self) -> Result<Vec<ReplayEntry>, StorageError> {
        let records = self.storage.read_all(&self.key).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| serde_json::from_value(record).ok())
            .collect())
    }

    async fn rewrite(&self, records: &[Value]) -> Result<(), StorageError> {
        self.storage.delete_all(&self.key).await?;
        for record in records {
            self.storage.append(&self.key, record).await?;
        }
        Ok(())
    }
}

fn to_record(entry: &ReplayEntry) -> Result<Value, StorageError> {
    serde_json::to_value(entry).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl std::fmt::Debug for ReplayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayBuffer")
            .field("key", &self.key)
            .field("max_length", &self.max_length)
            .finish_non_exhaustive()
    }
}
