//! Dead-letter queue over the durable storage port.
//!
//! Failed or dropped payloads are appended with a retry schedule. `replay()`
//! drains the stored list and splits it into entries that are due (returned
//! to the caller for another attempt), entries that are not yet due (stored
//! again unchanged) and entries that exhausted their retries (discarded).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sigbot_types::config::DlqConfig;
use sigbot_types::dlq::{DeadLetter, DlqEntry, ReplaySummary};
use sigbot_types::error::StorageError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::metrics::RuntimeMetrics;
use crate::storage::BoxStorage;

/// Storage key, retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqSettings {
    pub name: String,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&DlqConfig> for DlqSettings {
    fn from(config: &DlqConfig) -> Self {
        Self {
            name: config.name.clone(),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self::from(&DlqConfig::default())
    }
}

impl DlqSettings {
    /// `min(base * 2^retry_count, max_backoff)`, saturating.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base = u64::try_from(self.base_backoff.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }

    fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(retry_count)).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Wrap a raw frame as a DLQ payload: the JSON itself when it parses,
/// otherwise `{"raw": frame}`.
pub fn frame_to_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "raw": raw }))
}

/// Inverse of [`frame_to_payload`], used when requeueing ready entries.
pub fn payload_to_frame(payload: &Value) -> String {
    match payload {
        Value::Object(map) if map.len() == 1 => match map.get("raw") {
            Some(Value::String(raw)) => raw.clone(),
            _ => payload.to_string(),
        },
        Value::String(raw) => raw.clone(),
        _ => payload.to_string(),
    }
}

/// Durable dead-letter queue with exponential backoff.
pub struct DeadLetterQueue {
    storage: BoxStorage,
    settings: DlqSettings,
    metrics: Arc<RuntimeMetrics>,
    /// Serializes sends with the read-then-clear in `replay()`.
    lock: Mutex<()>,
    known_backlog: AtomicUsize,
}

impl DeadLetterQueue {
    pub fn new(storage: BoxStorage, settings: DlqSettings, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            storage,
            settings,
            metrics,
            lock: Mutex::new(()),
            known_backlog: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &DlqSettings {
        &self.settings
    }

    /// Store `payload` for a first retry.
    pub async fn send(&self, payload: Value) -> Result<DlqEntry, StorageError> {
        self.send_with(DeadLetter::new(payload)).await
    }

    /// Store a dead letter with its reason, metadata and attempt count.
    pub async fn send_with(&self, letter: DeadLetter) -> Result<DlqEntry, StorageError> {
        let next_retry_at = self.settings.next_retry_at(Utc::now(), letter.retry_count);
        let entry = DlqEntry {
            id: Uuid::now_v7(),
            payload: letter.payload,
            reason: letter.reason,
            metadata: letter.metadata,
            retry_count: letter.retry_count,
            next_retry_at,
        };
        self.store(entry).await
    }

    /// Store `payload` with an explicit schedule. `next_retry_at` defaults
    /// to the backoff for `retry_count`.
    pub async fn send_entry(
        &self,
        payload: Value,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<DlqEntry, StorageError> {
        let next_retry_at = next_retry_at.unwrap_or_else(|| self.settings.next_retry_at(Utc::now(), retry_count));
        let entry = DlqEntry {
            id: Uuid::now_v7(),
            payload,
            reason: None,
            metadata: None,
            retry_count,
            next_retry_at,
        };
        self.store(entry).await
    }

    async fn store(&self, entry: DlqEntry) -> Result<DlqEntry, StorageError> {
        let record = serde_json::to_value(&entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        {
            let _guard = self.lock.lock().await;
            self.storage.append(&self.settings.name, &record).await?;
        }
        let backlog = self.known_backlog.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_dlq_sent();
        self.metrics.set_dlq_backlog(backlog);
        tracing::debug!(
            dlq = %self.settings.name,
            entry_id = %entry.id,
            reason = entry.reason.as_deref().unwrap_or("-"),
            retry_count = entry.retry_count,
            "dead letter stored"
        );
        Ok(entry)
    }

    /// Take every entry that is due, leaving the rest in storage.
    ///
    /// Returned entries carry the incremented retry count and the next
    /// schedule; it is up to the caller to retry them (and send them back on
    /// failure).
    pub async fn replay(&self) -> Result<Vec<DlqEntry>, StorageError> {
        self.replay_detailed().await.map(|(ready, _)| ready)
    }

    /// Like [`replay`](Self::replay), also reporting how entries were split.
    ///
    /// Storage is only rewritten when something was taken out. If writing
    /// the pending entries back fails, every record not yet written is
    /// appended again as it was read, the due ones included, and the error
    /// is returned.
    pub async fn replay_detailed(&self) -> Result<(Vec<DlqEntry>, ReplaySummary), StorageError> {
        let _guard = self.lock.lock().await;
        let records = self.storage.read_all(&self.settings.name).await?;

        let now = Utc::now();
        let mut ready = Vec::new();
        let mut taken = Vec::new();
        let mut pending = Vec::new();
        let mut discarded = 0usize;

        for record in records {
            let mut entry: DlqEntry = match serde_json::from_value(record.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dlq = %self.settings.name, error = %e, "discarding unreadable dead letter");
                    discarded += 1;
                    continue;
                }
            };

            if entry.retry_count >= self.settings.max_retries {
                tracing::info!(
                    dlq = %self.settings.name,
                    entry_id = %entry.id,
                    retry_count = entry.retry_count,
                    "dead letter exhausted its retries, discarding"
                );
                discarded += 1;
            } else if entry.is_ready(now) {
                entry.retry_count += 1;
                entry.next_retry_at = self.settings.next_retry_at(now, entry.retry_count);
                ready.push(entry);
                taken.push(record);
            } else {
                pending.push(record);
            }
        }

        if !ready.is_empty() || discarded > 0 {
            self.storage.delete_all(&self.settings.name).await?;
            for (written, record) in pending.iter().enumerate() {
                if let Err(e) = self.storage.append(&self.settings.name, record).await {
                    self.restore_records(pending[written..].iter().chain(&taken)).await;
                    return Err(e);
                }
            }
        }

        let summary = ReplaySummary {
            ready: ready.len(),
            pending: pending.len(),
            discarded,
        };
        self.known_backlog.store(summary.pending, Ordering::Relaxed);
        self.metrics.set_dlq_backlog(summary.pending);
        self.metrics.record_dlq_ready(summary.ready);
        self.metrics.record_dlq_discarded(summary.discarded);
        if summary.ready > 0 || summary.discarded > 0 {
            tracing::info!(
                dlq = %self.settings.name,
                ready = summary.ready,
                pending = summary.pending,
                discarded = summary.discarded,
                "dead letter replay"
            );
        }
        Ok((ready, summary))
    }

    async fn restore_records<'a>(&self, records: impl Iterator<Item = &'a Value>) {
        let mut lost = 0usize;
        for record in records {
            if let Err(e) = self.storage.append(&self.settings.name, record).await {
                tracing::error!(dlq = %self.settings.name, error = %e, record = %record, "dead letter lost while restoring");
                lost += 1;
            }
        }
        if lost > 0 {
            tracing::error!(dlq = %self.settings.name, lost, "dead letter rewrite failed");
        } else {
            tracing::warn!(dlq = %self.settings.name, "dead letter rewrite failed, stored entries restored");
        }
    }

    /// Read-only view of every stored entry.
    pub async fn inspect(&self) -> Result<Vec<DlqEntry>, StorageError> {
        let records = self.storage.read_all(&self.settings.name).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| serde_json::from_value(record).ok())
            .collect())
    }

    /// Number of stored records. Also refreshes the backlog gauge.
    pub async fn backlog(&self) -> Result<usize, StorageError> {
        let count = self.storage.read_all(&self.settings.name).await?.len();
        self.known_backlog.store(count, Ordering::Relaxed);
        self.metrics.set_dlq_backlog(count);
        Ok(count)
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingStorage, FlakyStorage, VecStorage};
    use chrono::Duration as ChronoDuration;

    fn dlq_with(settings: DlqSettings) -> (DeadLetterQueue, Arc<RuntimeMetrics>, VecStorage) {
        let storage = VecStorage::default();
        let metrics = Arc::new(RuntimeMetrics::new());
        let dlq = DeadLetterQueue::new(BoxStorage::new(storage.clone()), settings, metrics.clone());
        (dlq, metrics, storage)
    }

    fn zero_backoff() -> DlqSettings {
        DlqSettings {
            name: "dlq".to_string(),
            max_retries: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = DlqSettings {
            name: "dlq".into(),
            max_retries: 5,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        };
        assert_eq!(settings.backoff(0), Duration::from_secs(5));
        assert_eq!(settings.backoff(1), Duration::from_secs(10));
        assert_eq!(settings.backoff(3), Duration::from_secs(40));
        assert_eq!(settings.backoff(4), Duration::from_secs(60));
        assert_eq!(settings.backoff(200), Duration::from_secs(60));
    }

    #[test]
    fn test_frame_payload_conversion() {
        assert_eq!(frame_to_payload("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(frame_to_payload("not json"), json!({"raw": "not json"}));
        assert_eq!(payload_to_frame(&json!({"raw": "not json"})), "not json");
        assert_eq!(payload_to_frame(&json!({"a": 1})), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_send_then_replay_with_zero_backoff() {
        let (dlq, metrics, _) = dlq_with(zero_backoff());
        dlq.send(json!({"id": 1})).await.unwrap();
        assert_eq!(metrics.snapshot().dlq.backlog, 1);

        let ready = dlq.replay().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].payload, json!({"id": 1}));
        assert_eq!(ready[0].retry_count, 1);
        assert_eq!(dlq.backlog().await.unwrap(), 0);
        assert_eq!(metrics.snapshot().dlq.backlog, 0);
    }

    #[tokio::test]
    async fn test_replay_without_ready_entries_is_idempotent() {
        let (dlq, _, _) = dlq_with(DlqSettings::default());
        let future = Utc::now() + ChronoDuration::hours(1);
        dlq.send_entry(json!({"id": 1}), 0, Some(future)).await.unwrap();
        dlq.send(json!({"id": 2})).await.unwrap();

        for _ in 0..3 {
            assert!(dlq.replay().await.unwrap().is_empty());
            assert_eq!(dlq.backlog().await.unwrap(), 2);
        }
        let stored = dlq.inspect().await.unwrap();
        assert_eq!(stored[0].next_retry_at, future);
        assert_eq!(stored[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_entry_discarded_exactly_once() {
        let (dlq, metrics, storage) = dlq_with(zero_backoff());
        let past = Utc::now() - ChronoDuration::seconds(1);
        dlq.send_entry(json!({"id": "spent"}), 3, Some(past)).await.unwrap();

        assert!(dlq.replay().await.unwrap().is_empty());
        assert_eq!(storage.len("dlq"), 0);
        assert_eq!(metrics.snapshot().dlq.discarded, 1);

        assert!(dlq.replay().await.unwrap().is_empty());
        assert_eq!(metrics.snapshot().dlq.discarded, 1);
    }

    #[tokio::test]
    async fn test_replay_partitions_entries() {
        let (dlq, _, _) = dlq_with(DlqSettings {
            max_retries: 2,
            ..zero_backoff()
        });
        let past = Utc::now() - ChronoDuration::seconds(1);
        let future = Utc::now() + ChronoDuration::hours(1);
        dlq.send_entry(json!("ready"), 1, Some(past)).await.unwrap();
        dlq.send_entry(json!("pending"), 0, Some(future)).await.unwrap();
        dlq.send_entry(json!("spent"), 2, Some(past)).await.unwrap();

        let (ready, summary) = dlq.replay_detailed().await.unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                ready: 1,
                pending: 1,
                discarded: 1
            }
        );
        assert_eq!(ready[0].payload, json!("ready"));
        assert_eq!(ready[0].retry_count, 2);
        let remaining = dlq.inspect().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, json!("pending"));
    }

    #[tokio::test]
    async fn test_failed_rewrite_restores_every_entry() {
        let storage = FlakyStorage::default();
        let metrics = Arc::new(RuntimeMetrics::new());
        let dlq = DeadLetterQueue::new(BoxStorage::new(storage.clone()), zero_backoff(), metrics);
        let past = Utc::now() - ChronoDuration::seconds(1);
        let future = Utc::now() + ChronoDuration::hours(1);
        dlq.send_entry(json!("pending"), 0, Some(future)).await.unwrap();
        dlq.send_entry(json!("ready"), 1, Some(past)).await.unwrap();

        storage.fail_next_appends(1);
        assert!(dlq.replay_detailed().await.is_err());

        let stored = dlq.inspect().await.unwrap();
        assert_eq!(stored.len(), 2);
        let ready = stored.iter().find(|e| e.payload == json!("ready")).unwrap();
        assert_eq!(ready.retry_count, 1);
        assert_eq!(ready.next_retry_at, past);
        assert_eq!(dlq.replay().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_leaves_storage_alone_when_nothing_is_due() {
        let storage = FlakyStorage::default();
        let metrics = Arc::new(RuntimeMetrics::new());
        let dlq = DeadLetterQueue::new(BoxStorage::new(storage.clone()), DlqSettings::default(), metrics);
        dlq.send(json!({"id": 1})).await.unwrap();

        storage.fail_next_appends(1);
        assert!(dlq.replay().await.unwrap().is_empty());
        assert_eq!(storage.inner().len("sigbot_dlq"), 1);
    }

    #[tokio::test]
    async fn test_send_with_keeps_reason_and_metadata() {
        let (dlq, _, _) = dlq_with(DlqSettings::default());
        let before = Utc::now();
        dlq.send_with(
            DeadLetter::new(json!({"raw": "x"}))
                .with_reason("queue_overflow")
                .with_metadata(json!({"shard": 1}))
                .with_retry_count(2),
        )
        .await
        .unwrap();

        let stored = dlq.inspect().await.unwrap();
        assert_eq!(stored[0].reason.as_deref(), Some("queue_overflow"));
        assert_eq!(stored[0].metadata, Some(json!({"shard": 1})));
        // 5s * 2^2
        assert!(stored[0].next_retry_at >= before + ChronoDuration::seconds(20));
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let metrics = Arc::new(RuntimeMetrics::new());
        let dlq = DeadLetterQueue::new(BoxStorage::new(FailingStorage), DlqSettings::default(), metrics);
        assert!(matches!(dlq.send(json!({})).await, Err(StorageError::Connection(_))));
        assert!(dlq.replay().await.is_err());
        assert!(dlq.inspect().await.is_err());
    }
}
