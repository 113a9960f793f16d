//! Dead-letter queue entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A payload that failed processing (or was dropped on overflow), along with
/// its retry schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Time-sortable id assigned when the entry is first stored.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub payload: Value,
    /// Classification tag, e.g. `queue_overflow`, `rate_limited`, `panic`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free-form context captured at failure time (worker, command, trigger).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

impl DlqEntry {
    /// Whether the entry is due for another attempt at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now
    }
}

/// What a caller hands to the DLQ. Scheduling fields are filled in on send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadLetter {
    pub payload: Value,
    pub reason: Option<String>,
    pub metadata: Option<Value>,
    /// Attempts already made; 0 for a first failure.
    pub retry_count: u32,
}

impl DeadLetter {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Outcome counts of a single `replay()` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub ready: usize,
    pub pending: usize,
    pub discarded: usize,
}
