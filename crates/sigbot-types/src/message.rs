//! Message shapes flowing through the ingestion pipeline.
//!
//! A `QueuedMessage` is the raw frame as it sits in the dispatch queue. A
//! `ParsedMessage` is the domain view a worker builds from it before routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A raw frame waiting in the dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// The frame exactly as received from the transport.
    pub raw: String,
    /// When the frame was accepted into the pipeline.
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempts that already failed (non-zero for DLQ requeues).
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedMessage {
    /// Wrap a freshly received frame, stamped with the current time.
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Wrap a frame with an explicit acceptance time (replay on startup).
    pub fn with_timestamp(raw: impl Into<String>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            raw: raw.into(),
            enqueued_at,
            attempts: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// A persisted copy of an accepted frame, used for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub raw: String,
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempts already made, for frames that came back from the DLQ.
    #[serde(default)]
    pub attempts: u32,
}

impl From<&QueuedMessage> for ReplayEntry {
    fn from(item: &QueuedMessage) -> Self {
        Self {
            raw: item.raw.clone(),
            enqueued_at: item.enqueued_at,
            attempts: item.attempts,
        }
    }
}

impl From<ReplayEntry> for QueuedMessage {
    fn from(entry: ReplayEntry) -> Self {
        QueuedMessage::with_timestamp(entry.raw, entry.enqueued_at).with_attempts(entry.attempts)
    }
}

/// Which envelope variant a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A message received from another account.
    Data,
    /// A message sent from one of our own linked devices.
    Sync,
    /// An edit of a previously sent message.
    Edit,
    /// A remote delete of a previously sent message.
    Delete,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Data => write!(f, "data"),
            MessageKind::Sync => write!(f, "sync"),
            MessageKind::Edit => write!(f, "edit"),
            MessageKind::Delete => write!(f, "delete"),
        }
    }
}

/// An emoji reaction carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub target_author: Option<String>,
    pub target_sent_timestamp: Option<i64>,
}

/// The domain view of a chat event, produced by a `MessageParser`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    /// Sender identifier (phone number or service id).
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uuid: Option<String>,
    /// Gateway timestamp in milliseconds since the epoch.
    pub timestamp: i64,
    pub kind: MessageKind,
    /// Message body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Group the message was posted to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    /// Local filenames of attachments the gateway already downloaded.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Numbers mentioned in the body.
    #[serde(default)]
    pub mentions: Vec<String>,
    /// For edits: the timestamp of the message being edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_sent_timestamp: Option<i64>,
    /// For remote deletes: the timestamp of the deleted message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_delete_timestamp: Option<i64>,
}

impl ParsedMessage {
    /// Minimal data message, mostly useful in tests and demos.
    pub fn text(source: impl Into<String>, timestamp: i64, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_number: None,
            source_uuid: None,
            timestamp,
            kind: MessageKind::Data,
            text: Some(text.into()),
            group_id: None,
            reaction: None,
            attachments: Vec::new(),
            mentions: Vec::new(),
            target_sent_timestamp: None,
            remote_delete_timestamp: None,
        }
    }

    /// Stable identifier: sender plus gateway timestamp.
    pub fn id(&self) -> String {
        format!("{}:{}", self.source, self.timestamp)
    }

    /// The conversation this message belongs to (group if any, else the sender).
    pub fn conversation_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.source)
    }

    /// Whether this message was posted in a group.
    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_prefers_group() {
        let mut msg = ParsedMessage::text("+15550001", 1_700_000_000_000, "hi");
        assert_eq!(msg.conversation_id(), "+15550001");
        assert!(!msg.is_group());

        msg.group_id = Some("group-abc".to_string());
        assert_eq!(msg.conversation_id(), "group-abc");
        assert!(msg.is_group());
    }

    #[test]
    fn test_message_id_is_source_and_timestamp() {
        let msg = ParsedMessage::text("+15550001", 42, "hi");
        assert_eq!(msg.id(), "+15550001:42");
    }

    #[test]
    fn test_replay_entry_converts_to_queued_message() {
        let ts = Utc::now();
        let entry = ReplayEntry {
            raw: "{}".to_string(),
            enqueued_at: ts,
            attempts: 2,
        };
        let queued: QueuedMessage = entry.into();
        assert_eq!(queued.raw, "{}");
        assert_eq!(queued.enqueued_at, ts);
        assert_eq!(queued.attempts, 2);
    }

    #[test]
    fn test_replay_entry_without_attempts_defaults_to_zero() {
        let entry: ReplayEntry =
            serde_json::from_str(r#"{"raw":"{}","enqueued_at":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(entry.attempts, 0);
    }

    #[test]
    fn test_message_kind_serde_snake_case() {
        let json = serde_json::to_string(&MessageKind::Edit).unwrap();
        assert_eq!(json, "\"edit\"");
        assert_eq!(MessageKind::Delete.to_string(), "delete");
    }
}
