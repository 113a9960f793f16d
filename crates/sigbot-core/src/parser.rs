//! Parser port and the default gateway envelope parser.
//!
//! A parser turns a raw frame into a `ParsedMessage`, or tells the worker why
//! it cannot: `Malformed` for payloads that are not valid, `Unsupported` for
//! envelopes that are recognized but not handled. `Ok(None)` means "nothing
//! to do" (e.g. an empty sync message) and is not an error.

use serde_json::Value;
use sigbot_types::error::ParseError;
use sigbot_types::message::{MessageKind, ParsedMessage, Reaction};

/// Trait for frame parsers.
pub trait MessageParser: Send + Sync {
    /// Parse a raw frame.
    fn parse(&self, raw: &str) -> Result<Option<ParsedMessage>, ParseError>;

    /// Key used to pick a shard for `raw`: the conversation id when the frame
    /// parses, `None` otherwise.
    fn conversation_key(&self, raw: &str) -> Option<String> {
        self.parse(raw)
            .ok()
            .flatten()
            .map(|message| message.conversation_id().to_string())
    }
}

/// Parser for the REST bridge's `{"envelope": {...}}` JSON frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeParser;

impl EnvelopeParser {
    pub fn new() -> Self {
        Self
    }
}

impl MessageParser for EnvelopeParser {
    fn parse(&self, raw: &str) -> Result<Option<ParsedMessage>, ParseError> {
        let frame: Value = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;

        let envelope = match frame.get("envelope") {
            Some(Value::Object(map)) if map.contains_key("source") => map,
            _ => return Err(ParseError::Unsupported("missing envelope or source".into())),
        };

        let (mut data, mut kind) = if let Some(sync) = envelope.get("syncMessage") {
            (sync.get("sentMessage").cloned().unwrap_or(Value::Null), MessageKind::Sync)
        } else if let Some(data) = envelope.get("dataMessage") {
            (data.clone(), MessageKind::Data)
        } else {
            return Err(ParseError::Unsupported("not a sync or data message".into()));
        };

        if is_empty(&data) {
            return Ok(None);
        }

        let mut target_sent_timestamp = None;
        if let Some(edit) = data.get("editMessage").cloned() {
            kind = MessageKind::Edit;
            target_sent_timestamp = edit.get("targetSentTimestamp").and_then(Value::as_i64);
            data = edit.get("dataMessage").cloned().unwrap_or(Value::Null);
        }

        let mut remote_delete_timestamp = None;
        if let Some(delete) = data.get("remoteDelete") {
            kind = MessageKind::Delete;
            remote_delete_timestamp = delete.get("timestamp").and_then(Value::as_i64);
        }

        let source = envelope
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Malformed("envelope source is not a string".into()))?
            .to_string();
        let timestamp = envelope
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| ParseError::Malformed("envelope timestamp missing or not an integer".into()))?;

        Ok(Some(ParsedMessage {
            source,
            source_number: string_field(envelope.get("sourceNumber")),
            source_uuid: string_field(envelope.get("sourceUuid")),
            timestamp,
            kind,
            text: string_field(data.get("message")),
            group_id: string_field(data.get("groupInfo").and_then(|g| g.get("groupId"))),
            reaction: data.get("reaction").map(parse_reaction),
            attachments: collect_strings(data.get("attachments"), "filename"),
            mentions: collect_strings(data.get("mentions"), "number"),
            target_sent_timestamp,
            remote_delete_timestamp,
        }))
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn parse_reaction(value: &Value) -> Reaction {
    Reaction {
        emoji: string_field(value.get("emoji")).unwrap_or_default(),
        target_author: string_field(value.get("targetAuthor")),
        target_sent_timestamp: value.get("targetSentTimestamp").and_then(Value::as_i64),
    }
}

/// Pull `field` out of every object in a JSON array, skipping objects without it.
fn collect_strings(value: Option<&Value>, field: &str) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
