//! Instrument and attribute names for exported runtime metrics.
//!
//! All instruments live under the `sigbot.` prefix. Attribute keys are plain
//! words so they line up with the structured log fields.

// --- Queue ---

/// Items waiting in a queue shard. Attribute: `shard`.
pub const QUEUE_DEPTH: &str = "sigbot.queue.depth";

/// Mean time between enqueue and pickup, in milliseconds.
pub const QUEUE_LATENCY_MEAN: &str = "sigbot.queue.latency.mean_ms";

/// Frames dropped or rejected because the queue stayed full.
pub const QUEUE_OVERFLOW_DROPS: &str = "sigbot.queue.overflow_drops";

// --- Processing ---

pub const MESSAGES_PROCESSED: &str = "sigbot.messages.processed";

pub const PARSE_ERRORS: &str = "sigbot.messages.parse_errors";

/// Command outcomes. Attributes: `command`, `outcome`.
pub const COMMAND_CALLS: &str = "sigbot.command.calls";

/// Mean handler latency in milliseconds. Attribute: `command`.
pub const COMMAND_LATENCY_MEAN: &str = "sigbot.command.latency.mean_ms";

// --- Dead-letter queue ---

pub const DLQ_BACKLOG: &str = "sigbot.dlq.backlog";

/// DLQ events. Attribute: `event` (sent, ready, requeued, discarded).
pub const DLQ_EVENTS: &str = "sigbot.dlq.events";

// --- Resilience ---

/// 1 for the current state of an endpoint, 0 for the others.
/// Attributes: `endpoint`, `state`.
pub const BREAKER_STATE: &str = "sigbot.circuit_breaker.state";

/// Rate limiter waits per bucket. Attribute: `le_ms`.
pub const RATE_LIMIT_WAITS: &str = "sigbot.rate_limiter.waits";

/// Ingest pauses. Attribute: `reason`.
pub const INGEST_PAUSES: &str = "sigbot.ingest.pauses";

// --- Attribute keys ---

pub const ATTR_SHARD: &str = "shard";
pub const ATTR_COMMAND: &str = "command";
pub const ATTR_OUTCOME: &str = "outcome";
pub const ATTR_EVENT: &str = "event";
pub const ATTR_ENDPOINT: &str = "endpoint";
pub const ATTR_STATE: &str = "state";
pub const ATTR_LE_MS: &str = "le_ms";
pub const ATTR_REASON: &str = "reason";
