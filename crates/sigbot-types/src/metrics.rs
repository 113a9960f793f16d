//! Point-in-time metrics view produced by the runtime.
//!
//! The core keeps live counters; this snapshot is what exporters and the CLI
//! consume.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::breaker::CircuitState;

/// Per-command handler outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandStats {
    pub successes: u64,
    pub failures: u64,
    /// Sum of handler latencies in milliseconds, successes and failures alike.
    pub total_latency_ms: u64,
}

impl CommandStats {
    pub fn calls(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        let calls = self.calls();
        (calls > 0).then(|| self.total_latency_ms as f64 / calls as f64)
    }
}

/// DLQ event counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqStats {
    /// Entries currently stored.
    pub backlog: u64,
    pub sent: u64,
    pub ready: u64,
    pub requeued: u64,
    pub discarded: u64,
}

/// Rate limiter waits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub waits: u64,
    pub total_wait_ms: u64,
    /// Histogram of waits keyed by upper bucket bound in milliseconds.
    pub wait_buckets: BTreeMap<u64, u64>,
}

/// Everything the runtime exposes for observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Queue depth per shard, in shard order.
    pub queue_depths: Vec<usize>,
    /// Mean time between enqueue and worker pickup, in milliseconds.
    pub mean_queue_latency_ms: Option<f64>,
    pub messages_processed: u64,
    pub parse_errors: u64,
    pub overflow_drops: u64,
    pub dlq: DlqStats,
    pub rate_limiter: RateLimiterStats,
    /// Current state per endpoint.
    pub breaker_states: BTreeMap<String, CircuitState>,
    pub commands: BTreeMap<String, CommandStats>,
    /// Ingest pauses keyed by reason (`backpressure`, `circuit_open`).
    pub ingest_pauses: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn total_queue_depth(&self) -> usize {
        self.queue_depths.iter().sum()
    }
}
