//! Live runtime counters.
//!
//! Each component holds an `Arc<RuntimeMetrics>` and records into it; readers
//! take a [`MetricsSnapshot`]. Exporters (sigbot-observe) and the CLI only
//! ever see snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use sigbot_types::breaker::CircuitState;
use sigbot_types::metrics::{CommandStats, DlqStats, MetricsSnapshot, RateLimiterStats};

/// Upper bounds (ms) of the rate-limiter wait histogram buckets.
pub const WAIT_BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000];

/// Shared counters for every runtime component.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    queue_depths: DashMap<usize, usize>,
    queue_latency_total_us: AtomicU64,
    queue_latency_samples: AtomicU64,
    messages_processed: AtomicU64,
    parse_errors: AtomicU64,
    overflow_drops: AtomicU64,
    dlq_backlog: AtomicU64,
    dlq_sent: AtomicU64,
    dlq_ready: AtomicU64,
    dlq_requeued: AtomicU64,
    dlq_discarded: AtomicU64,
    rate_limit_waits: AtomicU64,
    rate_limit_wait_ms: AtomicU64,
    /// Keyed by bucket upper bound; `u64::MAX` is the overflow bucket.
    rate_limit_buckets: DashMap<u64, u64>,
    breaker_states: DashMap<String, CircuitState>,
    commands: DashMap<String, CommandStats>,
    ingest_pauses: DashMap<String, u64>,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // -- queue --------------------------------------------------------------

    pub fn set_queue_depth(&self, shard: usize, depth: usize) {
        self.queue_depths.insert(shard, depth);
    }

    pub fn observe_queue_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.queue_latency_total_us.fetch_add(micros, Ordering::Relaxed);
        self.queue_latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow_drop(&self) {
        self.overflow_drops.fetch_add(1, Ordering::Relaxed);
    }

    // -- dead-letter queue --------------------------------------------------

    pub fn set_dlq_backlog(&self, backlog: usize) {
        self.dlq_backlog.store(backlog as u64, Ordering::Relaxed);
    }

    pub fn record_dlq_sent(&self) {
        self.dlq_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_ready(&self, count: usize) {
        self.dlq_ready.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_dlq_requeued(&self, count: usize) {
        self.dlq_requeued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_dlq_discarded(&self, count: usize) {
        self.dlq_discarded.fetch_add(count as u64, Ordering::Relaxed);
    }

    // -- rate limiter -------------------------------------------------------

    pub fn observe_rate_limit_wait(&self, wait: Duration) {
        let ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        self.rate_limit_wait_ms.fetch_add(ms, Ordering::Relaxed);
        let bucket = WAIT_BUCKETS_MS
            .iter()
            .copied()
            .find(|bound| ms <= *bound)
            .unwrap_or(u64::MAX);
        *self.rate_limit_buckets.entry(bucket).or_insert(0) += 1;
    }

    // -- circuit breaker ----------------------------------------------------

    pub fn set_breaker_state(&self, endpoint: &str, state: CircuitState) {
        self.breaker_states.insert(endpoint.to_string(), state);
    }

    /// Gauge value for `(endpoint, state)`: 1 when the endpoint is in `state`.
    pub fn breaker_gauge(&self, endpoint: &str, state: CircuitState) -> u8 {
        match self.breaker_states.get(endpoint) {
            Some(current) if *current == state => 1,
            _ => 0,
        }
    }

    // -- commands -----------------------------------------------------------

    pub fn record_command(&self, command: &str, success: bool, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let mut stats = self.commands.entry(command.to_string()).or_default();
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.total_latency_ms = stats.total_latency_ms.saturating_add(ms);
    }

    // -- ingest -------------------------------------------------------------

    pub fn record_ingest_pause(&self, reason: &str) {
        *self.ingest_pauses.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shard_count = self.queue_depths.iter().map(|e| *e.key() + 1).max().unwrap_or(0);
        let queue_depths = (0..shard_count)
            .map(|shard| self.queue_depths.get(&shard).map(|d| *d).unwrap_or(0))
            .collect();

        let samples = self.queue_latency_samples.load(Ordering::Relaxed);
        let mean_queue_latency_ms = (samples > 0)
            .then(|| self.queue_latency_total_us.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0);

        MetricsSnapshot {
            queue_depths,
            mean_queue_latency_ms,
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            dlq: DlqStats {
                backlog: self.dlq_backlog.load(Ordering::Relaxed),
                sent: self.dlq_sent.load(Ordering::Relaxed),
                ready: self.dlq_ready.load(Ordering::Relaxed),
                requeued: self.dlq_requeued.load(Ordering::Relaxed),
                discarded: self.dlq_discarded.load(Ordering::Relaxed),
            },
            rate_limiter: RateLimiterStats {
                waits: self.rate_limit_waits.load(Ordering::Relaxed),
                total_wait_ms: self.rate_limit_wait_ms.load(Ordering::Relaxed),
                wait_buckets: self
                    .rate_limit_buckets
                    .iter()
                    .map(|e| (*e.key(), *e.value()))
                    .collect(),
            },
            breaker_states: self
                .breaker_states
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            commands: self
                .commands
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            ingest_pauses: self
                .ingest_pauses
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_empty() {
        let metrics = RuntimeMetrics::new();
        let snapshot = metrics.snapshot();
        assert!(snapshot.queue_depths.is_empty());
        assert_eq!(snapshot.mean_queue_latency_ms, None);
        assert_eq!(snapshot.messages_processed, 0);
    }

    #[test]
    fn test_queue_depths_fill_missing_shards() {
        let metrics = RuntimeMetrics::new();
        metrics.set_queue_depth(2, 4);
        metrics.set_queue_depth(0, 1);
        assert_eq!(metrics.snapshot().queue_depths, vec![1, 0, 4]);
    }

    #[test]
    fn test_rate_limit_histogram_buckets() {
        let metrics = RuntimeMetrics::new();
        metrics.observe_rate_limit_wait(Duration::from_millis(3));
        metrics.observe_rate_limit_wait(Duration::from_millis(480));
        metrics.observe_rate_limit_wait(Duration::from_secs(60));
        let stats = metrics.snapshot().rate_limiter;
        assert_eq!(stats.waits, 3);
        assert_eq!(stats.wait_buckets.get(&5), Some(&1));
        assert_eq!(stats.wait_buckets.get(&500), Some(&1));
        assert_eq!(stats.wait_buckets.get(&u64::MAX), Some(&1));
    }

    #[test]
    fn test_breaker_gauge_tracks_current_state() {
        let metrics = RuntimeMetrics::new();
        metrics.set_breaker_state("send", CircuitState::Open);
        assert_eq!(metrics.breaker_gauge("send", CircuitState::Open), 1);
        assert_eq!(metrics.breaker_gauge("send", CircuitState::Closed), 0);
        metrics.set_breaker_state("send", CircuitState::HalfOpen);
        assert_eq!(metrics.breaker_gauge("send", CircuitState::Open), 0);
        assert_eq!(metrics.breaker_gauge("send", CircuitState::HalfOpen), 1);
    }

    #[test]
    fn test_command_counters() {
        let metrics = RuntimeMetrics::new();
        metrics.record_command("ping", true, Duration::from_millis(10));
        metrics.record_command("ping", false, Duration::from_millis(30));
        let stats = metrics.snapshot().commands.remove("ping").unwrap();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.mean_latency_ms(), Some(20.0));
    }
}
