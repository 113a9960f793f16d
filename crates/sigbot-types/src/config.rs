//! Runtime configuration for sigbot.
//!
//! `BotConfig` mirrors `sigbot.toml`. Every field has a default so an empty
//! file (or no file at all) yields a runnable configuration once the account
//! section is filled in, usually from the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl BotConfig {
    /// Check everything except the account section.
    ///
    /// Used by commands that only touch storage (`dlq inspect`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.queue_size == 0 {
            return Err(invalid("worker.queue_size", "must be at least 1"));
        }
        if self.worker.pool_size == 0 {
            return Err(invalid("worker.pool_size", "must be at least 1"));
        }
        if self.worker.shard_count == 0 {
            return Err(invalid("worker.shard_count", "must be at least 1"));
        }
        if self.rate_limiter.rate_limit == 0 {
            return Err(invalid("rate_limiter.rate_limit", "must be at least 1"));
        }
        if self.rate_limiter.period_ms == 0 {
            return Err(invalid("rate_limiter.period_ms", "must be at least 1"));
        }
        let rate = self.circuit_breaker.failure_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(invalid(
                "circuit_breaker.failure_rate_threshold",
                "must be in (0, 1]",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_database.trim().is_empty() {
            return Err(invalid("storage.sqlite_database", "must not be empty"));
        }
        if self.dlq.base_backoff_ms > self.dlq.max_backoff_ms {
            return Err(invalid("dlq.base_backoff_ms", "must not exceed dlq.max_backoff_ms"));
        }
        Ok(())
    }

    /// Full validation for running the bot: account fields are required.
    pub fn validate_for_run(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.account.phone_number.trim().is_empty() {
            missing.push("account.phone_number (SIGNAL_PHONE_NUMBER)");
        }
        if self.account.service_url.trim().is_empty() {
            missing.push("account.service_url (SIGNAL_SERVICE_URL)");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing.join(", ")));
        }
        self.validate()
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// The gateway account this bot runs as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// E.164 number registered with the gateway.
    #[serde(default)]
    pub phone_number: String,
    /// Base URL of the gateway's receive endpoint (http(s) or ws(s)).
    #[serde(default)]
    pub service_url: String,
    /// Base URL of the gateway's REST API. Falls back to `service_url`.
    #[serde(default)]
    pub api_url: String,
}

impl AccountConfig {
    pub fn effective_api_url(&self) -> &str {
        if self.api_url.trim().is_empty() {
            &self.service_url
        } else {
            &self.api_url
        }
    }
}

/// What the listener does when the queue stays full for the enqueue timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Drop the incoming frame and forward it to the DLQ.
    FailFast,
    /// Evict the oldest queued item and retry once.
    #[default]
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Number of conversation shards. 1 disables sharding. A sharded pool
    /// runs exactly one worker per shard and `pool_size` is not used.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    /// Forward handler failures to the DLQ.
    #[serde(default = "default_true")]
    pub dlq_on_failure: bool,
}

fn default_queue_size() -> usize {
    1000
}

fn default_pool_size() -> usize {
    4
}

fn default_shard_count() -> usize {
    1
}

fn default_enqueue_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            pool_size: default_pool_size(),
            shard_count: default_shard_count(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            backpressure: BackpressurePolicy::default(),
            dlq_on_failure: true,
        }
    }
}

impl WorkerConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    /// Workers the pool runs: one per shard when sharded, else `pool_size`.
    pub fn worker_count(&self) -> usize {
        if self.shard_count > 1 { self.shard_count } else { self.pool_size }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Permits granted per period.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

fn default_rate_limit() -> usize {
    50
}

fn default_period_ms() -> u64 {
    1000
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            period_ms: default_period_ms(),
        }
    }
}

impl RateLimiterConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_min_requests")]
    pub min_requests_for_rate_calc: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    30
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_min_requests() -> u64 {
    10
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            failure_rate_threshold: default_failure_rate_threshold(),
            min_requests_for_rate_calc: default_min_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Which storage driver backs the DLQ and replay buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_database")]
    pub sqlite_database: String,
}

fn default_sqlite_database() -> String {
    "sigbot.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_database: default_sqlite_database(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Storage key for the DLQ list.
    #[serde(default = "default_dlq_name")]
    pub name: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// How often the runtime moves ready entries back into the queue.
    /// 0 disables the loop.
    #[serde(default = "default_replay_interval_secs")]
    pub replay_interval_secs: u64,
}

fn default_dlq_name() -> String {
    "sigbot_dlq".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_replay_interval_secs() -> u64 {
    60
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            name: default_dlq_name(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            replay_interval_secs: default_replay_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Mirror accepted frames into the durable replay buffer.
    #[serde(default)]
    pub durable_queue_enabled: bool,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_durable_queue_max_length")]
    pub durable_queue_max_length: usize,
    /// Default pause applied on backpressure or an opened circuit.
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
}

fn default_queue_name() -> String {
    "sigbot_ingest".to_string()
}

fn default_durable_queue_max_length() -> usize {
    10_000
}

fn default_pause_ms() -> u64 {
    1000
}

fn default_compaction_interval_secs() -> u64 {
    30
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            durable_queue_enabled: false,
            queue_name: default_queue_name(),
            durable_queue_max_length: default_durable_queue_max_length(),
            pause_ms: default_pause_ms(),
            compaction_interval_secs: default_compaction_interval_secs(),
        }
    }
}

impl IngestConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}
