//! Application state shared by the operational commands.
//!
//! Loads the configuration and opens the configured storage backend. The
//! `run` command builds a full runtime on top of this; `dlq` commands only
//! need the queues that live in storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use sigbot_core::dlq::{DeadLetterQueue, DlqSettings};
use sigbot_core::ingest::ReplayBuffer;
use sigbot_core::metrics::RuntimeMetrics;
use sigbot_core::storage::BoxStorage;
use sigbot_infra::config::{load_config, resolve_config_path};
use sigbot_infra::storage::open_storage;
use sigbot_types::config::BotConfig;

pub struct AppState {
    pub config: BotConfig,
    pub config_path: PathBuf,
    pub storage: BoxStorage,
    pub metrics: Arc<RuntimeMetrics>,
}

impl AppState {
    /// Load the configuration and open storage.
    pub async fn init(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = resolve_config_path(config_path);
        let config = load_config(Some(config_path.as_path()))
            .await
            .with_context(|| format!("loading {}", config_path.display()))?;
        let storage = open_storage(&config.storage)
            .await
            .context("opening storage")?;

        Ok(Self::from_parts(config, config_path, storage))
    }

    pub fn from_parts(config: BotConfig, config_path: PathBuf, storage: BoxStorage) -> Self {
        Self {
            config,
            config_path,
            storage,
            metrics: Arc::new(RuntimeMetrics::new()),
        }
    }

    pub fn dead_letter_queue(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(
            self.storage.clone(),
            DlqSettings::from(&self.config.dlq),
            self.metrics.clone(),
        )
    }

    /// The durable ingest queue, when enabled.
    pub fn replay_buffer(&self) -> Option<ReplayBuffer> {
        let ingest = &self.config.ingest;
        ingest.durable_queue_enabled.then(|| {
            ReplayBuffer::new(
                self.storage.clone(),
                ingest.queue_name.clone(),
                ingest.durable_queue_max_length,
            )
        })
    }
}
