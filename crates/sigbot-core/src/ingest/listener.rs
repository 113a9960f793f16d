//! The producer side of the dispatch queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use sigbot_types::config::{BackpressurePolicy, WorkerConfig};
use sigbot_types::dlq::DeadLetter;
use sigbot_types::error::TransportError;
use sigbot_types::message::QueuedMessage;

use super::{IngestWatermark, IntakeController, ReplayBuffer};
use crate::dispatch::DispatchQueue;
use crate::dlq::{DeadLetterQueue, frame_to_payload};
use crate::metrics::RuntimeMetrics;
use crate::parser::MessageParser;
use crate::transport::Transport;

/// DLQ reason for frames the queue could not take.
pub const OVERFLOW_REASON: &str = "queue_overflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub policy: BackpressurePolicy,
    /// How long one put may wait for room.
    pub enqueue_timeout: Duration,
}

impl From<&WorkerConfig> for ListenerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            policy: config.backpressure,
            enqueue_timeout: config.enqueue_timeout(),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// What happened to one incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { shard: usize },
    /// Accepted after evicting the oldest queued frame.
    EnqueuedAfterEviction { shard: usize },
    /// Dropped; forwarded to the DLQ when one is configured.
    Rejected { shard: usize },
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, EnqueueOutcome::Rejected { .. })
    }
}

/// Pulls frames from the transport into the dispatch queue.
pub struct Listener {
    transport: Arc<dyn Transport>,
    parser: Arc<dyn MessageParser>,
    queue: Arc<DispatchQueue>,
    intake: Arc<IntakeController>,
    metrics: Arc<RuntimeMetrics>,
    settings: ListenerSettings,
    dlq: Option<Arc<DeadLetterQueue>>,
    replay: Option<Arc<ReplayBuffer>>,
    watermark: Option<Arc<IngestWatermark>>,
}

impl Listener {
    pub fn new(
        transport: Arc<dyn Transport>,
        parser: Arc<dyn MessageParser>,
        queue: Arc<DispatchQueue>,
        intake: Arc<IntakeController>,
        metrics: Arc<RuntimeMetrics>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            transport,
            parser,
            queue,
            intake,
            metrics,
            settings,
            dlq: None,
            replay: None,
            watermark: None,
        }
    }

    /// Forward overflowed frames here. Without a DLQ they are only counted.
    pub fn with_dead_letter_queue(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Mirror accepted frames into a durable replay buffer.
    pub fn with_replay_buffer(mut self, replay: Arc<ReplayBuffer>) -> Self {
        self.replay = Some(replay);
        self
    }

    pub fn with_watermark(mut self, watermark: Arc<IngestWatermark>) -> Self {
        self.watermark = Some(watermark);
        self
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    /// Consume the transport until its stream ends.
    ///
    /// Per-frame problems are logged and never end the loop. A transport
    /// error item is fatal and returned.
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut frames = self.transport.listen();
        tracing::info!(
            shards = self.queue.shard_count(),
            policy = ?self.settings.policy,
            "listener started"
        );
        while let Some(item) = frames.next().await {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::error!(error = %e, "transport failed, listener stopping");
                    return Err(e);
                }
            };
            self.intake.wait_if_paused().await;
            self.enqueue(raw).await;
        }
        tracing::info!("transport stream ended");
        Ok(())
    }

    /// Offer one frame to the queue, applying the backpressure policy.
    pub async fn enqueue(&self, raw: String) -> EnqueueOutcome {
        let shard = if self.queue.is_sharded() {
            self.queue.shard_for(self.parser.conversation_key(&raw).as_deref())
        } else {
            0
        };
        let queue = self.queue.shard(shard);
        let timeout = self.settings.enqueue_timeout;
        let enqueued_at = Utc::now();
        let mirror = self.replay.as_ref().map(|_| raw.clone());

        if let Some(watermark) = &self.watermark {
            watermark.track(enqueued_at);
        }

        let outcome = match queue.put_timeout(QueuedMessage::with_timestamp(raw, enqueued_at), timeout).await {
            Ok(()) => EnqueueOutcome::Enqueued { shard },
            Err(item) => match self.settings.policy {
                BackpressurePolicy::FailFast => return self.reject(shard, item).await,
                BackpressurePolicy::DropOldest => {
                    if let Some(evicted) = queue.try_pop_oldest() {
                        queue.task_done();
                        if let Some(watermark) = &self.watermark {
                            watermark.finish(evicted.enqueued_at);
                        }
                        self.metrics.record_overflow_drop();
                        tracing::warn!(shard, queue_depth = queue.len(), "queue full, dropped oldest frame");
                    }
                    match queue.put_timeout(item, timeout).await {
                        Ok(()) => EnqueueOutcome::EnqueuedAfterEviction { shard },
                        Err(item) => return self.reject(shard, item).await,
                    }
                }
            },
        };

        self.queue.publish_depth(shard);
        if let (Some(replay), Some(raw)) = (&self.replay, mirror) {
            if let Err(e) = replay.append(&raw, enqueued_at).await {
                tracing::error!(key = %replay.key(), error = %e, "failed to persist accepted frame");
            }
        }
        outcome
    }

    async fn reject(&self, shard: usize, item: QueuedMessage) -> EnqueueOutcome {
        if let Some(watermark) = &self.watermark {
            watermark.finish(item.enqueued_at);
        }
        self.metrics.record_overflow_drop();
        tracing::warn!(
            shard,
            queue_depth = self.queue.shard(shard).len(),
            policy = ?self.settings.policy,
            "queue full, frame rejected"
        );
        self.intake.pause("backpressure", None);

        if let Some(dlq) = &self.dlq {
            let letter = DeadLetter::new(frame_to_payload(&item.raw))
                .with_reason(OVERFLOW_REASON)
                .with_metadata(json!({
                    "shard": shard,
                    "enqueued_at": item.enqueued_at,
                }))
                .with_retry_count(item.attempts);
            if let Err(e) = dlq.send_with(letter).await {
                tracing::error!(shard, error = %e, "failed to dead-letter overflowed frame");
            }
        }
        EnqueueOutcome::Rejected { shard }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("settings", &self.settings)
            .field("dlq", &self.dlq.is_some())
            .field("replay", &self.replay.is_some())
            .finish_non_exhaustive()
    }
}
