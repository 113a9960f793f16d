//! A single dispatch worker.
//!
//! Loop: take a frame from the worker's shard (or stop) -> parse -> route ->
//! whitelist -> run the middleware chain -> acknowledge. A failure of any one
//! message is logged, counted and dead-lettered; it never ends the loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::json;
use sigbot_types::dlq::DeadLetter;
use sigbot_types::error::{HandlerError, ParseError};
use sigbot_types::message::{ParsedMessage, QueuedMessage};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::{MessageContext, Services};
use super::middleware::{MiddlewareDyn, Next};
use super::queue::DispatchQueue;
use super::router::CommandRouter;
use crate::dlq::{DeadLetterQueue, frame_to_payload};
use crate::ingest::IngestWatermark;
use crate::metrics::RuntimeMetrics;
use crate::parser::MessageParser;

/// State shared by every worker of a pool.
pub(crate) struct WorkerShared {
    pub queue: Arc<DispatchQueue>,
    pub parser: Arc<dyn MessageParser>,
    pub router: RwLock<CommandRouter>,
    pub middleware: RwLock<Vec<Arc<dyn MiddlewareDyn>>>,
    pub services: Services,
    pub metrics: Arc<RuntimeMetrics>,
    pub dlq: Option<Arc<DeadLetterQueue>>,
    pub dlq_on_failure: bool,
    pub watermark: Option<Arc<IngestWatermark>>,
}

/// How one message ended up. Used for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Parsed message had nothing to route (no text, empty sync).
    Ignored,
    Malformed,
    Unsupported,
    /// No command matched.
    Unrouted,
    /// A command matched but the sender is not whitelisted.
    NotWhitelisted,
    Handled,
    /// The chain failed; the reason tag is attached.
    Failed(&'static str),
}

pub(crate) struct Worker {
    id: usize,
    shard: usize,
    shared: Arc<WorkerShared>,
    stop: CancellationToken,
}

impl Worker {
    pub(crate) fn new(id: usize, shard: usize, shared: Arc<WorkerShared>, stop: CancellationToken) -> Self {
        Self {
            id,
            shard,
            shared,
            stop,
        }
    }

    pub(crate) async fn run(self) {
        tracing::debug!(worker_id = self.id, shard = self.shard, "worker started");
        let queue = self.shared.queue.shard(self.shard).clone();
        loop {
            let item = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                item = queue.get() => item,
            };

            let enqueued_at = item.enqueued_at;
            self.process(item).await;

            queue.task_done();
            if let Some(watermark) = &self.shared.watermark {
                watermark.finish(enqueued_at);
            }
            self.shared.queue.publish_depth(self.shard);
        }
        tracing::debug!(worker_id = self.id, shard = self.shard, "worker stopped");
    }

    pub(crate) async fn process(&self, item: QueuedMessage) -> Disposition {
        let queue_latency = (Utc::now() - item.enqueued_at).to_std().unwrap_or(Duration::ZERO);
        self.shared.metrics.observe_queue_latency(queue_latency);

        let message = match self.shared.parser.parse(&item.raw) {
            Ok(Some(message)) => message,
            Ok(None) => return Disposition::Ignored,
            Err(ParseError::Malformed(reason)) => {
                tracing::warn!(worker_id = self.id, %reason, raw = %item.raw, "dropping malformed frame");
                self.shared.metrics.record_parse_error();
                return Disposition::Malformed;
            }
            Err(ParseError::Unsupported(reason)) => {
                tracing::debug!(worker_id = self.id, %reason, "dropping unsupported envelope");
                self.shared.metrics.record_parse_error();
                return Disposition::Unsupported;
            }
        };

        let disposition = self.dispatch(message, &item, queue_latency).await;
        self.shared.metrics.record_processed();
        disposition
    }

    async fn dispatch(&self, message: ParsedMessage, item: &QueuedMessage, queue_latency: Duration) -> Disposition {
        let Some(text) = message.text.as_deref().filter(|text| !text.is_empty()) else {
            return Disposition::Ignored;
        };

        let route = {
            let router = self.shared.router.read().expect("router lock poisoned");
            router.match_text(text)
        };
        let Some(route) = route else {
            return Disposition::Unrouted;
        };

        let sender_allowed = [
            Some(message.source.as_str()),
            message.source_number.as_deref(),
            message.source_uuid.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|sender| route.command.allows(sender));
        if !sender_allowed {
            return Disposition::NotWhitelisted;
        }

        let chain: Arc<[Arc<dyn MiddlewareDyn>]> = {
            let middleware = self.shared.middleware.read().expect("middleware lock poisoned");
            middleware.iter().cloned().collect()
        };

        let command_name: Arc<str> = Arc::from(route.command.name());
        let trigger: Arc<str> = Arc::from(route.trigger.to_string());
        let message = Arc::new(message);
        let message_id = message.id();
        let ctx = MessageContext::new(
            message,
            Arc::from(item.raw.as_str()),
            self.id,
            self.shard,
            command_name.clone(),
            trigger.clone(),
            queue_latency,
            item.attempts,
            self.shared.services.clone(),
        );

        let started = Instant::now();
        let outcome = AssertUnwindSafe(Next::new(chain, route.command.handler()).run(ctx))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };
        self.shared
            .metrics
            .record_command(&command_name, result.is_ok(), started.elapsed());

        let Err(error) = result else {
            return Disposition::Handled;
        };

        let reason = error.reason();
        tracing::error!(
            worker_id = self.id,
            command = %command_name,
            trigger = %trigger,
            queue_latency_ms = queue_latency.as_millis() as u64,
            message_id = %message_id,
            attempts = item.attempts,
            reason,
            error = %error,
            "command failed"
        );

        if self.shared.dlq_on_failure {
            if let Some(dlq) = &self.shared.dlq {
                let letter = DeadLetter::new(frame_to_payload(&item.raw))
                    .with_reason(reason)
                    .with_metadata(json!({
                        "worker_id": self.id,
                        "shard": self.shard,
                        "command": command_name.as_ref(),
                        "trigger": trigger.as_ref(),
                        "message_id": message_id,
                        "error": error.to_string(),
                    }))
                    .with_retry_count(item.attempts);
                if let Err(e) = dlq.send_with(letter).await {
                    tracing::error!(worker_id = self.id, message_id = %message_id, error = %e, "failed to dead-letter message");
                }
            }
        }
        Disposition::Failed(reason)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
