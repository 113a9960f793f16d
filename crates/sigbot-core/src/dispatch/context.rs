//! Per-message context handed to middleware and command handlers.

use std::sync::Arc;
use std::time::Duration;

use sigbot_types::message::ParsedMessage;

use crate::lock_manager::LockManager;
use crate::resilience::OutboundGuard;

/// Shared runtime services reachable from handlers.
#[derive(Debug, Clone)]
pub struct Services {
    pub locks: Arc<LockManager>,
    pub outbound: OutboundGuard,
}

/// Everything a handler knows about the message it is handling.
///
/// Cheap to clone; middleware may hand a modified copy down the chain.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: Arc<ParsedMessage>,
    /// The frame the message was parsed from.
    pub raw: Arc<str>,
    pub worker_id: usize,
    pub shard: usize,
    /// Name of the routed command.
    pub command: Arc<str>,
    /// The trigger that selected the command, as written at registration.
    pub trigger: Arc<str>,
    /// Time the frame spent in the queue before a worker picked it up.
    pub queue_latency: Duration,
    /// Failed delivery attempts before this one.
    pub attempts: u32,
    services: Services,
}

impl MessageContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message: Arc<ParsedMessage>,
        raw: Arc<str>,
        worker_id: usize,
        shard: usize,
        command: Arc<str>,
        trigger: Arc<str>,
        queue_latency: Duration,
        attempts: u32,
        services: Services,
    ) -> Self {
        Self {
            message,
            raw,
            worker_id,
            shard,
            command,
            trigger,
            queue_latency,
            attempts,
            services,
        }
    }

    /// Message body; empty when the message has none.
    pub fn text(&self) -> &str {
        self.message.text.as_deref().unwrap_or_default()
    }

    pub fn sender(&self) -> &str {
        &self.message.source
    }

    pub fn conversation_id(&self) -> &str {
        self.message.conversation_id()
    }

    /// Text after the matched literal trigger, trimmed. For pattern triggers
    /// this is the whole text.
    pub fn args(&self) -> &str {
        let text = self.text();
        match text.get(..self.trigger.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(&self.trigger) => text[self.trigger.len()..].trim(),
            _ => text.trim(),
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.services.locks
    }

    /// Rate-limited, circuit-broken access to downstream endpoints.
    pub fn outbound(&self) -> &OutboundGuard {
        &self.services.outbound
    }
}
