//! In-crate fakes for the storage and transport ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use sigbot_types::error::{StorageError, TransportError};
use sigbot_types::message::ParsedMessage;
use tokio_util::sync::CancellationToken;

use crate::dispatch::context::{MessageContext, Services};
use crate::lock_manager::LockManager;
use crate::metrics::RuntimeMetrics;
use crate::resilience::{CircuitBreaker, CircuitBreakerSettings, OutboundGuard, RateLimiter};
use crate::storage::Storage;
use crate::transport::{FrameStream, Transport};

/// Services with a generous rate limit and default breaker settings.
pub fn test_services() -> Services {
    let metrics = Arc::new(RuntimeMetrics::new());
    Services {
        locks: Arc::new(LockManager::new()),
        outbound: OutboundGuard::new(
            Arc::new(RateLimiter::new(1000, Duration::from_secs(1), metrics.clone())),
            Arc::new(CircuitBreaker::new(CircuitBreakerSettings::default(), metrics)),
        ),
    }
}

/// Context for a direct message from `+15550001` routed via the `!echo` trigger.
pub fn test_context(text: &str) -> MessageContext {
    MessageContext::new(
        Arc::new(ParsedMessage::text("+15550001", 1_700_000_000_000, text)),
        Arc::from(text),
        0,
        0,
        Arc::from("echo"),
        Arc::from("!echo"),
        Duration::ZERO,
        0,
        test_services(),
    )
}

/// A gateway data-message frame.
pub fn data_frame(source: &str, timestamp: i64, text: &str) -> String {
    json!({
        "envelope": {
            "source": source,
            "timestamp": timestamp,
            "dataMessage": {"message": text, "timestamp": timestamp}
        }
    })
    .to_string()
}

/// A gateway group data-message frame.
pub fn group_frame(source: &str, group_id: &str, timestamp: i64, text: &str) -> String {
    json!({
        "envelope": {
            "source": source,
            "timestamp": timestamp,
            "dataMessage": {"message": text, "groupInfo": {"groupId": group_id}}
        }
    })
    .to_string()
}

/// Storage backed by a shared map of vectors. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct VecStorage {
    lists: Arc<Mutex<HashMap<String, Vec<Value>>>>,
}

impl VecStorage {
    pub fn len(&self, key: &str) -> usize {
        self.lists
            .lock()
            .unwrap()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn records(&self, key: &str) -> Vec<Value> {
        self.lists.lock().unwrap().get(key).cloned().unwrap_or_default()
    }
}

impl Storage for VecStorage {
    async fn append(&self, key: &str, record: &Value) -> Result<(), StorageError> {
        self.lists
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_all(&self, key: &str) -> Result<Vec<Value>, StorageError> {
        Ok(self.records(key))
    }

    async fn delete_all(&self, key: &str) -> Result<(), StorageError> {
        self.lists.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Storage whose every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStorage;

impl Storage for FailingStorage {
    async fn append(&self, _key: &str, _record: &Value) -> Result<(), StorageError> {
        Err(StorageError::Connection("storage offline".into()))
    }

    async fn read_all(&self, _key: &str) -> Result<Vec<Value>, StorageError> {
        Err(StorageError::Connection("storage offline".into()))
    }

    async fn delete_all(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Connection("storage offline".into()))
    }
}

/// [`VecStorage`] whose next `n` appends fail once armed.
#[derive(Debug, Clone, Default)]
pub struct FlakyStorage {
    inner: VecStorage,
    failing_appends: Arc<AtomicUsize>,
}

impl FlakyStorage {
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &VecStorage {
        &self.inner
    }
}

impl Storage for FlakyStorage {
    async fn append(&self, key: &str, record: &Value) -> Result<(), StorageError> {
        let armed = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StorageError::Connection("write rejected".into()));
        }
        self.inner.append(key, record).await
    }

    async fn read_all(&self, key: &str) -> Result<Vec<Value>, StorageError> {
        self.inner.read_all(key).await
    }

    async fn delete_all(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete_all(key).await
    }
}

/// Transport that replays a fixed script of frames.
///
/// With `hold_open`, the stream stays pending after the script until
/// `close()` is called, like a live connection with no traffic.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<Option<Vec<Result<String, TransportError>>>>,
    hold_open: bool,
    closed: CancellationToken,
    close_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(frames: Vec<String>) -> Self {
        Self::with_items(frames.into_iter().map(Ok).collect(), false)
    }

    pub fn held_open(frames: Vec<String>) -> Self {
        Self::with_items(frames.into_iter().map(Ok).collect(), true)
    }

    pub fn with_items(items: Vec<Result<String, TransportError>>, hold_open: bool) -> Self {
        Self {
            script: Mutex::new(Some(items)),
            hold_open,
            closed: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn listen(&self) -> FrameStream {
        let items = self.script.lock().unwrap().take().unwrap_or_default();
        let closed = self.closed.clone();
        let hold_open = self.hold_open;
        Box::pin(async_stream::stream! {
            for item in items {
                if closed.is_cancelled() {
                    return;
                }
                yield item;
            }
            if hold_open {
                closed.cancelled().await;
            }
        })
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}
