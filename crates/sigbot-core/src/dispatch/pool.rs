//! Worker pool: owns the router, the middleware chain and the worker tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::Services;
use super::middleware::MiddlewareDyn;
use super::queue::DispatchQueue;
use super::router::{Command, CommandRouter, RouterError};
use super::worker::{Worker, WorkerShared};
use crate::dlq::DeadLetterQueue;
use crate::ingest::IngestWatermark;
use crate::metrics::RuntimeMetrics;
use crate::parser::MessageParser;

/// Collaborators shared by every worker.
pub struct PoolParts {
    pub queue: Arc<DispatchQueue>,
    pub parser: Arc<dyn MessageParser>,
    pub services: Services,
    pub metrics: Arc<RuntimeMetrics>,
    pub dlq: Option<Arc<DeadLetterQueue>>,
    pub watermark: Option<Arc<IngestWatermark>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Workers on the single shard when the queue is not sharded.
    pub pool_size: usize,
    /// Forward failed messages to the DLQ.
    pub dlq_on_failure: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            dlq_on_failure: true,
        }
    }
}

/// Runs the consumer side of the dispatch queue.
///
/// With a sharded queue each shard gets exactly one worker so a conversation
/// is always handled in arrival order. Commands and middleware registered
/// after `start()` are seen by the running workers on their next message.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    pool_size: usize,
    started: AtomicBool,
    stop: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(parts: PoolParts, settings: PoolSettings) -> Self {
        let shared = WorkerShared {
            queue: parts.queue,
            parser: parts.parser,
            router: RwLock::new(CommandRouter::new()),
            middleware: RwLock::new(Vec::new()),
            services: parts.services,
            metrics: parts.metrics,
            dlq: parts.dlq,
            dlq_on_failure: settings.dlq_on_failure,
            watermark: parts.watermark,
        };
        Self {
            shared: Arc::new(shared),
            pool_size: settings.pool_size.max(1),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a command. Returns `false` if this exact command is already registered.
    pub fn register(&self, command: impl Into<Arc<Command>>) -> Result<bool, RouterError> {
        let command = command.into();
        let name = command.name().to_string();
        let added = self
            .shared
            .router
            .write()
            .expect("router lock poisoned")
            .register(command)?;
        if added {
            tracing::debug!(command = %name, "command registered");
        }
        Ok(added)
    }

    /// Append a middleware to the chain. Returns `false` if it is already in the chain.
    pub fn use_middleware(&self, middleware: Arc<dyn MiddlewareDyn>) -> bool {
        let mut chain = self.shared.middleware.write().expect("middleware lock poisoned");
        if chain.iter().any(|existing| Arc::ptr_eq(existing, &middleware)) {
            return false;
        }
        chain.push(middleware);
        true
    }

    pub fn command_count(&self) -> usize {
        self.shared.router.read().expect("router lock poisoned").len()
    }

    pub fn middleware_count(&self) -> usize {
        self.shared.middleware.read().expect("middleware lock poisoned").len()
    }

    /// Number of workers `start()` spawns.
    pub fn worker_count(&self) -> usize {
        if self.shared.queue.is_sharded() {
            self.shared.queue.shard_count()
        } else {
            self.pool_size
        }
    }

    /// The configured `pool_size` when sharding overrides it.
    pub fn ignored_pool_size(&self) -> Option<usize> {
        (self.shared.queue.is_sharded() && self.pool_size != self.worker_count()).then_some(self.pool_size)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the workers. Calling it again is a no-op; returns whether this call started them.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let sharded = self.shared.queue.is_sharded();
        let count = self.worker_count();
        if let Some(pool_size) = self.ignored_pool_size() {
            tracing::warn!(pool_size, workers = count, "queue is sharded, running one worker per shard instead of pool_size");
        }
        let mut handles = self.handles.lock().expect("pool lock poisoned");
        for id in 0..count {
            let shard = if sharded { id } else { 0 };
            let worker = Worker::new(id, shard, self.shared.clone(), self.stop.child_token());
            handles.push(tokio::spawn(worker.run()));
        }
        tracing::info!(workers = count, sharded, "worker pool started");
        true
    }

    /// Ask every worker to stop after its current message.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for every spawned worker to exit.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().expect("pool lock poisoned"));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sigbot_types::error::{DownstreamError, HandlerError};
    use sigbot_types::message::QueuedMessage;

    use crate::dispatch::context::MessageContext;
    use crate::dispatch::middleware::Next;
    use crate::dlq::DlqSettings;
    use crate::parser::EnvelopeParser;
    use crate::storage::BoxStorage;
    use crate::test_support::{VecStorage, data_frame, group_frame, test_services};

    type Seen = Arc<Mutex<Vec<String>>>;

    struct Harness {
        pool: WorkerPool,
        queue: Arc<DispatchQueue>,
        metrics: Arc<RuntimeMetrics>,
        dlq_storage: VecStorage,
    }

    fn harness(shard_count: usize, pool_size: usize) -> Harness {
        let metrics = Arc::new(RuntimeMetrics::new());
        let queue = Arc::new(DispatchQueue::new(16, shard_count, metrics.clone()));
        let dlq_storage = VecStorage::default();
        let dlq = Arc::new(DeadLetterQueue::new(
            BoxStorage::new(dlq_storage.clone()),
            DlqSettings::default(),
            metrics.clone(),
        ));
        let pool = WorkerPool::new(
            PoolParts {
                queue: queue.clone(),
                parser: Arc::new(EnvelopeParser::new()),
                services: test_services(),
                metrics: metrics.clone(),
                dlq: Some(dlq),
                watermark: None,
            },
            PoolSettings {
                pool_size,
                dlq_on_failure: true,
            },
        );
        Harness {
            pool,
            queue,
            metrics,
            dlq_storage,
        }
    }

    fn recorder(seen: &Seen) -> impl Fn(MessageContext) -> std::future::Ready<Result<(), HandlerError>> + use<> {
        let seen = seen.clone();
        move |ctx: MessageContext| {
            seen.lock().unwrap().push(format!("{}:{}", ctx.shard, ctx.args()));
            std::future::ready(Ok(()))
        }
    }

    async fn feed(queue: &DispatchQueue, frames: &[String]) {
        for frame in frames {
            queue.shard(0).put(QueuedMessage::new(frame.clone())).await;
        }
    }

    async fn drain(h: &Harness) {
        h.queue.join().await;
        h.pool.stop();
        h.pool.join().await;
    }

    #[tokio::test]
    async fn test_routes_message_to_handler() {
        let h = harness(1, 2);
        let seen: Seen = Arc::default();
        let command = Command::builder("echo").trigger("!echo").handler(recorder(&seen)).build().unwrap();
        assert!(h.pool.register(command).unwrap());

        h.pool.start();
        feed(&h.queue, &[data_frame("+1555", 1, "!echo hello"), data_frame("+1555", 2, "no command")]).await;
        drain(&h).await;

        assert_eq!(*seen.lock().unwrap(), vec!["0:hello"]);
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.messages_processed, 2);
        assert_eq!(snapshot.commands["echo"].successes, 1);
        assert_eq!(h.queue.shard(0).unfinished(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = harness(1, 3);
        assert!(h.pool.start());
        assert!(!h.pool.start());
        assert_eq!(h.pool.handles.lock().unwrap().len(), 3);
        h.pool.stop();
        h.pool.join().await;
    }

    #[tokio::test]
    async fn test_registration_after_start_is_visible() {
        let h = harness(1, 1);
        h.pool.start();
        let seen: Seen = Arc::default();
        let command = Command::builder("late").trigger("!late").handler(recorder(&seen)).build().unwrap();
        h.pool.register(command).unwrap();

        feed(&h.queue, &[data_frame("+1555", 1, "!late now")]).await;
        drain(&h).await;
        assert_eq!(*seen.lock().unwrap(), vec!["0:now"]);
    }

    #[tokio::test]
    async fn test_duplicate_middleware_is_ignored() {
        let h = harness(1, 1);
        let middleware: Arc<dyn MiddlewareDyn> = Arc::new(|ctx: MessageContext, next: Next| next.run(ctx));
        assert!(h.pool.use_middleware(middleware.clone()));
        assert!(!h.pool.use_middleware(middleware));
        assert_eq!(h.pool.middleware_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_goes_to_dlq_with_reason() {
        let h = harness(1, 1);
        let command = Command::builder("fetch")
            .trigger("!fetch")
            .handler(|_ctx: MessageContext| async {
                Err::<(), HandlerError>(DownstreamError::from_status(503, "upstream down").into())
            })
            .build()
            .unwrap();
        h.pool.register(command).unwrap();
        h.pool.start();

        let frame = data_frame("+1555", 7, "!fetch");
        feed(&h.queue, std::slice::from_ref(&frame)).await;
        drain(&h).await;

        let records = h.dlq_storage.records("sigbot_dlq");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["reason"], "server");
        assert_eq!(records[0]["metadata"]["command"], "fetch");
        assert_eq!(records[0]["payload"]["envelope"]["timestamp"], 7);
        assert_eq!(h.metrics.snapshot().commands["fetch"].failures, 1);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let h = harness(1, 1);
        let seen: Seen = Arc::default();
        let boom = Command::builder("boom")
            .trigger("!boom")
            .handler(|_ctx: MessageContext| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), HandlerError>(())
            })
            .build()
            .unwrap();
        let echo = Command::builder("echo").trigger("!echo").handler(recorder(&seen)).build().unwrap();
        h.pool.register(boom).unwrap();
        h.pool.register(echo).unwrap();
        h.pool.start();

        feed(&h.queue, &[data_frame("+1555", 1, "!boom"), data_frame("+1555", 2, "!echo still alive")]).await;
        drain(&h).await;

        assert_eq!(*seen.lock().unwrap(), vec!["0:still alive"]);
        let records = h.dlq_storage.records("sigbot_dlq");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["reason"], "panic");
    }

    #[tokio::test]
    async fn test_whitelist_drops_silently() {
        let h = harness(1, 1);
        let seen: Seen = Arc::default();
        let command = Command::builder("admin")
            .trigger("!admin")
            .whitelist(["+1999"])
            .handler(recorder(&seen))
            .build()
            .unwrap();
        h.pool.register(command).unwrap();
        h.pool.start();

        feed(&h.queue, &[data_frame("+1555", 1, "!admin x"), data_frame("+1999", 2, "!admin y")]).await;
        drain(&h).await;

        assert_eq!(*seen.lock().unwrap(), vec!["0:y"]);
        assert_eq!(h.dlq_storage.len("sigbot_dlq"), 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_counted() {
        let h = harness(1, 1);
        h.pool.start();
        feed(&h.queue, &["{not json".to_string(), "{\"envelope\":{}}".to_string()]).await;
        drain(&h).await;

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.parse_errors, 2);
        assert_eq!(snapshot.messages_processed, 0);
        assert_eq!(h.dlq_storage.len("sigbot_dlq"), 0);
    }

    #[tokio::test]
    async fn test_sharded_pool_keeps_conversation_order() {
        let h = harness(4, 1);
        assert_eq!(h.pool.worker_count(), 4);
        let seen: Seen = Arc::default();
        let command = Command::builder("echo").trigger("!echo").handler(recorder(&seen)).build().unwrap();
        h.pool.register(command).unwrap();
        h.pool.start();

        let shard = h.queue.shard_for(Some("group-a"));
        for n in 0..5 {
            let frame = group_frame("+1555", "group-a", n, &format!("!echo {n}"));
            h.queue.shard(shard).put(QueuedMessage::new(frame)).await;
        }
        drain(&h).await;

        let expected: Vec<String> = (0..5).map(|n| format!("{shard}:{n}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_sharding_overrides_pool_size() {
        let sharded = harness(3, 8);
        assert_eq!(sharded.pool.worker_count(), 3);
        assert_eq!(sharded.pool.ignored_pool_size(), Some(8));

        let matching = harness(3, 3);
        assert_eq!(matching.pool.ignored_pool_size(), None);

        let single = harness(1, 8);
        assert_eq!(single.pool.worker_count(), 8);
        assert_eq!(single.pool.ignored_pool_size(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_message_finish() {
        let h = harness(1, 1);
        let seen: Seen = Arc::default();
        let done = seen.clone();
        let command = Command::builder("slow")
            .trigger("!slow")
            .handler(move |_ctx: MessageContext| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    done.lock().unwrap().push("finished".to_string());
                    Ok::<(), HandlerError>(())
                }
            })
            .build()
            .unwrap();
        h.pool.register(command).unwrap();
        h.pool.start();

        feed(&h.queue, &[data_frame("+1555", 1, "!slow")]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.pool.stop();
        h.pool.join().await;

        assert_eq!(*seen.lock().unwrap(), vec!["finished"]);
        assert_eq!(h.queue.shard(0).unfinished(), 0);
    }
}
