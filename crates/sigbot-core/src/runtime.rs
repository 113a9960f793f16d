//! The bot runtime: one instance of every component, wired from `BotConfig`.
//!
//! `run()` owns the task lifecycle. Shutdown order: close the transport and
//! stop the maintenance tasks so nothing new enters the queue, then drain the
//! queue, stop the workers and wait for them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sigbot_types::breaker::CircuitState;
use sigbot_types::config::BotConfig;
use sigbot_types::dlq::DeadLetter;
use sigbot_types::error::{ConfigError, StorageError, TransportError};
use sigbot_types::message::{QueuedMessage, ReplayEntry};
use sigbot_types::metrics::MetricsSnapshot;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Command, DispatchQueue, MiddlewareDyn, PoolParts, PoolSettings, RouterError, Services, WorkerPool};
use crate::dlq::{DeadLetterQueue, DlqSettings, payload_to_frame};
use crate::ingest::{IngestWatermark, IntakeController, Listener, ListenerSettings, ReplayBuffer};
use crate::lock_manager::LockManager;
use crate::metrics::RuntimeMetrics;
use crate::parser::MessageParser;
use crate::resilience::{CircuitBreaker, CircuitBreakerSettings, OutboundGuard, RateLimiter};
use crate::storage::BoxStorage;
use crate::transport::Transport;

/// Errors that end `BotRuntime::run` or prevent construction.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("command registration failed: {0}")]
    Router(#[from] RouterError),

    #[error("runtime is already running")]
    AlreadyRunning,
}

/// Counts from one pass of moving ready DLQ entries back into the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueSummary {
    pub requeued: usize,
    /// Ready entries that found their shard full and went back to the DLQ.
    pub deferred: usize,
}

/// Shared pieces the maintenance tasks need.
struct Core {
    queue: Arc<DispatchQueue>,
    parser: Arc<dyn MessageParser>,
    metrics: Arc<RuntimeMetrics>,
    dlq: Arc<DeadLetterQueue>,
    replay: Option<Arc<ReplayBuffer>>,
    watermark: Arc<IngestWatermark>,
}

impl Core {
    fn shard_for(&self, raw: &str) -> usize {
        if self.queue.is_sharded() {
            self.queue.shard_for(self.parser.conversation_key(raw).as_deref())
        } else {
            0
        }
    }

    /// Non-blocking put used by recovery and requeue. Gives the item back when the shard is full.
    fn offer(&self, item: QueuedMessage) -> Result<usize, QueuedMessage> {
        let shard = self.shard_for(&item.raw);
        let enqueued_at = item.enqueued_at;
        self.watermark.track(enqueued_at);
        match self.queue.shard(shard).try_put(item) {
            Ok(()) => {
                self.queue.publish_depth(shard);
                Ok(shard)
            }
            Err(item) => {
                self.watermark.finish(enqueued_at);
                Err(item)
            }
        }
    }

    async fn requeue_ready(&self) -> Result<RequeueSummary, StorageError> {
        let ready = self.dlq.replay().await?;
        let mut summary = RequeueSummary::default();
        for entry in ready {
            let item = QueuedMessage::new(payload_to_frame(&entry.payload)).with_attempts(entry.retry_count);
            let mirror = self.replay.as_ref().map(|_| ReplayEntry::from(&item));
            match self.offer(item) {
                Ok(_) => {
                    summary.requeued += 1;
                    if let (Some(replay), Some(mirror)) = (&self.replay, mirror) {
                        if let Err(e) = replay.append_entry(&mirror).await {
                            tracing::error!(key = %replay.key(), error = %e, "failed to persist requeued dead letter");
                        }
                    }
                }
                Err(_) => {
                    let letter = DeadLetter {
                        payload: entry.payload,
                        reason: entry.reason,
                        metadata: entry.metadata,
                        retry_count: entry.retry_count,
                    };
                    self.dlq.send_with(letter).await?;
                    summary.deferred += 1;
                }
            }
        }
        self.metrics.record_dlq_requeued(summary.requeued);
        if summary.requeued > 0 || summary.deferred > 0 {
            tracing::info!(
                requeued = summary.requeued,
                deferred = summary.deferred,
                "dead letters moved back to the queue"
            );
        }
        Ok(summary)
    }

    async fn compact(&self) -> Result<Option<usize>, StorageError> {
        let (Some(replay), Some(floor)) = (&self.replay, self.watermark.compaction_floor()) else {
            return Ok(None);
        };
        replay.compact(floor).await.map(Some)
    }
}

/// The composed bot runtime.
pub struct BotRuntime {
    config: BotConfig,
    core: Arc<Core>,
    intake: Arc<IntakeController>,
    services: Services,
    pool: WorkerPool,
    listener: Listener,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    initialized: tokio::sync::OnceCell<usize>,
    running: AtomicBool,
}

impl BotRuntime {
    /// Build every component. The configuration is validated first.
    pub fn new(
        config: BotConfig,
        storage: BoxStorage,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn MessageParser>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let metrics = Arc::new(RuntimeMetrics::new());
        let queue = Arc::new(DispatchQueue::new(
            config.worker.queue_size,
            config.worker.shard_count,
            metrics.clone(),
        ));
        let intake = Arc::new(IntakeController::new(config.ingest.pause(), metrics.clone()));
        let watermark = Arc::new(IngestWatermark::new());
        let dlq = Arc::new(DeadLetterQueue::new(
            storage.clone(),
            DlqSettings::from(&config.dlq),
            metrics.clone(),
        ));
        let replay = config.ingest.durable_queue_enabled.then(|| {
            Arc::new(ReplayBuffer::new(
                storage.clone(),
                config.ingest.queue_name.clone(),
                config.ingest.durable_queue_max_length,
            ))
        });

        let services = Services {
            locks: Arc::new(LockManager::new()),
            outbound: OutboundGuard::new(
                Arc::new(RateLimiter::new(
                    config.rate_limiter.rate_limit,
                    config.rate_limiter.period(),
                    metrics.clone(),
                )),
                Arc::new(CircuitBreaker::new(
                    CircuitBreakerSettings::from(&config.circuit_breaker),
                    metrics.clone(),
                )),
            ),
        };

        let pool = WorkerPool::new(
            PoolParts {
                queue: queue.clone(),
                parser: parser.clone(),
                services: services.clone(),
                metrics: metrics.clone(),
                dlq: Some(dlq.clone()),
                watermark: Some(watermark.clone()),
            },
            PoolSettings {
                pool_size: config.worker.pool_size,
                dlq_on_failure: config.worker.dlq_on_failure,
            },
        );

        let mut listener = Listener::new(
            transport.clone(),
            parser.clone(),
            queue.clone(),
            intake.clone(),
            metrics.clone(),
            ListenerSettings::from(&config.worker),
        )
        .with_dead_letter_queue(dlq.clone())
        .with_watermark(watermark.clone());
        if let Some(replay) = &replay {
            listener = listener.with_replay_buffer(replay.clone());
        }

        Ok(Self {
            config,
            core: Arc::new(Core {
                queue,
                parser,
                metrics,
                dlq,
                replay,
                watermark,
            }),
            intake,
            services,
            pool,
            listener,
            transport,
            shutdown: CancellationToken::new(),
            initialized: tokio::sync::OnceCell::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn register(&self, command: impl Into<Arc<Command>>) -> Result<bool, RuntimeError> {
        Ok(self.pool.register(command)?)
    }

    pub fn use_middleware(&self, middleware: Arc<dyn MiddlewareDyn>) -> bool {
        self.pool.use_middleware(middleware)
    }

    /// Recover persisted frames into the queue. Runs once; later calls return
    /// the first result.
    ///
    /// Recovery stops at the first full shard; what is left stays in the
    /// replay buffer for the next start and compaction never drops it.
    pub async fn initialize(&self) -> Result<usize, RuntimeError> {
        let recovered = self.initialized.get_or_try_init(|| self.recover()).await?;
        Ok(*recovered)
    }

    async fn recover(&self) -> Result<usize, RuntimeError> {
        self.core.dlq.backlog().await?;
        let Some(replay) = &self.core.replay else {
            return Ok(0);
        };
        let entries = replay.replay().await?;
        let total = entries.len();
        let mut recovered = 0;
        let mut entries = entries.into_iter();
        while let Some(entry) = entries.next() {
            let enqueued_at = entry.enqueued_at;
            if self.core.offer(entry.into()).is_err() {
                let oldest = entries.by_ref().map(|rest| rest.enqueued_at).fold(enqueued_at, std::cmp::min);
                self.core.watermark.hold(oldest);
                tracing::warn!(recovered, remaining = total - recovered, "queue full, recovery stopped");
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Run until the transport ends, fails, or `shutdown()` is called.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyRunning);
        }
        let recovered = self.initialize().await?;

        self.pool.start();
        let maintenance = CancellationToken::new();
        let tasks = self.spawn_maintenance(&maintenance);
        tracing::info!(
            recovered,
            workers = self.pool.worker_count(),
            shards = self.core.queue.shard_count(),
            "bot runtime started"
        );

        let listener = self.listener.run();
        tokio::pin!(listener);
        let outcome = tokio::select! {
            result = &mut listener => result,
            _ = self.shutdown.cancelled() => {
                tracing::info!("shutdown requested");
                self.transport.close();
                listener.await
            }
        };

        self.transport.close();
        maintenance.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "maintenance task ended abnormally");
            }
        }
        tracing::info!(queue_depth = self.core.queue.len(), "draining queue");
        self.core.queue.join().await;
        self.pool.stop();
        self.pool.join().await;
        if let Err(e) = self.core.compact().await {
            tracing::error!(error = %e, "final replay buffer compaction failed");
        }
        tracing::info!("bot runtime stopped");

        outcome.map_err(RuntimeError::from)
    }

    /// Request a graceful shutdown of `run()`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled when shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Move ready DLQ entries back into the queue now.
    pub async fn requeue_dead_letters(&self) -> Result<RequeueSummary, RuntimeError> {
        Ok(self.core.requeue_ready().await?)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    pub fn runtime_metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.core.metrics
    }

    pub fn dead_letter_queue(&self) -> &Arc<DeadLetterQueue> {
        &self.core.dlq
    }

    pub fn replay_buffer(&self) -> Option<&Arc<ReplayBuffer>> {
        self.core.replay.as_ref()
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.core.queue
    }

    pub fn intake(&self) -> &Arc<IntakeController> {
        &self.intake
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn spawn_maintenance(&self, stop: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.spawn_breaker_bridge(stop.clone())];

        let replay_every = Duration::from_secs(self.config.dlq.replay_interval_secs);
        if !replay_every.is_zero() {
            let core = self.core.clone();
            tasks.push(spawn_periodic(stop.clone(), replay_every, move || {
                let core = core.clone();
                async move {
                    if let Err(e) = core.requeue_ready().await {
                        tracing::error!(error = %e, "dead letter requeue failed");
                    }
                }
            }));
        }

        let compact_every = Duration::from_secs(self.config.ingest.compaction_interval_secs);
        if self.core.replay.is_some() && !compact_every.is_zero() {
            let core = self.core.clone();
            tasks.push(spawn_periodic(stop.clone(), compact_every, move || {
                let core = core.clone();
                async move {
                    if let Err(e) = core.compact().await {
                        tracing::error!(error = %e, "replay buffer compaction failed");
                    }
                }
            }));
        }
        tasks
    }

    /// Pause intake for the reset timeout whenever a circuit opens.
    fn spawn_breaker_bridge(&self, stop: CancellationToken) -> JoinHandle<()> {
        let breaker = self.services.outbound.breaker();
        let mut transitions = breaker.subscribe();
        let pause = breaker.settings().reset_timeout;
        let intake = self.intake.clone();
        tokio::spawn(async move {
            loop {
                let transition = tokio::select! {
                    _ = stop.cancelled() => break,
                    transition = transitions.recv() => transition,
                };
                match transition {
                    Ok(transition) if transition.to == CircuitState::Open => {
                        tracing::warn!(endpoint = %transition.endpoint, "circuit opened, pausing intake");
                        intake.pause("circuit_open", Some(pause));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed circuit breaker transitions");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for BotRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotRuntime")
            .field("pool", &self.pool)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

fn spawn_periodic<F, Fut>(stop: CancellationToken, every: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use sigbot_types::config::StorageBackend;
    use sigbot_types::error::{DownstreamError, HandlerError};
    use sigbot_types::message::ReplayEntry;

    use crate::dispatch::{MessageContext, Next};
    use crate::dlq::frame_to_payload;
    use crate::parser::EnvelopeParser;
    use crate::storage::Storage;
    use crate::test_support::{ScriptedTransport, VecStorage, data_frame};

    type Seen = Arc<Mutex<Vec<String>>>;

    fn config() -> BotConfig {
        let mut config = BotConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.worker.pool_size = 2;
        config.dlq.base_backoff_ms = 0;
        config.dlq.max_backoff_ms = 0;
        config
    }

    fn runtime(config: BotConfig, storage: &VecStorage, transport: Arc<ScriptedTransport>) -> BotRuntime {
        BotRuntime::new(
            config,
            BoxStorage::new(storage.clone()),
            transport,
            Arc::new(EnvelopeParser::new()),
        )
        .unwrap()
    }

    fn echo(seen: &Seen) -> Command {
        let seen = seen.clone();
        Command::builder("echo")
            .trigger("!echo")
            .handler(move |ctx: MessageContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.args().to_string());
                    Ok::<(), HandlerError>(())
                }
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.worker.queue_size = 0;
        let result = BotRuntime::new(
            config,
            BoxStorage::new(VecStorage::default()),
            Arc::new(ScriptedTransport::new(Vec::new())),
            Arc::new(EnvelopeParser::new()),
        );
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_stream_then_drains() {
        let storage = VecStorage::default();
        let frames = (1..=5).map(|n| data_frame("+1555", n, &format!("!echo {n}"))).collect();
        let transport = Arc::new(ScriptedTransport::new(frames));
        let runtime = runtime(config(), &storage, transport.clone());
        let seen: Seen = Arc::default();
        runtime.register(echo(&seen)).unwrap();

        runtime.run().await.unwrap();

        let mut handled = seen.lock().unwrap().clone();
        handled.sort();
        assert_eq!(handled, vec!["1", "2", "3", "4", "5"]);
        assert!(runtime.queue().is_empty());
        assert_eq!(runtime.metrics().messages_processed, 5);
        assert!(transport.close_calls() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_twice_concurrently_is_rejected() {
        let storage = VecStorage::default();
        let transport = Arc::new(ScriptedTransport::held_open(Vec::new()));
        let runtime = Arc::new(runtime(config(), &storage, transport));
        let handle = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(runtime.run().await, Err(RuntimeError::AlreadyRunning)));
        runtime.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_transport_and_stops_workers() {
        let storage = VecStorage::default();
        let transport = Arc::new(ScriptedTransport::held_open(vec![data_frame("+1555", 1, "!echo hi")]));
        let runtime = Arc::new(runtime(config(), &storage, transport.clone()));
        let seen: Seen = Arc::default();
        runtime.register(echo(&seen)).unwrap();

        let handle = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.shutdown();
        handle.await.unwrap().unwrap();

        assert_eq!(transport.close_calls(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["hi"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_returned_after_drain() {
        let storage = VecStorage::default();
        let transport = Arc::new(ScriptedTransport::with_items(
            vec![
                Ok(data_frame("+1555", 1, "!echo before")),
                Err(TransportError::Fatal("gone".into())),
            ],
            false,
        ));
        let runtime = runtime(config(), &storage, transport);
        let seen: Seen = Arc::default();
        runtime.register(echo(&seen)).unwrap();

        let err = runtime.run().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(TransportError::Fatal(_))));
        assert_eq!(*seen.lock().unwrap(), vec!["before"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_recovers_replay_buffer_once() {
        let storage = VecStorage::default();
        let mut config = config();
        config.ingest.durable_queue_enabled = true;
        let pending = ReplayBuffer::new(BoxStorage::new(storage.clone()), config.ingest.queue_name.clone(), 100);
        for n in 1..=3 {
            pending
                .append(&data_frame("+1555", n, &format!("!echo recovered {n}")), chrono::Utc::now())
                .await
                .unwrap();
        }

        let runtime = runtime(config, &storage, Arc::new(ScriptedTransport::new(Vec::new())));
        let seen: Seen = Arc::default();
        runtime.register(echo(&seen)).unwrap();
        assert_eq!(runtime.initialize().await.unwrap(), 3);
        assert_eq!(runtime.initialize().await.unwrap(), 3);
        assert_eq!(runtime.queue().len(), 3);

        runtime.run().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(storage.len("sigbot_ingest"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_stops_at_full_queue() {
        let storage = VecStorage::default();
        let mut config = config();
        config.ingest.durable_queue_enabled = true;
        config.worker.queue_size = 2;
        let key = config.ingest.queue_name.clone();
        for n in 1..=4 {
            let entry = ReplayEntry {
                raw: data_frame("+1555", n, "!echo"),
                enqueued_at: chrono::Utc::now(),
                attempts: 0,
            };
            storage.append(&key, &serde_json::to_value(entry).unwrap()).await.unwrap();
        }

        let runtime = runtime(config, &storage, Arc::new(ScriptedTransport::new(Vec::new())));
        assert_eq!(runtime.initialize().await.unwrap(), 2);
        assert_eq!(storage.len(&key), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_left_by_partial_recovery_survive_compaction() {
        let storage = VecStorage::default();
        let mut config = config();
        config.ingest.durable_queue_enabled = true;
        config.worker.queue_size = 2;
        let key = config.ingest.queue_name.clone();
        let t0 = chrono::Utc::now();
        for n in 1..=4 {
            let entry = ReplayEntry {
                raw: data_frame("+1555", n, &format!("!echo {n}")),
                enqueued_at: t0 + chrono::Duration::seconds(n),
                attempts: 0,
            };
            storage.append(&key, &serde_json::to_value(entry).unwrap()).await.unwrap();
        }

        let runtime = runtime(config, &storage, Arc::new(ScriptedTransport::new(Vec::new())));
        let seen: Seen = Arc::default();
        runtime.register(echo(&seen)).unwrap();
        assert_eq!(runtime.initialize().await.unwrap(), 2);
        runtime.run().await.unwrap();

        let mut handled = seen.lock().unwrap().clone();
        handled.sort();
        assert_eq!(handled, vec!["1", "2"]);
        let left: Vec<String> = runtime
            .replay_buffer()
            .unwrap()
            .replay()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.raw)
            .collect();
        assert_eq!(left, vec![data_frame("+1555", 3, "!echo 3"), data_frame("+1555", 4, "!echo 4")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_dead_letter_is_persisted_with_attempts() {
        let storage = VecStorage::default();
        let mut config = config();
        config.ingest.durable_queue_enabled = true;
        let key = config.ingest.queue_name.clone();
        let runtime = runtime(config, &storage, Arc::new(ScriptedTransport::new(Vec::new())));
        runtime
            .dead_letter_queue()
            .send(frame_to_payload(&data_frame("+1555", 1, "!echo again")))
            .await
            .unwrap();

        let summary = runtime.requeue_dead_letters().await.unwrap();
        assert_eq!(summary, RequeueSummary { requeued: 1, deferred: 0 });
        assert_eq!(runtime.queue().len(), 1);
        assert!(runtime.dead_letter_queue().inspect().await.unwrap().is_empty());

        let persisted = runtime.replay_buffer().unwrap().replay().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].raw, data_frame("+1555", 1, "!echo again"));
        assert_eq!(persisted[0].attempts, 1);
        assert_eq!(storage.len(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letters_are_not_requeued_while_draining() {
        let storage = VecStorage::default();
        let mut config = config();
        config.dlq.replay_interval_secs = 1;
        let transport = Arc::new(ScriptedTransport::new(vec![data_frame("+1555", 1, "!slow first")]));
        let runtime = runtime(config, &storage, transport);
        let seen: Seen = Arc::default();
        let record = seen.clone();
        let slow = Command::builder("slow")
            .trigger("!slow")
            .handler(move |ctx: MessageContext| {
                let record = record.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    record.lock().unwrap().push(ctx.args().to_string());
                    Ok::<(), HandlerError>(())
                }
            })
            .build()
            .unwrap();
        runtime.register(slow).unwrap();
        runtime
            .dead_letter_queue()
            .send(frame_to_payload(&data_frame("+1555", 2, "!slow parked")))
            .await
            .unwrap();

        runtime.run().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["first"]);
        assert_eq!(runtime.dead_letter_queue().inspect().await.unwrap().len(), 1);
        assert!(runtime.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_dead_letter_keeps_its_retry_count() {
        let storage = VecStorage::default();
        let mut config = config();
        config.ingest.durable_queue_enabled = true;
        let key = config.ingest.queue_name.clone();
        let entry = ReplayEntry {
            raw: data_frame("+1555", 1, "!flaky"),
            enqueued_at: chrono::Utc::now(),
            attempts: 1,
        };
        storage.append(&key, &serde_json::to_value(entry).unwrap()).await.unwrap();

        let runtime = runtime(config, &storage, Arc::new(ScriptedTransport::new(Vec::new())));
        let flaky = Command::builder("flaky")
            .trigger("!flaky")
            .handler(|_ctx: MessageContext| async move {
                Err::<(), HandlerError>(DownstreamError::from_status(503, "unavailable").into())
            })
            .build()
            .unwrap();
        runtime.register(flaky).unwrap();
        runtime.run().await.unwrap();

        let entries = runtime.dead_letter_queue().inspect().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_is_requeued_with_attempts() {
        let storage = VecStorage::default();
        let runtime = runtime(config(), &storage, Arc::new(ScriptedTransport::new(Vec::new())));
        let attempts: Arc<Mutex<Vec<u32>>> = Arc::default();
        let record = attempts.clone();
        let flaky = Command::builder("flaky")
            .trigger("!flaky")
            .handler(move |ctx: MessageContext| {
                let record = record.clone();
                async move {
                    record.lock().unwrap().push(ctx.attempts);
                    Err::<(), HandlerError>(DownstreamError::from_status(429, "slow down").into())
                }
            })
            .build()
            .unwrap();
        runtime.register(flaky).unwrap();

        runtime.pool().start();
        runtime
            .queue()
            .shard(0)
            .put(QueuedMessage::new(data_frame("+1555", 1, "!flaky")))
            .await;
        runtime.queue().join().await;
        let entries = runtime.dead_letter_queue().inspect().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason.as_deref(), Some("rate_limited"));

        let summary = runtime.requeue_dead_letters().await.unwrap();
        assert_eq!(summary, RequeueSummary { requeued: 1, deferred: 0 });
        runtime.queue().join().await;
        assert_eq!(*attempts.lock().unwrap(), vec![0, 1]);

        let entries = runtime.dead_letter_queue().inspect().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(runtime.metrics().dlq.requeued, 1);

        runtime.pool().stop();
        runtime.pool().join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_pauses_intake() {
        let storage = VecStorage::default();
        let mut config = config();
        config.circuit_breaker.failure_threshold = 1;
        let runtime = Arc::new(runtime(config, &storage, Arc::new(ScriptedTransport::held_open(Vec::new()))));
        let handle = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = runtime
            .services()
            .outbound
            .call("send", async { Err::<(), _>(DownstreamError::from_status(500, "boom")) })
            .await;
        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(runtime.intake().is_paused());
        assert_eq!(runtime.metrics().ingest_pauses.get("circuit_open"), Some(&1));
        runtime.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_middleware_wraps_every_command() {
        let storage = VecStorage::default();
        let transport = Arc::new(ScriptedTransport::new(vec![data_frame("+1555", 1, "!echo one")]));
        let runtime = runtime(config(), &storage, transport);
        let seen: Seen = Arc::default();
        runtime.register(echo(&seen)).unwrap();
        let tagged = seen.clone();
        runtime.use_middleware(Arc::new(move |ctx: MessageContext, next: Next| {
            let tagged = tagged.clone();
            async move {
                tagged.lock().unwrap().push(format!("via {}", ctx.command));
                next.run(ctx).await
            }
        }));

        runtime.run().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["via echo", "one"]);
    }
}
