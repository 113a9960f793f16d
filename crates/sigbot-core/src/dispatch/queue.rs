//! Bounded FIFO queues between the listener and the workers.
//!
//! `BoundedQueue` is a blocking primitive with completion tracking: every
//! item taken with `get` must be acknowledged with `task_done`, and `join`
//! waits until all accepted items are acknowledged. `DispatchQueue` groups
//! one or more shards and routes conversations to shards by a stable hash.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use sigbot_types::message::QueuedMessage;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::metrics::RuntimeMetrics;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    /// Accepted items not yet acknowledged (queued or in flight).
    unfinished: usize,
}

/// Bounded multi-producer, multi-consumer FIFO.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
    all_done: Notify,
}

impl<T> BoundedQueue<T> {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                unfinished: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            all_done: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accepted items that have not been acknowledged yet.
    pub fn unfinished(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").unfinished
    }

    /// Enqueue without waiting. Hands the item back when the queue is full.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.items.len() >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
            state.unfinished += 1;
        }
        self.not_empty.notify_waiters();
        Ok(())
    }

    /// Enqueue, waiting for space.
    pub async fn put(&self, mut item: T) {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_put(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
            notified.await;
        }
    }

    /// Enqueue, waiting at most `timeout` for space. Hands the item back on timeout.
    pub async fn put_timeout(&self, mut item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(back) => item = back,
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(item);
            }
        }
    }

    /// Dequeue without waiting.
    pub fn try_get(&self) -> Option<T> {
        let item = self.state.lock().expect("queue lock poisoned").items.pop_front();
        if item.is_some() {
            self.not_full.notify_waiters();
        }
        item
    }

    /// Remove the oldest queued item without waiting (drop-oldest backpressure).
    ///
    /// The caller still owes a `task_done` for the evicted item.
    pub fn try_pop_oldest(&self) -> Option<T> {
        self.try_get()
    }

    /// Dequeue, waiting for an item.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Acknowledge one item taken from the queue.
    pub fn task_done(&self) {
        let finished = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.unfinished == 0 {
                tracing::warn!("task_done called more times than items were queued");
                return;
            }
            state.unfinished -= 1;
            state.unfinished == 0
        };
        if finished {
            self.all_done.notify_waiters();
        }
    }

    /// Wait until every accepted item has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.all_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.unfinished() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Stable shard index for `key`: the first 8 bytes of its SHA-256, read
/// big-endian, modulo `shard_count`.
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shard_count as u64) as usize
}

/// The runtime's queue: one or more shards of queued frames.
#[derive(Debug)]
pub struct DispatchQueue {
    shards: Vec<Arc<BoundedQueue<QueuedMessage>>>,
    metrics: Arc<RuntimeMetrics>,
}

impl DispatchQueue {
    /// `capacity` is split evenly across `shard_count` shards (at least 1 each).
    pub fn new(capacity: usize, shard_count: usize, metrics: Arc<RuntimeMetrics>) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (capacity / shard_count).max(1);
        let shards = (0..shard_count)
            .map(|_| Arc::new(BoundedQueue::new(per_shard)))
            .collect();
        let queue = Self { shards, metrics };
        for shard in 0..shard_count {
            queue.publish_depth(shard);
        }
        queue
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_sharded(&self) -> bool {
        self.shards.len() > 1
    }

    /// Shard for a conversation. Frames without a key go to shard 0.
    pub fn shard_for(&self, key: Option<&str>) -> usize {
        key.map(|k| shard_index(k, self.shards.len())).unwrap_or(0)
    }

    /// Shard `index`, clamped to the last shard.
    pub fn shard(&self, index: usize) -> &Arc<BoundedQueue<QueuedMessage>> {
        let last = self.shards.len() - 1;
        &self.shards[index.min(last)]
    }

    pub fn shards(&self) -> &[Arc<BoundedQueue<QueuedMessage>>] {
        &self.shards
    }

    /// Queued items per shard.
    pub fn depths(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.len()).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity summed over shards.
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|shard| shard.capacity()).sum()
    }

    /// Push the current depth of `shard` into the metrics gauge.
    pub fn publish_depth(&self, shard: usize) {
        self.metrics.set_queue_depth(shard, self.shard(shard).len());
    }

    /// Wait until every shard has acknowledged all its items.
    pub async fn join(&self) {
        for shard in &self.shards {
            shard.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(3);
        for i in 0..3 {
            queue.put(i).await;
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get().await, 0);
        assert_eq!(queue.get().await, 1);
        assert_eq!(queue.get().await, 2);
    }

    #[test]
    fn test_try_put_hands_item_back_when_full() {
        let queue = BoundedQueue::new(1);
        assert!(queue.try_put("a").is_ok());
        assert_eq!(queue.try_put("b"), Err("b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_timeout_returns_item() {
        let queue = BoundedQueue::new(1);
        queue.put(1).await;
        let start = Instant::now();
        assert_eq!(queue.put_timeout(2, Duration::from_millis(100)).await, Err(2));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_waits_for_space() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.put(1).await;
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put_timeout(2, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.get().await, 1);
        assert_eq!(producer.await.unwrap(), Ok(()));
        assert_eq!(queue.get().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_waits_for_item() {
        let queue = Arc::new(BoundedQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.put("late").await;
        assert_eq!(consumer.await.unwrap(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_for_task_done() {
        let queue = Arc::new(BoundedQueue::new(4));
        queue.put(1).await;
        queue.put(2).await;

        let joiner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.join().await })
        };
        queue.get().await;
        queue.get().await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!joiner.is_finished());

        queue.task_done();
        queue.task_done();
        tokio::time::timeout(Duration::from_secs(1), joiner)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_pop_oldest() {
        let queue = BoundedQueue::new(2);
        queue.try_put("old").unwrap();
        queue.try_put("new").unwrap();
        assert_eq!(queue.try_pop_oldest(), Some("old"));
        queue.task_done();
        assert_eq!(queue.unfinished(), 1);
    }

    #[test]
    fn test_shard_index_is_stable_and_in_range() {
        for key in ["+15550001", "group-abc", ""] {
            let first = shard_index(key, 7);
            assert!(first < 7);
            assert_eq!(first, shard_index(key, 7));
        }
        assert_eq!(shard_index("anything", 1), 0);
    }

    #[test]
    fn test_shard_index_spreads_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            seen.insert(shard_index(&format!("conversation-{i}"), 4));
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_dispatch_queue_splits_capacity() {
        let metrics = Arc::new(RuntimeMetrics::new());
        let queue = DispatchQueue::new(10, 3, metrics.clone());
        assert_eq!(queue.shard_count(), 3);
        assert_eq!(queue.shard(0).capacity(), 3);
        assert_eq!(queue.shard_for(None), 0);

        queue.shard(2).put(QueuedMessage::new("x")).await;
        queue.publish_depth(2);
        assert_eq!(queue.depths(), vec![0, 0, 1]);
        assert_eq!(metrics.snapshot().queue_depths, vec![0, 0, 1]);
    }
}
