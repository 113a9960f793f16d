//! Named exclusive locks for handlers that touch shared resources.
//!
//! Locks are created lazily, one per resource id, under a manager-level mutex
//! so two callers never race to create the same lock. Acquisition returns an
//! owned guard, so the lock is released on every exit path, including an
//! early `?` return or a panic unwinding through the holder. The last guard
//! for a resource with nobody waiting removes its entry again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<StdMutex<HashMap<String, Arc<ResourceLock>>>>;
use tokio::task::Id as TaskId;

#[derive(Debug, Default)]
struct ResourceLock {
    mutex: Arc<Mutex<()>>,
    holder: StdMutex<Option<TaskId>>,
}

/// Exclusive hold on one resource. Released on drop.
#[derive(Debug)]
pub struct ResourceGuard {
    resource: String,
    lock: Arc<ResourceLock>,
    locks: LockMap,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        *self.lock.holder.lock().expect("lock holder lock poisoned") = None;

        // Clones are only taken under the map lock: one for the map, one for
        // this guard means no task is waiting on the resource.
        let mut locks = self.locks.lock().expect("lock map poisoned");
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.resource);
        }
    }
}

/// Registry of per-resource locks.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: LockMap,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `resource`, waiting if another task holds it.
    ///
    /// Locks are not reentrant: if the calling task already holds `resource`
    /// this logs a warning and then waits, which deadlocks that task.
    pub async fn lock(&self, resource: &str) -> ResourceGuard {
        let lock = {
            let mut locks = self.locks.lock().expect("lock map poisoned");
            locks.entry(resource.to_string()).or_default().clone()
        };

        let current = tokio::task::try_id();
        if let Some(current) = current {
            let holder = *lock.holder.lock().expect("lock holder lock poisoned");
            if holder == Some(current) {
                tracing::warn!(resource, task = %current, "task is re-acquiring a lock it already holds");
            }
        }

        let guard = lock.mutex.clone().lock_owned().await;
        *lock.holder.lock().expect("lock holder lock poisoned") = current;

        ResourceGuard {
            resource: resource.to_string(),
            lock,
            locks: self.locks.clone(),
            _guard: guard,
        }
    }

    /// Run `fut` while holding the lock for `resource`.
    pub async fn with_lock<F, T>(&self, resource: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock(resource).await;
        fut.await
    }

    /// Task currently holding `resource`, if any.
    pub async fn holder(&self, resource: &str) -> Option<TaskId> {
        let locks = self.locks.lock().expect("lock map poisoned");
        let lock = locks.get(resource)?;
        *lock.holder.lock().expect("lock holder lock poisoned")
    }

    /// Number of resources currently held or waited on.
    pub async fn len(&self) -> usize {
        self.locks.lock().expect("lock map poisoned").len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().expect("lock map poisoned").is_empty()
    }
}
