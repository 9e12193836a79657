//! Rate-limited, deduplicating work queues.
//!
//! Each watched resource type feeds one of these; workers block on `get`,
//! process the key to completion and call `done`. Invariants the rest of
//! the controller relies on:
//!
//! - adds of a key already pending collapse into one delivery
//!   (level-triggered coalescing);
//! - a key being processed is never delivered to a second worker; an add
//!   observed mid-processing is delivered again after `done`;
//! - `add_rate_limited` delays redelivery by a per-key exponential backoff,
//!   cleared by `forget` on a successful pass.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::backoff::ExponentialBackoff;

/// Deduplicating FIFO with per-key rate limiting.
#[derive(Debug)]
pub struct WorkQueue {
    name: &'static str,
    inner: Mutex<Inner>,
    limiter: Mutex<ExponentialBackoff>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<String>,
    // Keys waiting to be processed (pending dedup marker).
    dirty: HashSet<String>,
    // Keys currently held by a worker.
    processing: HashSet<String>,
    shutting_down: bool,
}

impl WorkQueue {
    /// A queue with default backoff tuning.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self::with_backoff(name, ExponentialBackoff::default())
    }

    /// A queue with custom backoff tuning (tests use short delays).
    #[must_use]
    pub fn with_backoff(name: &'static str, limiter: ExponentialBackoff) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner::default()),
            limiter: Mutex::new(limiter),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key. Duplicates of a pending key collapse; a key being
    /// processed is redelivered once `done` runs.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if !inner.processing.contains(&key) {
            inner.ready.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after its per-key backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = self.next_delay(&key);
        debug!("{}: redelivering {key:?} in {delay:?}", self.name);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Block until a key is available; `None` once the queue shuts down
    /// and drains.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(key) = inner.ready.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key's processing finished, releasing it for redelivery.
    pub fn done(&self, key: &str) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.ready.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Clear backoff state for a key after a successful pass.
    pub fn forget(&self, key: &str) {
        self.limiter().forget(key);
    }

    /// Consecutive failures recorded for a key.
    #[must_use]
    pub fn failures(&self, key: &str) -> u32 {
        self.limiter().failures(key)
    }

    /// Stop accepting work and wake blocked workers.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_one();
    }

    /// Pending keys (ready or awaiting redelivery after `done`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().dirty.len()
    }

    /// Whether no key is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_delay(&self, key: &str) -> std::time::Duration {
        self.limiter().next_delay(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn limiter(&self) -> std::sync::MutexGuard<'_, ExponentialBackoff> {
        match self.limiter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);

    async fn try_get(queue: &WorkQueue) -> Option<String> {
        timeout(TICK, queue.get()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new("test");
        queue.add("v1");
        queue.add("v1");
        queue.add("v1");

        assert_eq!(queue.get().await.as_deref(), Some("v1"));
        queue.done("v1");
        assert_eq!(try_get(&queue).await, None);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("b");
        queue.add("c");

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert_eq!(queue.get().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_no_redelivery_while_processing() {
        let queue = WorkQueue::new("test");
        queue.add("v1");
        assert_eq!(queue.get().await.as_deref(), Some("v1"));

        // Arrives while a worker holds the key: must not be delivered yet.
        queue.add("v1");
        assert_eq!(try_get(&queue).await, None);

        // Released: the pending add surfaces exactly once.
        queue.done("v1");
        assert_eq!(queue.get().await.as_deref(), Some("v1"));
        queue.done("v1");
        assert_eq!(try_get(&queue).await, None);
    }

    #[tokio::test]
    async fn test_rate_limited_redelivery() {
        let queue = Arc::new(WorkQueue::with_backoff(
            "test",
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(10)),
        ));
        queue.add_rate_limited("v1");

        let key = timeout(Duration::from_secs(1), queue.get()).await;
        assert_eq!(key.unwrap().as_deref(), Some("v1"));
        assert_eq!(queue.failures("v1"), 1);

        queue.forget("v1");
        assert_eq!(queue.failures("v1"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_worker() {
        let queue = Arc::new(WorkQueue::new("test"));
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        queue.shut_down();
        assert_eq!(worker.await.unwrap(), None);

        // Adds after shutdown are dropped.
        queue.add("v1");
        assert!(queue.is_empty());
    }
}
