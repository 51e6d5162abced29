//! Work queue for incremental sync
//!
//! A FIFO of keys with the usual controller guarantees:
//! - a key is handed to at most one worker at a time
//! - adding a key that is already queued is a no-op
//! - adding a key that is being processed re-queues it once `done` is called
//!
//! Failed keys are re-added after a per-key exponential backoff.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
}

struct RetryState {
    backoff: ExponentialBackoff,
    requeues: u32,
}

/// Deduplicating work queue with per-key serialization
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    shutdown: CancellationToken,
    retries: DashMap<T, RetryState>,
    initial_delay: Duration,
    max_delay: Duration,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
            }),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            retries: DashMap::new(),
            initial_delay,
            max_delay,
        })
    }

    /// Queue a key for processing
    pub fn add(&self, item: T) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut state = self.state.lock();
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Mark a key as processed. Re-queues it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !self.shutdown.is_cancelled() {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-add a key after its backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut retry = self.retries.entry(item.clone()).or_insert_with(|| RetryState {
                backoff: ExponentialBackoffBuilder::new()
                    .with_initial_interval(self.initial_delay)
                    .with_max_interval(self.max_delay)
                    .with_max_elapsed_time(None)
                    .build(),
                requeues: 0,
            });
            retry.requeues += 1;
            retry.backoff.next_backoff().unwrap_or(self.max_delay)
        };
        debug!(?item, ?delay, "Requeueing after backoff");
        self.add_after(item, delay);
    }

    /// Re-add a key once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Clear the retry history of a key
    pub fn forget(&self, item: &T) {
        self.retries.remove(item);
    }

    /// Number of times a key has been re-added with backoff
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.retries.get(item).map_or(0, |retry| retry.requeues)
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys; pending `get` calls return `None`
    pub fn shut_down(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new(Duration::from_millis(5), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_coalesced() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_key_added_while_processing_waits_for_done() {
        let q = queue();
        q.add("a".to_string());
        let item = q.get().await.unwrap();

        q.add("a".to_string());
        assert!(q.is_empty(), "key must not be handed out twice concurrently");

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_get_wakes_on_add() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("late".to_string());

        assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();

        assert_eq!(waiter.await.unwrap(), None);
        q.add("ignored".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_requeue() {
        let q = queue();
        q.add_rate_limited("retry".to_string());
        q.add_rate_limited("retry".to_string());
        assert_eq!(q.num_requeues(&"retry".to_string()), 2);

        let item = tokio::time::timeout(Duration::from_secs(2), q.get())
            .await
            .unwrap();
        assert_eq!(item.as_deref(), Some("retry"));

        q.forget(&"retry".to_string());
        assert_eq!(q.num_requeues(&"retry".to_string()), 0);
    }
}
