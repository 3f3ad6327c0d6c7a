//! De-duplicating work queue for reconciliation keys
//!
//! The queue decouples event arrival from event processing:
//!
//! - An item is held at most once while it waits. Adding it again before it
//!   is picked up is a no-op.
//! - While an item is being processed (between [`WorkQueue::get`] and
//!   [`WorkQueue::done`]) it is never handed to another worker. Adds that
//!   arrive in that window are collapsed into a single re-queue that happens
//!   on `done`.
//! - [`WorkQueue::shutdown`] stops accepting new items and wakes every
//!   blocked getter. Items already queued are still handed out so workers can
//!   drain; once the queue is empty `get` returns `None`.
//!
//! [`RateLimitingQueue`] layers failure backoff on top: a key whose
//! reconciliation failed is re-added through [`RateLimitingQueue::add_rate_limited`]
//! and becomes eligible again after the delay chosen by its [`RateLimiter`].

pub mod rate_limiter;

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub use rate_limiter::{
    default_controller_rate_limiter, BackoffConfig, ItemExponentialBackoff, MaxOf, RateLimiter,
    TokenBucket,
};

/// Deduplicating FIFO queue shared by all worker lanes
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    /// Cancels pending delayed adds on shutdown
    delayed: CancellationToken,
}

struct State<T> {
    /// Items waiting to be processed, in arrival order
    queue: VecDeque<T>,
    /// Items that need processing (queued, or re-added while in flight)
    dirty: HashSet<T>,
    /// Items currently held by a worker
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                delayed: CancellationToken::new(),
            }),
        }
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // picked up again by `done`
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    ///
    /// Must be called from within a tokio runtime when `delay` is non-zero.
    /// Pending delayed adds are discarded when the queue shuts down.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        let cancelled = self.inner.delayed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue has been shut down and drained. The
    /// caller owns the returned item until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before inspecting state so a concurrent add/shutdown is not missed
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `item` after processing
    ///
    /// If the item was re-added while it was in flight it goes back on the
    /// queue now.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True if no item is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently held by workers
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }

    /// Stop accepting items and wake all blocked getters
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        trace!("work queue shutting down");
        self.inner.delayed.cancel();
        self.inner.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

/// Work queue with per-item failure backoff
pub struct RateLimitingQueue<T> {
    queue: WorkQueue<T>,
    limiter: Arc<dyn RateLimiter<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue using `limiter` for re-adds
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            queue: WorkQueue::new(),
            limiter: Arc::new(limiter),
        }
    }

    /// Mark `item` as needing processing, immediately
    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
    }

    /// Re-add `item` after the backoff its failure history calls for
    ///
    /// Returns the chosen delay.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.limiter.when(&item);
        self.queue.add_after(item, delay);
        delay
    }

    /// Clear the failure history of `item`
    ///
    /// This only resets backoff; it does not remove a pending entry.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    /// Failures recorded for `item` since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next item; `None` after shutdown and drain
    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    /// Release `item` after processing
    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no item is waiting
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of items currently held by workers
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// Stop accepting items and wake all blocked getters
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// True once shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
