//! # Work Queue
//!
//! Rate-limited, deduplicating work queue of [`WorkKey`]s, modeled on the
//! classic controller work queue semantics:
//!
//! - **Dedup**: adding a key that is already queued but not yet checked out
//!   is a no-op.
//! - **At most one active per key**: [`WorkQueue::get`] never hands out a
//!   key that is currently being processed. A second `add` for an in-flight
//!   key marks it dirty; [`WorkQueue::done`] re-queues it exactly once.
//! - **Rate-limited retry**: [`WorkQueue::add_rate_limited`] re-enqueues a
//!   failing key after a per-key exponential delay;
//!   [`WorkQueue::forget`] resets the key's delay after success.
//! - **Cooperative shutdown**: [`WorkQueue::shutdown`] stops accepting new
//!   keys, lets `get` drain what is already queued, then resolves `None` so
//!   workers exit.
//!
//! All bookkeeping lives behind a single mutex that is never held across an
//! await point; dequeue blocking uses [`Notify`] with a waiter registered
//! before the state re-check, so wakeups cannot be lost.

use crate::controller::backoff::RetryBackoff;
use crate::key::WorkKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    /// Keys waiting to be handed to a worker, in arrival order.
    queue: VecDeque<WorkKey>,
    /// Keys that need (another) reconcile: queued keys plus in-flight keys
    /// that were re-added while processing.
    dirty: HashSet<WorkKey>,
    /// Keys currently checked out by a worker.
    processing: HashSet<WorkKey>,
    /// Per-key retry backoff state; absent means "at base delay".
    retries: HashMap<WorkKey, RetryBackoff>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited queue of reconciliation keys.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(
            crate::controller::backoff::DEFAULT_BASE_DELAY,
            crate::controller::backoff::DEFAULT_MAX_DELAY,
        )
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned lock only means another worker panicked mid-update of
        // plain collections; the state itself is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a key for reconciliation.
    ///
    /// No-op if the key is already pending, or after shutdown. If the key is
    /// currently being processed it is only marked dirty and will be
    /// re-delivered once the in-flight reconcile calls [`WorkQueue::done`].
    pub fn add(&self, key: WorkKey) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Dequeue the next key, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is shutting down and drained. The
    /// returned key is checked out: it will not be handed to another worker
    /// until [`WorkQueue::done`] is called for it.
    pub async fn get(&self) -> Option<WorkKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before re-checking state so an `add`
            // racing with the check is guaranteed to wake us.
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key checked out by [`WorkQueue::get`].
    ///
    /// If the key was re-added while processing, it is re-queued now so the
    /// coalesced event triggers exactly one more reconcile.
    pub fn done(&self, key: &WorkKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-enqueue a failing key after its per-key backoff delay.
    pub fn add_rate_limited(self: Arc<Self>, key: WorkKey) {
        let delay = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let base = self.base_delay;
            let max = self.max_delay;
            state
                .retries
                .entry(key.clone())
                .or_insert_with(|| RetryBackoff::new(base, max))
                .next_delay()
        };
        debug!(%key, ?delay, "requeueing with backoff");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(key);
        });
    }

    /// Reset a key's retry backoff to the base delay after a success.
    pub fn forget(&self, key: &WorkKey) {
        self.lock().retries.remove(key);
    }

    /// Number of retries recorded for a key since its last success.
    #[must_use]
    pub fn retries(&self, key: &WorkKey) -> u32 {
        self.lock().retries.get(key).map_or(0, RetryBackoff::retries)
    }

    /// Number of keys waiting to be dequeued (excludes in-flight keys).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new keys and wake all waiting workers.
    ///
    /// Already-queued keys are still drained through [`WorkQueue::get`];
    /// once the queue is empty, `get` resolves `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}
