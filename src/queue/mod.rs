//! Deduplicating, rate-limited work queue
//!
//! Semantics follow the standard controller work queue:
//!
//! - a key is held at most once in the queue (`dirty` set)
//! - a key handed out by [`WorkQueue::get`] is *processing* until
//!   [`WorkQueue::done`]; adding it again meanwhile marks it dirty without
//!   queueing it, and `done` queues it once more. Any number of adds during
//!   one run collapse into a single follow-up run.
//! - failed keys come back through [`WorkQueue::add_rate_limited`] after a
//!   per-key backoff that [`WorkQueue::forget`] resets
//!
//! All bookkeeping lives behind one mutex; waiting happens on `Notify`
//! outside of it.

mod rate_limiter;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter, DEFAULT_BASE_DELAY, DEFAULT_BUCKET_BURST, DEFAULT_BUCKET_QPS,
    DEFAULT_MAX_DELAY,
};

struct QueueState<K> {
    /// Keys ready to be handed out, in insertion order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<K>,
    /// Keys currently handed out to a worker
    processing: HashSet<K>,
    /// Earliest pending deadline per delayed key
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    /// Signalled when a key becomes available or on shutdown
    available: Notify,
    /// Signalled when the processing set becomes empty
    idle: Notify,
    /// Cancelled on shutdown; releases pending delayed adds
    stopped: CancellationToken,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

/// Handle to a shared work queue; clones refer to the same queue
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue using the default controller rate limiter
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    /// Create a queue with a custom rate limiter
    pub fn with_rate_limiter(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                idle: Notify::new(),
                stopped: CancellationToken::new(),
                rate_limiter,
            }),
        }
    }

    /// Queue `key` unless it is already pending
    ///
    /// If `key` is being processed it is marked dirty and queued again when
    /// [`WorkQueue::done`] is called for it. Ignored after shutdown.
    pub fn add(&self, key: K) {
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(key.clone()) {
                trace!(queue = %self.shared.name, ?key, "key already pending");
                return;
            }
            metrics::QUEUE_ADDS.add(1, &[]);
            if state.processing.contains(&key) {
                trace!(queue = %self.shared.name, ?key, "key in flight, deferring");
                return;
            }
            state.queue.push_back(key);
        }
        self.shared.available.notify_one();
    }

    /// Queue `key` once `delay` has elapsed
    ///
    /// Several delayed adds of the same key collapse onto the earliest
    /// deadline. Timers still pending at shutdown exit without adding.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.waiting.get(&key) {
                if *existing <= deadline {
                    return;
                }
            }
            state.waiting.insert(key.clone(), deadline);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = queue.shared.stopped.cancelled() => return,
            }
            {
                let mut state = queue.shared.state.lock();
                // superseded by an earlier deadline, whose own timer adds the key
                if state.waiting.get(&key) != Some(&deadline) {
                    return;
                }
                state.waiting.remove(&key);
            }
            queue.add(key);
        });
    }

    /// Queue `key` after its rate-limited backoff delay
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.shared.rate_limiter.when(&key);
        metrics::QUEUE_RETRIES.add(1, &[]);
        debug!(
            queue = %self.shared.name,
            ?key,
            delay_ms = delay.as_millis() as u64,
            "requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Reset the backoff history of `key`
    pub fn forget(&self, key: &K) {
        self.shared.rate_limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shutting down; the caller's worker
    /// loop should then exit.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark processing of `key` complete
    ///
    /// A key re-added while in flight becomes available again immediately.
    pub fn done(&self, key: &K) {
        let (requeued, idle) = {
            let mut state = self.shared.state.lock();
            state.processing.remove(key);
            let requeued = state.dirty.contains(key) && !state.shutting_down;
            if requeued {
                state.queue.push_back(key.clone());
            }
            (requeued, state.processing.is_empty())
        };

        if requeued {
            self.shared.available.notify_one();
        }
        if idle {
            self.shared.idle.notify_waiters();
        }
    }

    /// Stop handing out keys
    ///
    /// Pending and future [`WorkQueue::get`] calls return `None`; keys
    /// already handed out stay in flight until their `done`.
    pub fn shut_down(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = %self.shared.name, "work queue shutting down");
        self.shared.stopped.cancel();
        self.shared.available.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Resolve once no key is being processed
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.state.lock().processing.is_empty() {
                return;
            }

            notified.await;
        }
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// True when no key is ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
