//! De-duplicating, rate-limited work queue
//!
//! Keys move through three sets:
//! - `queue`: waiting to be handed to a worker
//! - `processing`: currently held by a worker
//! - `dirty`: needs (another) sync
//!
//! A key re-added while a worker holds it is only marked dirty and goes back
//! on the queue when the worker calls [`WorkQueue::done`], so no key is ever
//! held by two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use meshops_common::retry::RetryConfig;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Work queue of resource keys
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: RetryConfig,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create a queue using the default per-key backoff (5ms doubling to 1000s)
    pub fn new() -> Self {
        Self::with_backoff(RetryConfig::queue_backoff())
    }

    /// Create a queue with a custom per-key backoff
    pub fn with_backoff(backoff: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Enqueue `key`. Adding a key that is already pending is a no-op.
    pub fn add(&self, key: &str) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                trace!(key = %key, "key in flight, deferring");
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    /// Enqueue `key` after `delay`
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueue `key` after its per-key exponential backoff
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.state.lock();
            let n = state.failures.entry(key.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let delay = self.backoff.delay_for(failures);
        trace!(key = %key, failures, delay_ms = delay.as_millis(), "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff for `key`
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Number of rate-limited requeues recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add or
            // shutdown between the check and the await is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished; re-queues it if it was added while in flight
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
