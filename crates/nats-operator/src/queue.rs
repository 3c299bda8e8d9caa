//! Deduplicating work queue
//!
//! Holds the keys awaiting reconciliation with three guarantees:
//!
//! - a key is queued at most once; adding a queued key is a no-op
//! - a key handed to a worker is not handed out again until the worker calls
//!   [`WorkQueue::done`]; adds that arrive meanwhile are deferred until then
//! - failed keys come back after an exponential, per-key backoff
//! - a key has at most one delayed add pending; scheduling it again keeps
//!   the earlier deadline
//!
//! Together these make reconciles single-flight per key while different
//! keys proceed in parallel.

use crate::config::BackoffPolicy;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct State<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed (queued, or re-added while processing)
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    /// Deadline of the one pending delayed add per key
    scheduled: HashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

/// Work queue of keys; cheap to clone, clones share the queue
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    scheduled: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        // The state stays consistent across a panic in another holder
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `key`. Returns false when it was already pending or the queue is shut down.
    pub fn add(&self, key: K) -> bool {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return false;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
        true
    }

    /// Queue `key` once `delay` has elapsed.
    ///
    /// When `key` is already scheduled the earlier deadline wins, so repeated
    /// scheduling never multiplies the adds for one key.
    pub fn add_after(&self, key: K, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            match state.scheduled.get(&key) {
                Some(pending) if *pending <= deadline => return,
                _ => {
                    state.scheduled.insert(key.clone(), deadline);
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut state = queue.state();
                // Superseded by an earlier deadline that already fired or replaced us
                let current = state.scheduled.get(&key) == Some(&deadline);
                if current {
                    state.scheduled.remove(&key);
                }
                current
            };
            if fire {
                queue.add(key);
            }
        });
    }

    /// Number of keys with a delayed add pending
    pub fn scheduled(&self) -> usize {
        self.state().scheduled.len()
    }

    /// Record a failure for `key` and queue it after its backoff delay
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut state = self.state();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.inner.backoff.delay(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
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

    /// Mark `key` as processed, releasing it for the next worker
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently handed out to workers
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }
}
