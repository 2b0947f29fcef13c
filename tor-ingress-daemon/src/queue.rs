//! Coalescing, rate-limited work queue keyed by [`ServiceKey`].
//!
//! A key is either *dirty* (waiting in the queue), *processing* (handed to a
//! worker by [`WorkQueue::get`]) or both: an add for a key that is being
//! processed is parked until [`WorkQueue::done`] and then requeued, so no two
//! workers ever hold the same key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use tor_ingress_core::ServiceKey;

/// Delay before the `requeues`-th retry: `base * 2^requeues`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, requeues: u32) -> Duration {
    let factor = 1u32.checked_shl(requeues).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ServiceKey>,
    dirty: HashSet<ServiceKey>,
    processing: HashSet<ServiceKey>,
    requeues: HashMap<ServiceKey, u32>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    available: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                available: Notify::new(),
                backoff_base,
                backoff_max,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `key` unless it is already waiting. Ignored after shutdown.
    pub fn add(&self, key: ServiceKey) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Wait for the next key. `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<ServiceKey> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

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

    /// Release `key` after processing. A key re-added meanwhile goes back
    /// into the queue.
    pub fn done(&self, key: &ServiceKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.available.notify_one();
        }
    }

    /// Clear the retry history of `key`.
    pub fn forget(&self, key: &ServiceKey) {
        self.state().requeues.remove(key);
    }

    pub fn num_requeues(&self, key: &ServiceKey) -> u32 {
        self.state().requeues.get(key).copied().unwrap_or(0)
    }

    /// Re-add `key` after its next backoff delay and count the requeue.
    /// Returns the delay used.
    pub fn add_rate_limited(&self, key: ServiceKey) -> Duration {
        let delay = {
            let mut state = self.state();
            let requeues = state.requeues.entry(key.clone()).or_insert(0);
            let delay = backoff_delay(self.inner.backoff_base, self.inner.backoff_max, *requeues);
            *requeues += 1;
            delay
        };
        self.add_after(key, delay);
        delay
    }

    pub fn add_after(&self, key: ServiceKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
