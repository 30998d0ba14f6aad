//! A rate-limited, de-duplicating work queue of Gateway keys.
//!
//! At most one worker holds a given key at a time; an `add` for an in-flight
//! key marks it dirty so it re-queues when the worker finishes. Failed keys
//! re-enter through [`WorkQueue::requeue`] with per-key exponential backoff
//! that [`WorkQueue::forget`] resets.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ai_gateway_controller_core::GatewayRef;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<GatewayRef>,
    queued: HashSet<GatewayRef>,
    active: HashSet<GatewayRef>,
    dirty: HashSet<GatewayRef>,
    failures: HashMap<GatewayRef, u32>,
    shutdown: bool,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueues a key. Keys already pending coalesce; keys being processed
    /// are re-queued once their worker calls [`WorkQueue::done`].
    pub fn add(&self, key: GatewayRef) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Takes the next key, waiting until one is available. Returns `None`
    /// once the queue is shut down and drained.
    pub async fn next(&self) -> Option<GatewayRef> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Releases a key taken by [`WorkQueue::next`]. A key that was re-added
    /// while in flight goes straight back on the queue.
    pub fn done(&self, key: &GatewayRef) {
        let mut state = self.state.lock();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears a key's failure history so normal rate limits reset.
    pub fn forget(&self, key: &GatewayRef) {
        self.state.lock().failures.remove(key);
    }

    /// Re-enqueues a failed key after its exponential-backoff delay.
    pub fn requeue(self: Arc<Self>, key: GatewayRef) {
        let delay = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let exponent = (*failures).min(27);
            *failures += 1;
            BASE_DELAY
                .checked_mul(1u32 << exponent)
                .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(key);
        });
    }

    /// Stops admitting new work and wakes all workers; `next` drains what is
    /// already queued, then returns `None`.
    pub fn shut_down(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> GatewayRef {
        GatewayRef::new("default", name)
    }

    #[tokio::test]
    async fn coalesces_pending_duplicates() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));

        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
        queue.shut_down();
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn in_flight_keys_requeue_on_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let taken = queue.next().await.unwrap();

        // While a worker holds the key, a new event for it coalesces into a
        // single dirty mark.
        queue.add(key("a"));
        queue.add(key("a"));

        queue.done(&taken);
        assert_eq!(queue.next().await, Some(key("a")));
        queue.done(&key("a"));
        queue.shut_down();
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_applies_exponential_backoff() {
        let queue = WorkQueue::new();

        queue.clone().requeue(key("a"));
        // The first retry lands after the base delay.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.next().await, Some(key("a")));
        queue.done(&key("a"));

        queue.clone().requeue(key("a"));
        queue.clone().requeue(key("b"));
        // The second failure of `a` backs off further than the first failure
        // of `b`.
        tokio::time::sleep(Duration::from_millis(7)).await;
        assert_eq!(queue.next().await, Some(key("b")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_the_backoff() {
        let queue = WorkQueue::new();

        queue.clone().requeue(key("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.next().await, Some(key("a")));
        queue.done(&key("a"));
        queue.forget(&key("a"));

        // After a forget the next failure starts from the base delay again.
        queue.clone().requeue(key("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_work() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.shut_down();
        // Adds after shutdown are dropped.
        queue.add(key("b"));

        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, None);
    }
}
