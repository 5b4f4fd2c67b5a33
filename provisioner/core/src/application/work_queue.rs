// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deduplicating work queue shared by a controller's workers
//!
//! A key is never handed to two workers at once. Adding a key that is being
//! processed marks it dirty, and it is queued again when `done` is called.
//! Keys already waiting are not duplicated.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeue with exponential backoff based on consecutive failures.
    /// Returns the delay applied.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            backoff_delay(self.base_delay, self.max_delay, *failures)
        };
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for `key`
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
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
            }

            notified.await;
        }
    }

    /// Mark `key` processed; it is queued again if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `base * 2^(failures - 1)`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(2_u32.pow(exponent))
        .map(|d| d.min(max))
        .unwrap_or(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(
            Duration::from_millis(10),
            Duration::from_millis(80),
        ))
    }

    #[tokio::test]
    async fn test_add_deduplicates_waiting_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_deferred() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        q.add("a".to_string());
        assert!(q.is_empty(), "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_get_wakes_on_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add("late".to_string());
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_backoff_grows_and_resets() {
        let q = queue();
        let key = "k".to_string();
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_millis(20));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_millis(40));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_millis(80));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_millis(80));
        assert_eq!(q.num_requeues(&key), 5);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[test]
    fn test_backoff_saturates() {
        let d = backoff_delay(Duration::from_secs(1), Duration::from_secs(60), 200);
        assert_eq!(d, Duration::from_secs(60));
    }
}
