//! Per-key coalescing work queue.
//!
//! Triggers for the same key collapse into one pending entry (FIFO by first arrival). A key
//! handed to a worker is "in flight" until [`TriggerQueue::done`]; triggers arriving meanwhile
//! are parked and replayed once the worker finishes, so one key is never processed twice at once.
//!
//! Delayed triggers wait in the queue with one deadline per key; a later deadline for a key that
//! already has one is dropped, so repeated requeues never stack up timers.

use std::collections::VecDeque;
use std::time::Duration;

use keel_core::{Key, Trigger, TriggerReason};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    pending: FxHashMap<Key, TriggerReason>,
    order: VecDeque<Key>,
    in_flight: FxHashSet<Key>,
    parked: FxHashMap<Key, TriggerReason>,
    delayed: FxHashMap<Key, (Instant, TriggerReason)>,
    coalesced: u64,
    closed: bool,
}

impl QueueState {
    fn merged(&mut self) {
        self.coalesced += 1;
        metrics::counter!("trigger_queue_coalesced_total", 1u64);
    }

    fn enqueue(&mut self, key: Key, reason: TriggerReason) -> bool {
        if self.in_flight.contains(&key) {
            if self.parked.insert(key, reason).is_some() {
                self.merged();
            }
            return false;
        }
        if let Some(slot) = self.pending.get_mut(&key) {
            *slot = reason;
            self.merged();
            return false;
        }
        self.order.push_back(key.clone());
        self.pending.insert(key, reason);
        true
    }

    /// Move every delayed trigger whose deadline has passed into the ready order.
    fn promote_due(&mut self, now: Instant) {
        let due: Vec<Key> = self.delayed.iter().filter(|(_, (at, _))| *at <= now).map(|(k, _)| k.clone()).collect();
        for key in due {
            if let Some((_, reason)) = self.delayed.remove(&key) {
                self.enqueue(key, reason);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().map(|(at, _)| *at).min()
    }
}

#[derive(Default)]
pub struct TriggerQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a trigger. Returns false when it merged into an existing entry or the queue is closed.
    pub async fn push(&self, trigger: Trigger) -> bool {
        let mut st = self.state.lock().await;
        if st.closed {
            return false;
        }
        let fresh = st.enqueue(trigger.key, trigger.reason);
        drop(st);
        if fresh {
            self.ready.notify_one();
        }
        fresh
    }

    /// Post a trigger that becomes ready after `delay`. A key keeps only its earliest deadline.
    /// Returns false when an earlier deadline was already set or the queue is closed.
    pub async fn push_after(&self, trigger: Trigger, delay: Duration) -> bool {
        let at = Instant::now() + delay;
        let mut st = self.state.lock().await;
        if st.closed {
            return false;
        }
        let covered = st.delayed.get(&trigger.key).map_or(false, |(existing, _)| *existing <= at);
        if covered {
            st.merged();
            return false;
        }
        st.delayed.insert(trigger.key, (at, trigger.reason));
        drop(st);
        // A sleeping worker may be waiting on a later deadline.
        self.ready.notify_one();
        true
    }

    /// Wait for the next ready key. `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Trigger> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let mut st = self.state.lock().await;
                st.promote_due(Instant::now());
                if let Some(key) = st.order.pop_front() {
                    let reason = st.pending.remove(&key).unwrap_or(TriggerReason::Resync);
                    st.in_flight.insert(key.clone());
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        self.ready.notify_one();
                    }
                    return Some(Trigger { key, reason });
                }
                if st.closed {
                    return None;
                }
                st.next_deadline()
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key taken by `pop`, replaying any trigger parked while it was in flight.
    pub async fn done(&self, key: &Key) {
        let mut st = self.state.lock().await;
        st.in_flight.remove(key);
        let Some(reason) = st.parked.remove(key) else { return };
        if st.closed {
            return;
        }
        debug!(key = %key, ?reason, "replaying trigger parked during pass");
        if st.enqueue(key.clone(), reason) {
            drop(st);
            self.ready.notify_one();
        }
    }

    /// Stop accepting triggers; workers drain what is pending and then see `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.ready.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of keys waiting on a deadline.
    pub async fn delayed(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    pub async fn coalesced(&self) -> u64 {
        self.state.lock().await.coalesced
    }

    pub async fn is_in_flight(&self, key: &Key) -> bool {
        self.state.lock().await.in_flight.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn trig(name: &str, reason: TriggerReason) -> Trigger {
        Trigger::new(Key::new("ns", name), reason)
    }

    #[tokio::test]
    async fn coalesces_by_key_keeping_first_arrival_order() {
        let q = TriggerQueue::new();
        assert!(q.push(trig("a", TriggerReason::RecordChanged)).await);
        assert!(q.push(trig("b", TriggerReason::RecordChanged)).await);
        assert!(!q.push(trig("a", TriggerReason::Resync)).await);
        assert_eq!(q.len().await, 2);
        assert_eq!(q.coalesced().await, 1);
        let first = q.pop().await.unwrap();
        assert_eq!(first.key.name, "a");
        assert_eq!(first.reason, TriggerReason::Resync);
        assert_eq!(q.pop().await.unwrap().key.name, "b");
    }

    #[tokio::test]
    async fn in_flight_key_is_parked_then_replayed() {
        let q = TriggerQueue::new();
        q.push(trig("a", TriggerReason::RecordChanged)).await;
        let t = q.pop().await.unwrap();
        assert!(q.is_in_flight(&t.key).await);
        assert!(!q.push(trig("a", TriggerReason::DependentChanged(ResourceKind::Workload))).await);
        assert!(q.is_empty().await, "parked trigger must not be handed to another worker");
        q.done(&t.key).await;
        let again = q.pop().await.unwrap();
        assert_eq!(again.reason, TriggerReason::DependentChanged(ResourceKind::Workload));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_triggers_keep_the_earliest_deadline() {
        let q = TriggerQueue::new();
        assert!(q.push_after(trig("a", TriggerReason::Requeue), Duration::from_secs(30)).await);
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(2)).await;
            assert!(!q.push_after(trig("a", TriggerReason::Requeue), Duration::from_secs(30)).await);
        }
        assert!(q.push_after(trig("a", TriggerReason::Backoff), Duration::from_secs(1)).await);
        assert_eq!(q.delayed().await, 1);
        assert!(q.is_empty().await);

        let start = Instant::now();
        let got = q.pop().await.unwrap();
        assert_eq!(got.reason, TriggerReason::Backoff);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(q.delayed().await, 0);
        q.done(&got.key).await;

        q.push_after(trig("b", TriggerReason::Requeue), Duration::from_secs(5)).await;
        assert!(
            tokio::time::timeout(Duration::from_secs(4), q.pop()).await.is_err(),
            "a delayed key is not ready before its deadline"
        );
        assert_eq!(q.pop().await.unwrap().key.name, "b");
    }

    #[tokio::test]
    async fn pop_wakes_on_push_and_ends_on_close() {
        let q = Arc::new(TriggerQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(trig("a", TriggerReason::Resync)).await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.unwrap().key.name, "a");

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(got.is_none());
        assert!(!q.push(trig("b", TriggerReason::Resync)).await);
    }
}
