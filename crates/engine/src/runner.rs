//! Trigger layer: workers pull keys from the per-key queue, run one pass each and turn the
//! returned directive into the next trigger: now, after a delay, or after an error backoff.
//! Delays live in the queue, so a key has at most one pending deadline however many passes ran.

use std::sync::Arc;

use keel_core::{Accessor, Key, Trigger, TriggerReason};
use keel_store::TriggerQueue;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::PassContext;
use crate::reconciler::{Directive, Reconciler};
use crate::RunnerConfig;

pub struct Runner<A> {
    reconciler: Arc<Reconciler<A>>,
    queue: Arc<TriggerQueue>,
    cfg: RunnerConfig,
    failures: Arc<Mutex<FxHashMap<Key, u32>>>,
}

impl<A: Accessor + 'static> Runner<A> {
    pub fn new(reconciler: Reconciler<A>, cfg: RunnerConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue: Arc::new(TriggerQueue::new()),
            cfg,
            failures: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    pub fn queue(&self) -> Arc<TriggerQueue> {
        Arc::clone(&self.queue)
    }

    /// Consecutive failures recorded for `key` (0 after any successful pass).
    pub async fn failures(&self, key: &Key) -> u32 {
        self.failures.lock().await.get(key).copied().unwrap_or(0)
    }

    /// Forward triggers from watchers into the queue and run workers until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut triggers: mpsc::Receiver<Trigger>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        for id in 0..self.cfg.workers.max(1) {
            let me = Arc::clone(&self);
            let token = shutdown.clone();
            tasks.spawn(async move { me.worker(id, token).await });
        }
        info!(workers = self.cfg.workers.max(1), "runner started");

        let mut feeding = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = triggers.recv(), if feeding => match next {
                    Some(t) => { self.queue.push(t).await; }
                    None => {
                        debug!("trigger channel closed; workers keep draining requeues");
                        feeding = false;
                    }
                },
            }
        }
        self.queue.close().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!("runner stopped");
    }

    async fn worker(self: Arc<Self>, id: usize, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                t = self.queue.pop() => t,
            };
            let Some(trigger) = next else { break };
            debug!(worker = id, key = %trigger.key, reason = ?trigger.reason, "pass picked up");
            let ctx = PassContext::new(shutdown.child_token(), self.reconciler.config().call_timeout);
            let outcome = self.reconciler.reconcile(&trigger.key, &ctx).await;
            self.queue.done(&trigger.key).await;
            self.schedule(trigger.key, outcome.map_err(|e| e.is_retryable())).await;
        }
        debug!(worker = id, "worker stopped");
    }

    async fn schedule(&self, key: Key, outcome: Result<Directive, bool>) {
        match outcome {
            Ok(directive) => {
                self.failures.lock().await.remove(&key);
                match directive {
                    Directive::Done => {}
                    Directive::Requeue => {
                        self.queue.push(Trigger::new(key, TriggerReason::Requeue)).await;
                    }
                    Directive::RequeueAfter(delay) => {
                        self.queue.push_after(Trigger::new(key, TriggerReason::Requeue), delay).await;
                    }
                }
            }
            Err(retryable) => {
                let n = {
                    let mut f = self.failures.lock().await;
                    let n = f.entry(key.clone()).or_insert(0);
                    *n = n.saturating_add(1);
                    *n
                };
                let delay = if retryable { self.cfg.backoff(n) } else { self.cfg.backoff_max };
                warn!(key = %key, failures = n, delay_ms = delay.as_millis() as u64, retryable, "pass failed; backing off");
                self.queue.push_after(Trigger::new(key, TriggerReason::Backoff), delay).await;
            }
        }
    }
}
