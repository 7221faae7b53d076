//! The reconcile state machine.
//!
//! One call to [`Reconciler::reconcile`] is one complete pass for one key: fetch the record,
//! branch on deletion intent, make sure the finalizer is in place, converge the workload, then
//! the endpoint, then write status. Any pass that changes something the next step depends on
//! returns early with [`Directive::Requeue`] so the following pass starts from fresh reads.
//! There is no retry loop here; retries are directives for the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_core::conditions::{record_invalid, record_rollout};
use keel_core::{Accessor, AppService, Key, ManagedResource, ReconcileError, ResourceKind, StoreError};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::context::{Clock, PassContext, SystemClock};
use crate::{synth, EngineConfig};

/// What the caller should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Done,
    /// Run another pass right away.
    Requeue,
    /// Run another pass after the delay; advisory, nothing sleeps inside the engine.
    RequeueAfter(Duration),
}

impl Directive {
    fn label(self) -> &'static str {
        match self {
            Directive::Done => "done",
            Directive::Requeue => "requeue",
            Directive::RequeueAfter(_) => "requeue_after",
        }
    }
}

/// Releases external side effects of a record that owner-link garbage collection does not cover.
/// Runs in the deleting branch before the finalizer is removed; must be idempotent.
#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn cleanup(&self, record: &AppService) -> Result<(), StoreError>;
}

/// Nothing outside the owner-linked resources to release.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCleanup;

#[async_trait]
impl Cleanup for LogCleanup {
    async fn cleanup(&self, record: &AppService) -> Result<(), StoreError> {
        info!(key = %record.key(), "cleaning up resources");
        Ok(())
    }
}

pub struct Reconciler<A> {
    accessor: Arc<A>,
    cfg: EngineConfig,
    cleanup: Arc<dyn Cleanup>,
    clock: Arc<dyn Clock>,
}

impl<A: Accessor> Reconciler<A> {
    pub fn new(accessor: Arc<A>, cfg: EngineConfig) -> Self {
        Self { accessor, cfg, cleanup: Arc::new(LogCleanup), clock: Arc::new(SystemClock) }
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn Cleanup>) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// One full pass for `key`, with start/outcome logging and metrics around it.
    pub async fn reconcile(&self, key: &Key, ctx: &PassContext) -> Result<Directive, ReconcileError> {
        let t0 = Instant::now();
        debug!(key = %key, "reconcile started");
        let res = self.pass(key, ctx).await;
        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_latency_ms", ms);
        match &res {
            Ok(d) => {
                counter!("reconcile_total", 1u64, "outcome" => d.label());
                debug!(key = %key, directive = ?d, ms, "reconcile finished");
            }
            Err(e) => {
                counter!("reconcile_total", 1u64, "outcome" => "error");
                counter!("reconcile_errors_total", 1u64, "op" => e.op);
                warn!(key = %key, error = %e, retryable = e.is_retryable(), "reconcile failed");
            }
        }
        res
    }

    async fn pass(&self, key: &Key, ctx: &PassContext) -> Result<Directive, ReconcileError> {
        let acc = &self.accessor;
        let Some(mut record) = ctx.call("fetch record", acc.get_record(key)).await? else {
            debug!(key = %key, "record not found; nothing to do");
            return Ok(Directive::Done);
        };

        if record.meta.deletion_requested {
            return self.finalize(record, ctx).await;
        }

        if record.meta.add_finalizer(&self.cfg.finalizer) {
            ctx.call("add finalizer", acc.update_record(&record)).await?;
            mutation("add_finalizer");
            info!(key = %key, finalizer = %self.cfg.finalizer, "finalizer added");
            return Ok(Directive::Requeue);
        }

        if let Err(e) = record.validate() {
            record_invalid(&mut record.status, &e.to_string(), self.clock.now());
            ctx.call("update status", acc.update_status(&record)).await?;
            warn!(key = %key, error = %e, "record spec is invalid; waiting for an edit");
            return Ok(Directive::Done);
        }

        let desired = synth::synthesize(&record, &self.cfg);

        let existing = ctx.call("fetch workload", acc.get(ResourceKind::Workload, key)).await?;
        let Some(workload) = existing.and_then(ManagedResource::into_workload) else {
            let res = ManagedResource::Workload(desired.workload);
            ctx.call("create workload", acc.create_or_update(&res)).await?;
            mutation("create_workload");
            info!(key = %key, replicas = record.spec.replicas, "creating workload");
            return Ok(Directive::Requeue);
        };

        if workload.replicas != desired.workload.replicas {
            let from = workload.replicas;
            let stamp = workload.envelope.version_stamp.as_ref();
            ctx.call("scale workload", acc.scale(key, desired.workload.replicas, stamp)).await?;
            mutation("scale_workload");
            info!(key = %key, from, to = desired.workload.replicas, "workload replicas patched");
            return Ok(Directive::Requeue);
        }

        let endpoint = ctx.call("fetch endpoint", acc.get(ResourceKind::Endpoint, key)).await?;
        if endpoint.and_then(ManagedResource::into_endpoint).is_none() {
            let res = ManagedResource::Endpoint(desired.endpoint);
            ctx.call("create endpoint", acc.create_or_update(&res)).await?;
            mutation("create_endpoint");
            info!(key = %key, port = record.spec.port, "creating endpoint");
            return Ok(Directive::Requeue);
        }

        record_rollout(&mut record.status, record.spec.replicas, workload.available_replicas, self.clock.now());
        ctx.call("update status", acc.update_status(&record)).await?;
        debug!(
            key = %key,
            phase = record.status.phase.as_str(),
            available = record.status.available_replicas,
            "status updated"
        );
        Ok(Directive::RequeueAfter(self.cfg.requeue_after))
    }

    /// Deleting branch: release, then drop our finalizer so the store can remove the record.
    async fn finalize(&self, mut record: AppService, ctx: &PassContext) -> Result<Directive, ReconcileError> {
        if !record.meta.has_finalizer(&self.cfg.finalizer) {
            debug!(key = %record.key(), "deleting record carries no finalizer of ours");
            return Ok(Directive::Done);
        }
        ctx.call("cleanup", self.cleanup.cleanup(&record)).await?;
        record.meta.remove_finalizer(&self.cfg.finalizer);
        ctx.call("remove finalizer", self.accessor.update_record(&record)).await?;
        mutation("remove_finalizer");
        info!(key = %record.key(), "finalizer removed");
        Ok(Directive::Done)
    }
}

fn mutation(kind: &'static str) {
    counter!("reconcile_mutations_total", 1u64, "kind" => kind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use keel_core::{AppServiceSpec, ConditionStatus, Phase};
    use keel_store::{MemStore, Op};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> PassContext {
        PassContext::new(CancellationToken::new(), Duration::from_secs(5))
    }

    fn spec(replicas: i32) -> AppServiceSpec {
        AppServiceSpec { replicas, image: "x:1".into(), port: 8080, ..Default::default() }
    }

    async fn setup(replicas: i32) -> (Arc<MemStore>, Reconciler<MemStore>, Key) {
        let store = Arc::new(MemStore::new());
        let key = Key::new("ns", "a");
        store.insert_record(AppService::new(key.clone(), spec(replicas))).await;
        let r = Reconciler::new(Arc::clone(&store), EngineConfig::default())
            .with_clock(Arc::new(ManualClock::at(1_700_000_000)));
        (store, r, key)
    }

    #[derive(Default)]
    struct CountingCleanup(AtomicUsize);

    #[async_trait]
    impl Cleanup for CountingCleanup {
        async fn cleanup(&self, _record: &AppService) -> Result<(), StoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn absent_record_is_done() {
        let store = Arc::new(MemStore::new());
        let r = Reconciler::new(Arc::clone(&store), EngineConfig::default());
        let d = r.reconcile(&Key::new("ns", "ghost"), &ctx()).await.unwrap();
        assert_eq!(d, Directive::Done);
        assert!(store.journal().await.is_empty());
    }

    #[tokio::test]
    async fn first_pass_only_adds_the_finalizer() {
        let (store, r, key) = setup(3).await;
        assert_eq!(r.reconcile(&key, &ctx()).await.unwrap(), Directive::Requeue);
        let rec = store.record(&key).await.unwrap();
        assert_eq!(rec.meta.finalizers, vec!["example.com/finalizer".to_string()]);
        assert_eq!(store.resource_count().await, 0);
    }

    #[tokio::test]
    async fn finalizer_is_never_duplicated() {
        let (store, r, key) = setup(1).await;
        for _ in 0..6 {
            r.reconcile(&key, &ctx()).await.unwrap();
        }
        let rec = store.record(&key).await.unwrap();
        assert_eq!(rec.meta.finalizers.len(), 1);
    }

    #[tokio::test]
    async fn invalid_spec_fails_without_touching_dependents() {
        let (store, r, key) = setup(-2).await;
        r.reconcile(&key, &ctx()).await.unwrap();
        assert_eq!(r.reconcile(&key, &ctx()).await.unwrap(), Directive::Done);
        let rec = store.record(&key).await.unwrap();
        assert_eq!(rec.status.phase, Phase::Failed);
        let c = rec.status.condition("Ready").unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.reason, "InvalidSpec");
        assert!(c.message.contains("replicas"), "{}", c.message);
        assert_eq!(store.resource_count().await, 0);
    }

    #[tokio::test]
    async fn undecodable_spec_is_failed_not_retried() {
        let store = Arc::new(MemStore::new());
        let key = Key::new("ns", "broken");
        let mut rec = AppService::new(key.clone(), AppServiceSpec::default());
        rec.spec_error = Some("replicas: invalid type: string \"three\", expected i32".into());
        store.insert_record(rec).await;
        let r = Reconciler::new(Arc::clone(&store), EngineConfig::default());

        assert_eq!(r.reconcile(&key, &ctx()).await.unwrap(), Directive::Requeue);
        assert_eq!(r.reconcile(&key, &ctx()).await.unwrap(), Directive::Done);
        let rec = store.record(&key).await.unwrap();
        assert_eq!(rec.status.phase, Phase::Failed);
        let c = rec.status.condition("Ready").unwrap();
        assert_eq!(c.reason, "InvalidSpec");
        assert!(c.message.contains("three"), "{}", c.message);
        assert_eq!(store.resource_count().await, 0);
    }

    #[tokio::test]
    async fn deletion_runs_cleanup_and_releases_finalizer() {
        let (store, r, key) = setup(1).await;
        let cleanup = Arc::new(CountingCleanup::default());
        let r = r.with_cleanup(cleanup.clone());
        for _ in 0..4 {
            r.reconcile(&key, &ctx()).await.unwrap();
        }
        assert_eq!(store.resource_count().await, 2);
        store.request_deletion(&key).await;
        store.clear_journal().await;

        assert_eq!(r.reconcile(&key, &ctx()).await.unwrap(), Directive::Done);
        assert_eq!(cleanup.0.load(Ordering::SeqCst), 1);
        assert!(store.record(&key).await.is_none());
        assert_eq!(store.resource_count().await, 0, "owned resources are collected with the record");
        let ops: Vec<_> = store.journal().await.into_iter().map(|j| j.op).collect();
        assert_eq!(ops, vec![Op::UpdateRecord]);
    }

    #[tokio::test]
    async fn deleting_record_without_our_finalizer_is_left_alone() {
        let (store, r, key) = setup(1).await;
        store.edit_record(&key, |rec| rec.meta.finalizers.push("someone.else/finalizer".into())).await;
        store.request_deletion(&key).await;
        store.clear_journal().await;
        assert_eq!(r.reconcile(&key, &ctx()).await.unwrap(), Directive::Done);
        assert!(store.journal().await.is_empty());
        assert!(store.record(&key).await.is_some());
    }

    #[tokio::test]
    async fn store_errors_abort_the_pass_with_the_operation_name() {
        let (store, r, key) = setup(1).await;
        r.reconcile(&key, &ctx()).await.unwrap();
        store.inject(Op::Create, StoreError::Transient("etcd unavailable".into())).await;
        let err = r.reconcile(&key, &ctx()).await.unwrap_err();
        assert_eq!(err.op, "create workload");
        assert!(err.is_retryable());
        assert_eq!(store.resource_count().await, 0);
    }

    #[tokio::test]
    async fn conflicting_finalizer_write_surfaces_as_conflict() {
        let (store, r, key) = setup(1).await;
        store.inject(Op::UpdateRecord, StoreError::Conflict("stale".into())).await;
        let err = r.reconcile(&key, &ctx()).await.unwrap_err();
        assert_eq!(err.op, "add finalizer");
        assert!(err.source.is_conflict());
        assert!(store.record(&key).await.unwrap().meta.finalizers.is_empty());
    }

    #[tokio::test]
    async fn cancelled_pass_returns_error_and_mutates_nothing() {
        let store = Arc::new(MemStore::with_latency(Duration::from_millis(200)));
        let key = Key::new("ns", "a");
        store.insert_record(AppService::new(key.clone(), spec(1))).await;
        let r = Reconciler::new(Arc::clone(&store), EngineConfig::default());
        let token = CancellationToken::new();
        let pass_ctx = PassContext::new(token.clone(), Duration::from_secs(5));
        let handle = tokio::spawn(async move { r.reconcile(&key, &pass_ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.source, StoreError::Cancelled);
        assert_eq!(err.op, "fetch record");
        assert!(store.journal().await.is_empty());
    }
}
