//! Per-pass cancellation and deadlines for store calls.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use keel_core::{ReconcileError, StoreError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Carried through one reconcile pass. Every store call races the cancellation token and a
/// timeout bounded by both the per-call limit and the pass deadline.
#[derive(Debug, Clone)]
pub struct PassContext {
    cancel: CancellationToken,
    call_timeout: Duration,
    deadline: Option<Instant>,
}

impl PassContext {
    pub fn new(cancel: CancellationToken, call_timeout: Duration) -> Self {
        Self { cancel, call_timeout, deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn budget(&self) -> Duration {
        match self.deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(self.call_timeout),
            None => self.call_timeout,
        }
    }

    /// Run one store call under this context, tagging failures with `op`.
    pub async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(ReconcileError::new(op, StoreError::Cancelled));
        }
        let budget = self.budget();
        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
            r = tokio::time::timeout(budget, fut) => match r {
                Ok(inner) => inner,
                Err(_) => Err(StoreError::Timeout(budget.as_millis() as u64)),
            },
        };
        res.map_err(|e| {
            warn!(op, error = %e, "store call failed");
            ReconcileError::new(op, e)
        })
    }
}

/// Source of "now" for status timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to; whole seconds since the epoch.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    pub fn at(secs: i64) -> Self {
        Self { secs: AtomicI64::new(secs) }
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.secs.load(Ordering::SeqCst), 0).single().unwrap_or_default()
    }
}
