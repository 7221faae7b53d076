//! Error taxonomy shared by stores and the reconcile engine.
//!
//! "Not found" is deliberately absent: lookups return `Option` and deletes of absent
//! objects succeed.

use serde::{Deserialize, Serialize};

/// Failure of a single store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    /// The version stamp carried by a write no longer matches the stored object.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store could not be reached or answered with a server-side failure.
    #[error("transient: {0}")]
    Transient(String),
    /// The store rejected the object itself; retrying the same write will not help.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0}ms")]
    Timeout(u64),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Invalid(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// A store failure that aborted a reconcile pass, tagged with the failing operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op}: {source}")]
pub struct ReconcileError {
    pub op: &'static str,
    #[source]
    pub source: StoreError,
}

impl ReconcileError {
    pub fn new(op: &'static str, source: StoreError) -> Self {
        Self { op, source }
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Every problem found while validating a record spec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid spec: {}", .problems.join("; "))]
pub struct SpecError {
    pub problems: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_is_terminal() {
        assert!(StoreError::Conflict("rv".into()).is_retryable());
        assert!(StoreError::Transient("down".into()).is_retryable());
        assert!(StoreError::Cancelled.is_retryable());
        assert!(StoreError::Timeout(10).is_retryable());
        assert!(!StoreError::Invalid("bad".into()).is_retryable());
    }

    #[test]
    fn reconcile_error_names_the_operation() {
        let e = ReconcileError::new("create workload", StoreError::Transient("connection reset".into()));
        assert_eq!(e.to_string(), "create workload: transient: connection reset");
    }

    #[test]
    fn spec_error_joins_problems() {
        let e = SpecError { problems: vec!["a".into(), "b".into()] };
        assert_eq!(e.to_string(), "invalid spec: a; b");
    }
}
