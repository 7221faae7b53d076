//! Keel core types: the desired-state record, the managed resources derived from it,
//! the error taxonomy shared by every store implementation, and condition tracking.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod accessor;
pub mod conditions;
pub mod error;
pub mod record;
pub mod resource;

pub use accessor::Accessor;
pub use error::{ReconcileError, SpecError, StoreError};
pub use record::{
    AppService, AppServiceSpec, AppServiceStatus, Condition, ConditionStatus, Meta, Phase,
    ResourceHints,
};
pub use resource::{
    ComputeWorkload, Container, EnvVar, Envelope, Labels, ManagedResource, NetworkEndpoint,
    OwnerLink, ResourceKind,
};

/// API group/version/kind of the desired-state record.
pub const GROUP: &str = "example.com";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "AppService";
pub const PLURAL: &str = "appservices";

/// Stable identity of a record (and of the managed resources derived from it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

impl Key {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque optimistic-concurrency token assigned by the store on every write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionStamp(pub String);

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a key was posted to the trigger queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReason {
    RecordChanged,
    RecordDeleted,
    DependentChanged(ResourceKind),
    Resync,
    Requeue,
    Backoff,
}

/// Message posted by the trigger layer; the engine only ever consumes these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: Key,
    pub reason: TriggerReason,
}

impl Trigger {
    pub fn new(key: Key, reason: TriggerReason) -> Self {
        Self { key, reason }
    }
}
