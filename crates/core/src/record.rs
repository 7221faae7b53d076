//! The desired-state record (`AppService`) and its engine-owned status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::SpecError, Key, VersionStamp};

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-._a-zA-Z][-._a-zA-Z0-9]*$").expect("env name pattern compiles"));

/// Store-side metadata of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub key: Key,
    /// Store-assigned identity, used in owner links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_stamp: Option<VersionStamp>,
}

impl Meta {
    pub fn new(key: Key) -> Self {
        Self { key, uid: None, finalizers: Vec::new(), deletion_requested: false, version_stamp: None }
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// Returns false when the token was already present.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.finalizers.push(token.to_string());
        true
    }

    /// Returns false when the token was not present.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != token);
        self.finalizers.len() != before
    }
}

/// Optional CPU/memory quantities; empty strings count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceHints {
    pub fn cpu(&self) -> Option<&str> {
        self.cpu.as_deref().filter(|s| !s.is_empty())
    }

    pub fn memory(&self) -> Option<&str> {
        self.memory.as_deref().filter(|s| !s.is_empty())
    }

    pub fn is_unset(&self) -> bool {
        self.cpu().is_none() && self.memory().is_none()
    }
}

/// User-authored intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceSpec {
    pub replicas: i32,
    pub image: String,
    pub port: i32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceHints>,
}

impl AppServiceSpec {
    /// Collects every problem rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), SpecError> {
        let mut problems = Vec::new();
        if self.replicas < 0 {
            problems.push(format!("replicas must be >= 0 (got {})", self.replicas));
        }
        if !(1..=65535).contains(&self.port) {
            problems.push(format!("port must be within 1..=65535 (got {})", self.port));
        }
        if self.image.trim().is_empty() {
            problems.push("image must not be empty".to_string());
        } else if self.image.chars().any(char::is_whitespace) {
            problems.push(format!("image must not contain whitespace ({:?})", self.image));
        }
        for name in self.environment.keys() {
            if !ENV_NAME.is_match(name) {
                problems.push(format!("environment variable name {:?} is not valid", name));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SpecError { problems })
        }
    }
}

/// Coarse lifecycle phase. `Initializing` is what a record reports before its first status write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Initializing,
    Reconciling,
    Pending,
    Ready,
    Failed,
    Deleting,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initializing => "Initializing",
            Phase::Reconciling => "Reconciling",
            Phase::Pending => "Pending",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Engine-owned status. Never read when computing desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

impl AppServiceStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppService {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: AppServiceSpec,
    #[serde(default)]
    pub status: AppServiceStatus,
    /// Set when the stored spec could not be decoded; `spec` is then the default.
    #[serde(skip)]
    pub spec_error: Option<String>,
}

impl AppService {
    pub fn new(key: Key, spec: AppServiceSpec) -> Self {
        Self { meta: Meta::new(key), spec, status: AppServiceStatus::default(), spec_error: None }
    }

    /// Validate the spec. An undecodable spec is reported as its only problem.
    pub fn validate(&self) -> Result<(), SpecError> {
        match &self.spec_error {
            Some(e) => Err(SpecError { problems: vec![format!("spec could not be decoded: {e}")] }),
            None => self.spec.validate(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.meta.key
    }
}
