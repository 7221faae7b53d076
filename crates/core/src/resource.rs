//! Managed resources: a closed set of variants sharing one envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{record::ResourceHints, AppService, Key, VersionStamp, GROUP, KIND, VERSION};

/// Label pairs in insertion order.
pub type Labels = SmallVec<[(String, String); 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Workload,
    Endpoint,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Workload => "workload",
            ResourceKind::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-reference from a managed resource to the record that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerLink {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub controller: bool,
    pub block_owner_deletion: bool,
}

impl OwnerLink {
    pub fn for_record(rec: &AppService) -> Self {
        Self {
            api_version: format!("{}/{}", GROUP, VERSION),
            kind: KIND.to_string(),
            name: rec.meta.key.name.clone(),
            uid: rec.meta.uid.clone(),
            controller: true,
            block_owner_deletion: true,
        }
    }

    pub fn points_at(&self, owner: &Key, uid: Option<&str>) -> bool {
        self.kind == KIND
            && self.name == owner.name
            && match (self.uid.as_deref(), uid) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Fields every managed resource carries regardless of variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub key: Key,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_stamp: Option<VersionStamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub port: i32,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// `None` means no resource constraints at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceHints>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeWorkload {
    pub envelope: Envelope,
    pub replicas: i32,
    /// Pod selector; also stamped on the pod template.
    pub selector: Labels,
    pub container: Container,
    /// Observed by the store, never synthesized.
    #[serde(default)]
    pub available_replicas: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpoint {
    pub envelope: Envelope,
    pub selector: Labels,
    pub port: i32,
    pub target_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ManagedResource {
    Workload(ComputeWorkload),
    Endpoint(NetworkEndpoint),
}

impl ManagedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedResource::Workload(_) => ResourceKind::Workload,
            ManagedResource::Endpoint(_) => ResourceKind::Endpoint,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            ManagedResource::Workload(w) => &w.envelope,
            ManagedResource::Endpoint(e) => &e.envelope,
        }
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        match self {
            ManagedResource::Workload(w) => &mut w.envelope,
            ManagedResource::Endpoint(e) => &mut e.envelope,
        }
    }

    pub fn key(&self) -> &Key {
        &self.envelope().key
    }

    pub fn version_stamp(&self) -> Option<&VersionStamp> {
        self.envelope().version_stamp.as_ref()
    }

    pub fn set_version_stamp(&mut self, stamp: Option<VersionStamp>) {
        self.envelope_mut().version_stamp = stamp;
    }

    pub fn into_workload(self) -> Option<ComputeWorkload> {
        match self {
            ManagedResource::Workload(w) => Some(w),
            ManagedResource::Endpoint(_) => None,
        }
    }

    pub fn into_endpoint(self) -> Option<NetworkEndpoint> {
        match self {
            ManagedResource::Endpoint(e) => Some(e),
            ManagedResource::Workload(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppServiceSpec;

    #[test]
    fn owner_link_targets_the_record() {
        let mut rec = AppService::new(Key::new("ns", "a"), AppServiceSpec::default());
        rec.meta.uid = Some("u-1".into());
        let link = OwnerLink::for_record(&rec);
        assert_eq!(link.api_version, "example.com/v1alpha1");
        assert_eq!(link.kind, "AppService");
        assert!(link.controller);
        assert!(link.points_at(&Key::new("ns", "a"), Some("u-1")));
        assert!(!link.points_at(&Key::new("ns", "a"), Some("u-2")));
        assert!(!link.points_at(&Key::new("ns", "b"), None));
    }

    #[test]
    fn variant_accessors_share_the_envelope() {
        let env = Envelope { key: Key::new("ns", "a"), labels: Labels::new(), owner: None, version_stamp: None };
        let mut r = ManagedResource::Endpoint(NetworkEndpoint {
            envelope: env,
            selector: Labels::new(),
            port: 80,
            target_port: 80,
        });
        assert_eq!(r.kind(), ResourceKind::Endpoint);
        r.set_version_stamp(Some(VersionStamp("7".into())));
        assert_eq!(r.version_stamp().map(|v| v.0.as_str()), Some("7"));
        assert!(r.clone().into_workload().is_none());
        assert_eq!(r.into_endpoint().map(|e| e.port), Some(80));
    }
}
