//! Desired-state synthesis: pure functions from a record to the resources it should own.
//!
//! Only `meta` and `spec` are read. Status never feeds back into desired state.

use keel_core::{
    AppService, ComputeWorkload, Container, EnvVar, Envelope, Labels, NetworkEndpoint, OwnerLink,
    ResourceHints,
};
use smallvec::smallvec;

use crate::EngineConfig;

/// Both resources a record should own, freshly derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Desired {
    pub workload: ComputeWorkload,
    pub endpoint: NetworkEndpoint,
}

pub fn synthesize(record: &AppService, cfg: &EngineConfig) -> Desired {
    Desired { workload: workload(record, cfg), endpoint: endpoint(record, cfg) }
}

/// `{selector_key: record name}`, shared by the pod template, the pod selector and the endpoint.
pub fn selector_labels(record: &AppService, cfg: &EngineConfig) -> Labels {
    smallvec![(cfg.selector_key.clone(), record.meta.key.name.clone())]
}

fn envelope(record: &AppService, cfg: &EngineConfig) -> Envelope {
    Envelope {
        key: record.meta.key.clone(),
        labels: selector_labels(record, cfg),
        owner: Some(OwnerLink::for_record(record)),
        version_stamp: None,
    }
}

/// Keep only non-empty quantities; `None` when nothing is left.
fn resource_constraints(hints: Option<&ResourceHints>) -> Option<ResourceHints> {
    let hints = hints.filter(|h| !h.is_unset())?;
    Some(ResourceHints { cpu: hints.cpu().map(str::to_string), memory: hints.memory().map(str::to_string) })
}

pub fn workload(record: &AppService, cfg: &EngineConfig) -> ComputeWorkload {
    let spec = &record.spec;
    let env = spec
        .environment
        .iter()
        .map(|(name, value)| EnvVar { name: name.clone(), value: value.clone() })
        .collect();
    ComputeWorkload {
        envelope: envelope(record, cfg),
        replicas: spec.replicas,
        selector: selector_labels(record, cfg),
        container: Container {
            name: record.meta.key.name.clone(),
            image: spec.image.clone(),
            port: spec.port,
            env,
            resources: resource_constraints(spec.resources.as_ref()),
        },
        available_replicas: 0,
    }
}

pub fn endpoint(record: &AppService, cfg: &EngineConfig) -> NetworkEndpoint {
    NetworkEndpoint {
        envelope: envelope(record, cfg),
        selector: selector_labels(record, cfg),
        port: record.spec.port,
        target_port: record.spec.port,
    }
}
