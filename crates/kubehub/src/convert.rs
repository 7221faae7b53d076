//! Mapping between keel's typed model and the cluster's wire objects.
//!
//! Records travel as `DynamicObject` (the CRD is not compiled in); workloads and endpoints map to
//! `apps/v1 Deployment` and `v1 Service`. Writes to existing dependents overlay the modeled fields
//! onto the live object so fields keel does not model survive a replace. Record writes and scaling
//! go out as JSON merge patches carrying only the fields keel owns plus the resourceVersion
//! precondition.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{
        Container as PodContainer, ContainerPort, EnvVar as PodEnvVar, PodSpec, PodTemplateSpec,
        ResourceRequirements, Service, ServicePort, ServiceSpec,
    },
};
use k8s_openapi::apimachinery::pkg::{
    api::resource::Quantity,
    apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
    util::intstr::IntOrString,
};
use keel_core::{
    AppService, AppServiceSpec, AppServiceStatus, ComputeWorkload, Container, EnvVar, Envelope, Key, Labels, Meta,
    NetworkEndpoint, OwnerLink, ResourceHints, StoreError, VersionStamp,
};
use kube::api::DynamicObject;
use serde_json::{json, Value};
use tracing::warn;

pub const CLUSTER_IP: &str = "ClusterIP";

fn key_of(meta: &ObjectMeta) -> Result<Key, StoreError> {
    let name = meta.name.clone().ok_or_else(|| StoreError::Invalid("object has no name".into()))?;
    Ok(Key::new(meta.namespace.clone().unwrap_or_default(), name))
}

fn stamp_of(meta: &ObjectMeta) -> Option<VersionStamp> {
    meta.resource_version.clone().map(VersionStamp)
}

// ---------- records ----------

/// Read a record. A spec that does not decode is carried on `spec_error` so the record can be
/// reported invalid instead of failing every read.
pub fn record_from_dynamic(obj: &DynamicObject) -> Result<AppService, StoreError> {
    let meta = Meta {
        key: key_of(&obj.metadata)?,
        uid: obj.metadata.uid.clone(),
        finalizers: obj.metadata.finalizers.clone().unwrap_or_default(),
        deletion_requested: obj.metadata.deletion_timestamp.is_some(),
        version_stamp: stamp_of(&obj.metadata),
    };
    let (spec, spec_error) = match obj.data.get("spec") {
        Some(v) if !v.is_null() => match serde_json::from_value::<AppServiceSpec>(v.clone()) {
            Ok(spec) => (spec, None),
            Err(e) => (AppServiceSpec::default(), Some(e.to_string())),
        },
        _ => (AppServiceSpec::default(), None),
    };
    let status: AppServiceStatus = match obj.data.get("status") {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            warn!(key = %meta.key, error = %e, "stored status does not decode; starting from empty");
            AppServiceStatus::default()
        }),
        _ => AppServiceStatus::default(),
    };
    Ok(AppService { meta, spec, status, spec_error })
}

fn precondition(stamp: Option<&VersionStamp>) -> Value {
    match stamp {
        Some(v) => json!({ "resourceVersion": v.0 }),
        None => json!({}),
    }
}

/// Merge patch setting only the record's finalizers.
pub fn finalizer_patch(rec: &AppService) -> Value {
    let mut meta = precondition(rec.meta.version_stamp.as_ref());
    meta["finalizers"] = json!(rec.meta.finalizers);
    json!({ "metadata": meta })
}

/// Merge patch for the status subresource.
pub fn status_patch(rec: &AppService) -> Result<Value, StoreError> {
    let status = serde_json::to_value(&rec.status).map_err(|e| StoreError::Invalid(e.to_string()))?;
    Ok(json!({ "metadata": precondition(rec.meta.version_stamp.as_ref()), "status": status }))
}

/// Merge patch setting only `spec.replicas` of a deployment.
pub fn scale_patch(replicas: i32, stamp: Option<&VersionStamp>) -> Value {
    json!({ "metadata": precondition(stamp), "spec": { "replicas": replicas } })
}

// ---------- shared metadata ----------

fn labels_map(labels: &Labels) -> BTreeMap<String, String> {
    labels.iter().cloned().collect()
}

fn labels_from(map: Option<&BTreeMap<String, String>>) -> Labels {
    map.map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).unwrap_or_default()
}

pub fn owner_reference(link: &OwnerLink) -> OwnerReference {
    OwnerReference {
        api_version: link.api_version.clone(),
        kind: link.kind.clone(),
        name: link.name.clone(),
        uid: link.uid.clone().unwrap_or_default(),
        controller: Some(link.controller),
        block_owner_deletion: Some(link.block_owner_deletion),
    }
}

/// The controlling owner reference, if any.
pub fn controller_link(meta: &ObjectMeta) -> Option<OwnerLink> {
    meta.owner_references.as_ref()?.iter().find(|r| r.controller == Some(true)).map(|r| OwnerLink {
        api_version: r.api_version.clone(),
        kind: r.kind.clone(),
        name: r.name.clone(),
        uid: if r.uid.is_empty() { None } else { Some(r.uid.clone()) },
        controller: true,
        block_owner_deletion: r.block_owner_deletion.unwrap_or(false),
    })
}

fn envelope_from(meta: &ObjectMeta) -> Result<Envelope, StoreError> {
    Ok(Envelope {
        key: key_of(meta)?,
        labels: labels_from(meta.labels.as_ref()),
        owner: controller_link(meta),
        version_stamp: stamp_of(meta),
    })
}

fn overlay_meta(meta: &mut ObjectMeta, env: &Envelope) {
    meta.name = Some(env.key.name.clone());
    meta.namespace = Some(env.key.namespace.clone());
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in &env.labels {
        labels.insert(k.clone(), v.clone());
    }
    if let Some(link) = &env.owner {
        let refs = meta.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.controller != Some(true));
        refs.push(owner_reference(link));
    }
    meta.resource_version = env.version_stamp.as_ref().map(|s| s.0.clone());
}

// ---------- workloads ----------

fn quantities(h: &ResourceHints) -> BTreeMap<String, Quantity> {
    let mut out = BTreeMap::new();
    if let Some(cpu) = h.cpu() {
        out.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if let Some(mem) = h.memory() {
        out.insert("memory".to_string(), Quantity(mem.to_string()));
    }
    out
}

/// Hints become both requests and limits.
fn requirements(h: Option<&ResourceHints>) -> Option<ResourceRequirements> {
    let h = h.filter(|h| !h.is_unset())?;
    let q = quantities(h);
    Some(ResourceRequirements { requests: Some(q.clone()), limits: Some(q), ..Default::default() })
}

fn hints_from(req: Option<&ResourceRequirements>) -> Option<ResourceHints> {
    let req = req?;
    let pick = |name: &str| {
        req.requests
            .as_ref()
            .and_then(|m| m.get(name))
            .or_else(|| req.limits.as_ref().and_then(|m| m.get(name)))
            .map(|q| q.0.clone())
    };
    let hints = ResourceHints { cpu: pick("cpu"), memory: pick("memory") };
    if hints.is_unset() {
        None
    } else {
        Some(hints)
    }
}

fn overlay_container(c: &mut PodContainer, want: &Container) {
    c.name = want.name.clone();
    c.image = Some(want.image.clone());
    let ports = c.ports.get_or_insert_with(Vec::new);
    match ports.first_mut() {
        Some(p) => p.container_port = want.port,
        None => ports.push(ContainerPort { container_port: want.port, ..Default::default() }),
    }
    c.env = if want.env.is_empty() {
        None
    } else {
        Some(
            want.env
                .iter()
                .map(|e| PodEnvVar { name: e.name.clone(), value: Some(e.value.clone()), ..Default::default() })
                .collect(),
        )
    };
    c.resources = requirements(want.resources.as_ref());
}

fn container_from(c: &PodContainer) -> Container {
    Container {
        name: c.name.clone(),
        image: c.image.clone().unwrap_or_default(),
        port: c.ports.as_ref().and_then(|p| p.first()).map(|p| p.container_port).unwrap_or_default(),
        env: c
            .env
            .as_ref()
            .map(|vars| {
                vars.iter()
                    .map(|v| EnvVar { name: v.name.clone(), value: v.value.clone().unwrap_or_default() })
                    .collect()
            })
            .unwrap_or_default(),
        resources: hints_from(c.resources.as_ref()),
    }
}

pub fn workload_from_deployment(d: &Deployment) -> Result<ComputeWorkload, StoreError> {
    let envelope = envelope_from(&d.metadata)?;
    let spec = d.spec.as_ref();
    let container = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .map(container_from)
        .unwrap_or_default();
    Ok(ComputeWorkload {
        envelope,
        replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        selector: labels_from(spec.and_then(|s| s.selector.match_labels.as_ref())),
        container,
        available_replicas: d.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0),
    })
}

/// Write the modeled fields of `w` onto `d`. The first container is the managed one. A selector
/// already set is kept; the server rejects selector changes.
pub fn overlay_deployment(d: &mut Deployment, w: &ComputeWorkload) {
    overlay_meta(&mut d.metadata, &w.envelope);
    let selector = labels_map(&w.selector);
    let spec = d.spec.get_or_insert_with(DeploymentSpec::default);
    spec.replicas = Some(w.replicas);
    if spec.selector == LabelSelector::default() {
        spec.selector = LabelSelector { match_labels: Some(selector.clone()), ..Default::default() };
    }
    let tmeta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    let tlabels = tmeta.labels.get_or_insert_with(BTreeMap::new);
    tlabels.extend(selector);
    let pod = spec.template.spec.get_or_insert_with(PodSpec::default);
    match pod.containers.first_mut() {
        Some(c) => overlay_container(c, &w.container),
        None => {
            let mut c = PodContainer::default();
            overlay_container(&mut c, &w.container);
            pod.containers.push(c);
        }
    }
}

pub fn deployment_from_workload(w: &ComputeWorkload) -> Deployment {
    let mut d = Deployment {
        spec: Some(DeploymentSpec { template: PodTemplateSpec::default(), ..Default::default() }),
        ..Default::default()
    };
    overlay_deployment(&mut d, w);
    d
}

// ---------- endpoints ----------

pub fn endpoint_from_service(s: &Service) -> Result<NetworkEndpoint, StoreError> {
    let envelope = envelope_from(&s.metadata)?;
    let spec = s.spec.as_ref();
    let port = spec.and_then(|s| s.ports.as_ref()).and_then(|p| p.first());
    let target_port = match port.and_then(|p| p.target_port.as_ref()) {
        Some(IntOrString::Int(n)) => *n,
        Some(IntOrString::String(s)) => s.parse().unwrap_or_default(),
        None => port.map(|p| p.port).unwrap_or_default(),
    };
    Ok(NetworkEndpoint {
        envelope,
        selector: labels_from(spec.and_then(|s| s.selector.as_ref())),
        port: port.map(|p| p.port).unwrap_or_default(),
        target_port,
    })
}

pub fn overlay_service(s: &mut Service, ep: &NetworkEndpoint) {
    overlay_meta(&mut s.metadata, &ep.envelope);
    let spec = s.spec.get_or_insert_with(ServiceSpec::default);
    spec.selector = Some(labels_map(&ep.selector));
    if spec.type_.is_none() {
        spec.type_ = Some(CLUSTER_IP.to_string());
    }
    let ports = spec.ports.get_or_insert_with(Vec::new);
    let want = |p: &mut ServicePort| {
        p.port = ep.port;
        p.target_port = Some(IntOrString::Int(ep.target_port));
    };
    match ports.first_mut() {
        Some(p) => want(p),
        None => {
            let mut p = ServicePort::default();
            want(&mut p);
            ports.push(p);
        }
    }
}

pub fn service_from_endpoint(ep: &NetworkEndpoint) -> Service {
    let mut s = Service::default();
    overlay_service(&mut s, ep);
    s
}

/// Raw JSON view of a dependent, used by the `render` command.
pub fn to_manifest<T: serde::Serialize>(obj: &T) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}
