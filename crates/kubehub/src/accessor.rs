use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use keel_core::{Accessor, AppService, ComputeWorkload, Key, ManagedResource, ResourceKind, StoreError, VersionStamp};
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    Client,
};
use tracing::{debug, warn};

use crate::{convert, KindRegistry};

/// Accessor backed by the Kubernetes API server.
///
/// Stamps are `metadata.resourceVersion`; the server enforces them on replace and on patches
/// that carry one.
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
    registry: Arc<KindRegistry>,
}

impl KubeAccessor {
    pub fn new(client: Client, registry: Arc<KindRegistry>) -> Self {
        Self { client, registry }
    }

    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    fn records(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, self.registry.record())
    }

    fn deployments(&self, ns: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn services(&self, ns: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), ns)
    }
}

/// Map a kube error to the store taxonomy. 404 is handled by callers where it means "absent";
/// on a write it means the object went away mid-pass and the next pass will see that.
pub(crate) fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            409 => StoreError::Conflict(resp.message),
            400 | 422 => StoreError::Invalid(resp.message),
            404 => StoreError::Transient(format!("deleted mid-pass: {}", resp.message)),
            _ => StoreError::Transient(format!("{} ({})", resp.message, resp.code)),
        },
        other => StoreError::Transient(other.to_string()),
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

fn gone(kind: ResourceKind, key: &Key) -> StoreError {
    warn!(kind = %kind, key = %key, "object deleted mid-pass");
    StoreError::Transient(format!("{} {} was deleted mid-pass", kind, key))
}

#[async_trait]
impl Accessor for KubeAccessor {
    async fn get_record(&self, key: &Key) -> Result<Option<AppService>, StoreError> {
        let obj = self.records(&key.namespace).get_opt(&key.name).await.map_err(store_error)?;
        obj.as_ref().map(convert::record_from_dynamic).transpose()
    }

    async fn update_record(&self, record: &AppService) -> Result<AppService, StoreError> {
        let key = record.key();
        let patch = convert::finalizer_patch(record);
        let stored = self
            .records(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(store_error)?;
        convert::record_from_dynamic(&stored)
    }

    async fn update_status(&self, record: &AppService) -> Result<AppService, StoreError> {
        let key = record.key();
        let patch = convert::status_patch(record)?;
        let stored = self
            .records(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(store_error)?;
        convert::record_from_dynamic(&stored)
    }

    async fn get(&self, kind: ResourceKind, key: &Key) -> Result<Option<ManagedResource>, StoreError> {
        match kind {
            ResourceKind::Workload => {
                let d = self.deployments(&key.namespace).get_opt(&key.name).await.map_err(store_error)?;
                d.as_ref().map(|d| convert::workload_from_deployment(d).map(ManagedResource::Workload)).transpose()
            }
            ResourceKind::Endpoint => {
                let s = self.services(&key.namespace).get_opt(&key.name).await.map_err(store_error)?;
                s.as_ref().map(|s| convert::endpoint_from_service(s).map(ManagedResource::Endpoint)).transpose()
            }
        }
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        let key = resource.key();
        let pp = PostParams::default();
        match resource {
            ManagedResource::Workload(w) => {
                let mut d = convert::deployment_from_workload(w);
                d.metadata.resource_version = None;
                let stored = self.deployments(&key.namespace).create(&pp, &d).await.map_err(store_error)?;
                convert::workload_from_deployment(&stored).map(ManagedResource::Workload)
            }
            ManagedResource::Endpoint(ep) => {
                let mut s = convert::service_from_endpoint(ep);
                s.metadata.resource_version = None;
                let stored = self.services(&key.namespace).create(&pp, &s).await.map_err(store_error)?;
                convert::endpoint_from_service(&stored).map(ManagedResource::Endpoint)
            }
        }
    }

    async fn replace(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        let key = resource.key();
        let pp = PostParams::default();
        match resource {
            ManagedResource::Workload(w) => {
                let api = self.deployments(&key.namespace);
                let mut live = api
                    .get_opt(&key.name)
                    .await
                    .map_err(store_error)?
                    .ok_or_else(|| gone(resource.kind(), key))?;
                let live_version = live.metadata.resource_version.clone();
                convert::overlay_deployment(&mut live, w);
                if live.metadata.resource_version.is_none() {
                    live.metadata.resource_version = live_version;
                }
                debug!(key = %key, replicas = w.replicas, "replacing deployment");
                let stored = api.replace(&key.name, &pp, &live).await.map_err(store_error)?;
                convert::workload_from_deployment(&stored).map(ManagedResource::Workload)
            }
            ManagedResource::Endpoint(ep) => {
                let api = self.services(&key.namespace);
                let mut live = api
                    .get_opt(&key.name)
                    .await
                    .map_err(store_error)?
                    .ok_or_else(|| gone(resource.kind(), key))?;
                let live_version = live.metadata.resource_version.clone();
                convert::overlay_service(&mut live, ep);
                if live.metadata.resource_version.is_none() {
                    live.metadata.resource_version = live_version;
                }
                let stored = api.replace(&key.name, &pp, &live).await.map_err(store_error)?;
                convert::endpoint_from_service(&stored).map(ManagedResource::Endpoint)
            }
        }
    }

    async fn scale(&self, key: &Key, replicas: i32, stamp: Option<&VersionStamp>) -> Result<ComputeWorkload, StoreError> {
        let patch = convert::scale_patch(replicas, stamp);
        debug!(key = %key, replicas, "scaling deployment");
        let stored = self
            .deployments(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| if is_not_found(&e) { gone(ResourceKind::Workload, key) } else { store_error(e) })?;
        convert::workload_from_deployment(&stored)
    }

    async fn delete(&self, kind: ResourceKind, key: &Key) -> Result<(), StoreError> {
        let dp = DeleteParams::background();
        let res = match kind {
            ResourceKind::Workload => self.deployments(&key.namespace).delete(&key.name, &dp).await.map(|_| ()),
            ResourceKind::Endpoint => self.services(&key.namespace).delete(&key.name, &dp).await.map(|_| ()),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(store_error(e)),
        }
    }
}
