//! Keel kubehub: the Kubernetes side of the engine.
//!
//! - [`KindRegistry`]: the record's API resource, built once at start and passed in.
//! - [`KubeAccessor`]: the [`keel_core::Accessor`] contract over kube-rs.
//! - [`watch`]: list+watch streams that post `(Key, reason)` triggers.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::info;

mod accessor;
pub mod convert;
pub mod watch;

pub use accessor::KubeAccessor;

pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// Explicit type registry for the kinds the engine reads and writes dynamically.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    record: ApiResource,
}

impl KindRegistry {
    pub fn new(record: ApiResource) -> Self {
        Self { record }
    }

    /// The built-in `example.com/v1alpha1 AppService` mapping, without asking the cluster.
    pub fn standard() -> Self {
        let gvk = GroupVersionKind::gvk(keel_core::GROUP, keel_core::VERSION, keel_core::KIND);
        Self::new(ApiResource::from_gvk_with_plural(&gvk, keel_core::PLURAL))
    }

    /// Resolve the record kind through discovery; fails when the CRD is not served
    /// or is not namespaced.
    pub async fn discover(client: Client) -> Result<Self> {
        let gvk = GroupVersionKind::gvk(keel_core::GROUP, keel_core::VERSION, keel_core::KIND);
        let discovery = Discovery::new(client).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    if !matches!(caps.scope, Scope::Namespaced) {
                        return Err(anyhow!("{}/{}/{} is not namespaced", gvk.group, gvk.version, gvk.kind));
                    }
                    info!(plural = %ar.plural, "record kind resolved via discovery");
                    return Ok(Self::new(ar));
                }
            }
        }
        Err(anyhow!("GVK not found: {}/{}/{} (is the CRD installed?)", gvk.group, gvk.version, gvk.kind))
    }

    pub fn record(&self) -> &ApiResource {
        &self.record
    }
}
