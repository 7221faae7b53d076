//! Typed access to the control-plane store.
//!
//! Implementations must treat "not found" as `Ok(None)` on reads and as success on deletes, and
//! must reject writes whose version stamp is stale with [`StoreError::Conflict`].

use async_trait::async_trait;

use crate::{AppService, ComputeWorkload, Key, ManagedResource, ResourceKind, StoreError, VersionStamp};

#[async_trait]
pub trait Accessor: Send + Sync {
    async fn get_record(&self, key: &Key) -> Result<Option<AppService>, StoreError>;

    /// Persist metadata/spec of a record (finalizers). Status is left as stored.
    async fn update_record(&self, record: &AppService) -> Result<AppService, StoreError>;

    /// Persist only the status of a record.
    async fn update_status(&self, record: &AppService) -> Result<AppService, StoreError>;

    async fn get(&self, kind: ResourceKind, key: &Key) -> Result<Option<ManagedResource>, StoreError>;

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError>;

    /// Replace an existing resource. A stamped resource is rejected if the stored stamp differs.
    async fn replace(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError>;

    /// Set only the replica count of a workload, leaving its template and selector as stored.
    /// A `stamp` that no longer matches the stored workload is a conflict.
    async fn scale(&self, key: &Key, replicas: i32, stamp: Option<&VersionStamp>) -> Result<ComputeWorkload, StoreError>;

    /// Idempotent: deleting an absent resource succeeds.
    async fn delete(&self, kind: ResourceKind, key: &Key) -> Result<(), StoreError>;

    /// Read-modify-write: create when absent, otherwise carry the stored version stamp onto
    /// `resource` and replace. A writer that lands between the read and the replace surfaces
    /// as a conflict.
    async fn create_or_update(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        match self.get(resource.kind(), resource.key()).await? {
            None => self.create(resource).await,
            Some(existing) => {
                let mut next = resource.clone();
                next.set_version_stamp(existing.version_stamp().cloned());
                self.replace(&next).await
            }
        }
    }
}
