//! Keel store: an in-memory control plane that honours the [`Accessor`] contract, plus the
//! per-key trigger queue the runner consumes.
//!
//! `MemStore` behaves like the API server the engine talks to in production: every write bumps
//! a version stamp, stale stamps are rejected as conflicts, deletes are idempotent, and when a
//! record is physically removed its owned resources are garbage collected. It also exposes
//! knobs for simulation (observed replicas, deletion requests, injected faults, latency).

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{
    Accessor, AppService, ComputeWorkload, Key, ManagedResource, ResourceKind, StoreError, VersionStamp,
};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod queue;

pub use queue::TriggerQueue;

/// Store call, used to target injected faults and to label the write journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetRecord,
    UpdateRecord,
    UpdateStatus,
    Get,
    Create,
    Replace,
    Scale,
    Delete,
}

/// One successful mutation, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: Op,
    pub kind: Option<ResourceKind>,
    pub key: Key,
}

#[derive(Default)]
struct State {
    next_version: u64,
    records: FxHashMap<Key, AppService>,
    resources: FxHashMap<(ResourceKind, Key), ManagedResource>,
    faults: VecDeque<(Op, StoreError)>,
    journal: Vec<JournalEntry>,
}

impl State {
    fn stamp(&mut self) -> VersionStamp {
        self.next_version += 1;
        VersionStamp(self.next_version.to_string())
    }

    fn take_fault(&mut self, op: Op) -> Result<(), StoreError> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn log(&mut self, op: Op, kind: Option<ResourceKind>, key: &Key) {
        self.journal.push(JournalEntry { op, kind, key: key.clone() });
    }

    fn check_record_stamp(&self, incoming: &AppService) -> Result<&AppService, StoreError> {
        let key = incoming.key();
        let stored = self
            .records
            .get(key)
            .ok_or_else(|| StoreError::Conflict(format!("record {} no longer exists", key)))?;
        match &incoming.meta.version_stamp {
            Some(v) if Some(v) != stored.meta.version_stamp.as_ref() => Err(StoreError::Conflict(format!(
                "record {} changed (stamp {} is stale)",
                key, v
            ))),
            _ => Ok(stored),
        }
    }

    /// Physically remove a record whose deletion was requested and whose finalizers are gone,
    /// then collect everything it owns.
    fn purge_if_released(&mut self, key: &Key) {
        let released = self
            .records
            .get(key)
            .map(|r| r.meta.deletion_requested && r.meta.finalizers.is_empty())
            .unwrap_or(false);
        if !released {
            return;
        }
        let Some(rec) = self.records.remove(key) else { return };
        let uid = rec.meta.uid.as_deref();
        let before = self.resources.len();
        self.resources.retain(|(_, k), res| {
            let owned = k.namespace == key.namespace
                && res.envelope().owner.as_ref().map(|o| o.points_at(key, uid)).unwrap_or(false);
            !owned
        });
        info!(key = %key, collected = before - self.resources.len(), "record removed; owned resources collected");
    }
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accessor call sleeps this long before touching state.
    pub fn with_latency(latency: Duration) -> Self {
        Self { state: Mutex::new(State::default()), latency: Some(latency) }
    }

    async fn delay(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    /// Seed a record as a user would create it; assigns uid and version stamp.
    pub async fn insert_record(&self, mut record: AppService) -> AppService {
        let mut st = self.state.lock().await;
        record.meta.uid.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        record.meta.version_stamp = Some(st.stamp());
        st.records.insert(record.key().clone(), record.clone());
        record
    }

    /// Edit a record's spec the way its owner would. Returns false when absent.
    pub async fn edit_record<F>(&self, key: &Key, edit: F) -> bool
    where
        F: FnOnce(&mut AppService),
    {
        let mut st = self.state.lock().await;
        let stamp = st.stamp();
        match st.records.get_mut(key) {
            Some(rec) => {
                edit(rec);
                rec.meta.version_stamp = Some(stamp);
                true
            }
            None => false,
        }
    }

    /// Mark a record for deletion. Without finalizers it disappears immediately.
    pub async fn request_deletion(&self, key: &Key) -> bool {
        let mut st = self.state.lock().await;
        let stamp = st.stamp();
        let Some(rec) = st.records.get_mut(key) else { return false };
        rec.meta.deletion_requested = true;
        rec.meta.version_stamp = Some(stamp);
        st.purge_if_released(key);
        true
    }

    /// Report observed available replicas on a workload, as its controller would.
    pub async fn set_available(&self, key: &Key, available: i32) -> bool {
        let mut st = self.state.lock().await;
        let stamp = st.stamp();
        match st.resources.get_mut(&(ResourceKind::Workload, key.clone())) {
            Some(ManagedResource::Workload(w)) => {
                w.available_replicas = available;
                w.envelope.version_stamp = Some(stamp);
                true
            }
            _ => false,
        }
    }

    /// Queue a failure for the next call of `op`.
    pub async fn inject(&self, op: Op, err: StoreError) {
        self.state.lock().await.faults.push_back((op, err));
    }

    pub async fn record(&self, key: &Key) -> Option<AppService> {
        self.state.lock().await.records.get(key).cloned()
    }

    pub async fn resource(&self, kind: ResourceKind, key: &Key) -> Option<ManagedResource> {
        self.state.lock().await.resources.get(&(kind, key.clone())).cloned()
    }

    pub async fn resource_count(&self) -> usize {
        self.state.lock().await.resources.len()
    }

    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.state.lock().await.journal.clear();
    }
}

#[async_trait]
impl Accessor for MemStore {
    async fn get_record(&self, key: &Key) -> Result<Option<AppService>, StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::GetRecord)?;
        Ok(st.records.get(key).cloned())
    }

    async fn update_record(&self, record: &AppService) -> Result<AppService, StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::UpdateRecord)?;
        let stored = st.check_record_stamp(record)?;
        let mut next = stored.clone();
        next.meta.finalizers = record.meta.finalizers.clone();
        next.spec = record.spec.clone();
        next.meta.version_stamp = Some(st.stamp());
        let key = next.key().clone();
        debug!(key = %key, stamp = ?next.meta.version_stamp, "record updated");
        st.records.insert(key.clone(), next.clone());
        st.log(Op::UpdateRecord, None, &key);
        st.purge_if_released(&key);
        Ok(next)
    }

    async fn update_status(&self, record: &AppService) -> Result<AppService, StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::UpdateStatus)?;
        let stored = st.check_record_stamp(record)?;
        let mut next = stored.clone();
        next.status = record.status.clone();
        next.meta.version_stamp = Some(st.stamp());
        let key = next.key().clone();
        st.records.insert(key.clone(), next.clone());
        st.log(Op::UpdateStatus, None, &key);
        Ok(next)
    }

    async fn get(&self, kind: ResourceKind, key: &Key) -> Result<Option<ManagedResource>, StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::Get)?;
        Ok(st.resources.get(&(kind, key.clone())).cloned())
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::Create)?;
        let slot = (resource.kind(), resource.key().clone());
        if st.resources.contains_key(&slot) {
            return Err(StoreError::Conflict(format!("{} {} already exists", slot.0, slot.1)));
        }
        let mut next = resource.clone();
        next.set_version_stamp(Some(st.stamp()));
        if let ManagedResource::Workload(w) = &mut next {
            w.available_replicas = 0;
        }
        st.log(Op::Create, Some(slot.0), &slot.1);
        st.resources.insert(slot, next.clone());
        Ok(next)
    }

    async fn replace(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::Replace)?;
        let slot = (resource.kind(), resource.key().clone());
        let stored = st
            .resources
            .get(&slot)
            .ok_or_else(|| StoreError::Transient(format!("{} {} was deleted mid-pass", slot.0, slot.1)))?;
        if let Some(v) = resource.version_stamp() {
            if Some(v) != stored.version_stamp() {
                return Err(StoreError::Conflict(format!("{} {} changed (stamp {} is stale)", slot.0, slot.1, v)));
            }
        }
        let observed = match stored {
            ManagedResource::Workload(w) => w.available_replicas,
            ManagedResource::Endpoint(_) => 0,
        };
        let mut next = resource.clone();
        next.set_version_stamp(Some(st.stamp()));
        if let ManagedResource::Workload(w) = &mut next {
            w.available_replicas = observed;
        }
        st.log(Op::Replace, Some(slot.0), &slot.1);
        st.resources.insert(slot, next.clone());
        Ok(next)
    }

    async fn scale(&self, key: &Key, replicas: i32, stamp: Option<&VersionStamp>) -> Result<ComputeWorkload, StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::Scale)?;
        let next_stamp = st.stamp();
        let w = match st.resources.get_mut(&(ResourceKind::Workload, key.clone())) {
            Some(ManagedResource::Workload(w)) => w,
            _ => return Err(StoreError::Transient(format!("workload {} was deleted mid-pass", key))),
        };
        if let Some(v) = stamp {
            if Some(v) != w.envelope.version_stamp.as_ref() {
                return Err(StoreError::Conflict(format!("workload {} changed (stamp {} is stale)", key, v)));
            }
        }
        w.replicas = replicas;
        w.envelope.version_stamp = Some(next_stamp);
        let scaled = w.clone();
        st.log(Op::Scale, Some(ResourceKind::Workload), key);
        Ok(scaled)
    }

    async fn delete(&self, kind: ResourceKind, key: &Key) -> Result<(), StoreError> {
        self.delay().await;
        let mut st = self.state.lock().await;
        st.take_fault(Op::Delete)?;
        if st.resources.remove(&(kind, key.clone())).is_some() {
            st.log(Op::Delete, Some(kind), key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{
        AppServiceSpec, ComputeWorkload, Container, Envelope, Labels, NetworkEndpoint, OwnerLink,
    };

    fn record(name: &str) -> AppService {
        AppService::new(
            Key::new("ns", name),
            AppServiceSpec { replicas: 1, image: "x:1".into(), port: 80, ..Default::default() },
        )
    }

    fn workload(owner: &AppService, replicas: i32) -> ManagedResource {
        ManagedResource::Workload(ComputeWorkload {
            envelope: Envelope {
                key: owner.key().clone(),
                labels: Labels::new(),
                owner: Some(OwnerLink::for_record(owner)),
                version_stamp: None,
            },
            replicas,
            selector: Labels::new(),
            container: Container { name: "c".into(), image: "x:1".into(), port: 80, env: vec![], resources: None },
            available_replicas: 0,
        })
    }

    fn endpoint(owner: &AppService) -> ManagedResource {
        ManagedResource::Endpoint(NetworkEndpoint {
            envelope: Envelope {
                key: owner.key().clone(),
                labels: Labels::new(),
                owner: Some(OwnerLink::for_record(owner)),
                version_stamp: None,
            },
            selector: Labels::new(),
            port: 80,
            target_port: 80,
        })
    }

    #[tokio::test]
    async fn missing_objects_read_as_none() {
        let s = MemStore::new();
        let k = Key::new("ns", "nope");
        assert_eq!(s.get_record(&k).await.unwrap(), None);
        assert_eq!(s.get(ResourceKind::Workload, &k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_stamp_is_a_conflict() {
        let s = MemStore::new();
        let rec = s.insert_record(record("a")).await;
        let created = s.create(&workload(&rec, 1)).await.unwrap();
        let mut first = created.clone();
        if let ManagedResource::Workload(w) = &mut first {
            w.replicas = 2;
        }
        s.replace(&first).await.unwrap();
        let err = s.replace(&created).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
    }

    #[tokio::test]
    async fn create_or_update_carries_the_stored_stamp() {
        let s = MemStore::new();
        let rec = s.insert_record(record("a")).await;
        s.create_or_update(&workload(&rec, 1)).await.unwrap();
        s.set_available(rec.key(), 1).await;
        let updated = s.create_or_update(&workload(&rec, 4)).await.unwrap();
        let w = updated.into_workload().unwrap();
        assert_eq!(w.replicas, 4);
        assert_eq!(w.available_replicas, 1, "observed status survives a replace");
        let ops: Vec<_> = s.journal().await.into_iter().map(|w| w.op).collect();
        assert_eq!(ops, vec![Op::Create, Op::Replace]);
    }

    #[tokio::test]
    async fn scale_changes_only_replicas() {
        let s = MemStore::new();
        let rec = s.insert_record(record("a")).await;
        let created = s.create(&workload(&rec, 1)).await.unwrap().into_workload().unwrap();
        s.set_available(rec.key(), 1).await;
        let current = s.resource(ResourceKind::Workload, rec.key()).await.unwrap().into_workload().unwrap();

        let scaled = s.scale(rec.key(), 3, current.envelope.version_stamp.as_ref()).await.unwrap();
        assert_eq!(scaled.replicas, 3);
        assert_eq!(scaled.container, created.container);
        assert_eq!(scaled.available_replicas, 1);

        let err = s.scale(rec.key(), 5, current.envelope.version_stamp.as_ref()).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
        let err = s.scale(&Key::new("ns", "gone"), 2, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)), "{err}");
        let ops: Vec<_> = s.journal().await.into_iter().map(|w| w.op).collect();
        assert_eq!(ops, vec![Op::Create, Op::Scale]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let s = MemStore::new();
        let rec = s.insert_record(record("a")).await;
        s.create(&endpoint(&rec)).await.unwrap();
        s.delete(ResourceKind::Endpoint, rec.key()).await.unwrap();
        s.delete(ResourceKind::Endpoint, rec.key()).await.unwrap();
        assert_eq!(s.journal().await.len(), 2);
    }

    #[tokio::test]
    async fn status_write_does_not_touch_finalizers_and_vice_versa() {
        let s = MemStore::new();
        let rec = s.insert_record(record("a")).await;
        let mut with_fin = rec.clone();
        with_fin.meta.add_finalizer("f");
        with_fin.status.available_replicas = 9;
        let after = s.update_record(&with_fin).await.unwrap();
        assert_eq!(after.meta.finalizers, vec!["f".to_string()]);
        assert_eq!(after.status.available_replicas, 0);

        let mut st = after.clone();
        st.meta.finalizers.clear();
        st.status.available_replicas = 2;
        let after = s.update_status(&st).await.unwrap();
        assert_eq!(after.meta.finalizers, vec!["f".to_string()]);
        assert_eq!(after.status.available_replicas, 2);
    }

    #[tokio::test]
    async fn releasing_the_last_finalizer_collects_owned_resources() {
        let s = MemStore::new();
        let mut rec = record("a");
        rec.meta.add_finalizer("f");
        let rec = s.insert_record(rec).await;
        s.create(&workload(&rec, 1)).await.unwrap();
        s.create(&endpoint(&rec)).await.unwrap();
        let other = s.insert_record(record("b")).await;
        s.create(&endpoint(&other)).await.unwrap();

        assert!(s.request_deletion(rec.key()).await);
        assert!(s.record(rec.key()).await.is_some(), "finalizer blocks removal");

        let mut latest = s.record(rec.key()).await.unwrap();
        latest.meta.remove_finalizer("f");
        s.update_record(&latest).await.unwrap();
        assert!(s.record(rec.key()).await.is_none());
        assert_eq!(s.resource_count().await, 1);
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let s = MemStore::new();
        s.inject(Op::GetRecord, StoreError::Transient("down".into())).await;
        let k = Key::new("ns", "a");
        assert_eq!(s.get_record(&k).await, Err(StoreError::Transient("down".into())));
        assert_eq!(s.get_record(&k).await, Ok(None));
    }
}
