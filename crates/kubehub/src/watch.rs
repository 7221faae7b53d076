//! List+watch streams that turn cluster events into reconcile triggers.
//!
//! Status writes bump a record's resourceVersion on every pass, so record events only
//! trigger when generation, deletion state or finalizers change.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use futures::TryStreamExt;
use keel_core::{Key, ResourceKind, Trigger, TriggerReason, KIND};
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::ObjectMeta, NamespaceResourceScope};
use kube::{
    api::{Api, DynamicObject, ListParams},
    runtime::{watcher, watcher::Event},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{convert, KindRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    generation: Option<i64>,
    deleting: bool,
    finalizers: Vec<String>,
}

impl Fingerprint {
    fn of(meta: &ObjectMeta) -> Self {
        Self {
            generation: meta.generation,
            deleting: meta.deletion_timestamp.is_some(),
            finalizers: meta.finalizers.clone().unwrap_or_default(),
        }
    }
}

/// Remembers the last fingerprint seen per record and drops status-only updates.
#[derive(Default)]
pub struct RecordFilter {
    seen: HashMap<Key, Fingerprint>,
}

impl RecordFilter {
    fn key_of(meta: &ObjectMeta) -> Option<Key> {
        Some(Key::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone()?))
    }

    /// Trigger for an applied record, or `None` when nothing the engine acts on changed.
    pub fn applied(&mut self, meta: &ObjectMeta) -> Option<Trigger> {
        let key = Self::key_of(meta)?;
        let fp = Fingerprint::of(meta);
        if self.seen.get(&key) == Some(&fp) {
            return None;
        }
        self.seen.insert(key.clone(), fp);
        Some(Trigger::new(key, TriggerReason::RecordChanged))
    }

    pub fn deleted(&mut self, meta: &ObjectMeta) -> Option<Trigger> {
        let key = Self::key_of(meta)?;
        self.seen.remove(&key);
        Some(Trigger::new(key, TriggerReason::RecordDeleted))
    }

    /// A relist: forget everything and resync every listed record.
    pub fn restarted<'a>(&mut self, metas: impl IntoIterator<Item = &'a ObjectMeta>) -> Vec<Trigger> {
        self.seen.clear();
        metas
            .into_iter()
            .filter_map(|m| {
                let key = Self::key_of(m)?;
                self.seen.insert(key.clone(), Fingerprint::of(m));
                Some(Trigger::new(key, TriggerReason::Resync))
            })
            .collect()
    }
}

/// Key of the AppService controlling a dependent, if any.
pub fn owner_key(meta: &ObjectMeta, registry: &KindRegistry) -> Option<Key> {
    let link = convert::controller_link(meta)?;
    if link.kind != KIND || link.api_version != registry.record().api_version {
        return None;
    }
    Some(Key::new(meta.namespace.clone().unwrap_or_default(), link.name))
}

fn records_api(client: Client, registry: &KindRegistry, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, registry.record()),
        None => Api::all_with(client, registry.record()),
    }
}

async fn send(tx: &mpsc::Sender<Trigger>, t: Trigger) -> bool {
    tx.send(t).await.is_ok()
}

/// Watch AppService records and post a trigger for their own key.
pub async fn watch_records(
    client: Client,
    registry: &KindRegistry,
    namespace: Option<&str>,
    tx: mpsc::Sender<Trigger>,
) -> Result<()> {
    let api = records_api(client, registry, namespace);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = KIND, ns = ?namespace, "record watcher started");
    let mut filter = RecordFilter::default();
    while let Some(ev) = stream.try_next().await? {
        let triggers: Vec<Trigger> = match ev {
            Event::Applied(o) => filter.applied(&o.metadata).into_iter().collect(),
            Event::Deleted(o) => filter.deleted(&o.metadata).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(count = list.len(), "record watch restart");
                filter.restarted(list.iter().map(|o| &o.metadata))
            }
        };
        for t in triggers {
            if !send(&tx, t).await {
                warn!("trigger channel closed; record watcher exiting");
                return Ok(());
            }
        }
    }
    warn!("record watcher stream ended");
    Ok(())
}

/// Watch a dependent kind and post a trigger for the owning record's key.
pub async fn watch_dependents<K>(
    client: Client,
    registry: &KindRegistry,
    namespace: Option<&str>,
    kind: ResourceKind,
    tx: mpsc::Sender<Trigger>,
) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "dependent watcher started");
    while let Some(ev) = stream.try_next().await? {
        let objs = match ev {
            Event::Applied(o) | Event::Deleted(o) => vec![o],
            Event::Restarted(list) => list,
        };
        for o in objs {
            let Some(key) = owner_key(o.meta(), registry) else { continue };
            if !send(&tx, Trigger::new(key, TriggerReason::DependentChanged(kind))).await {
                warn!(kind = %kind, "trigger channel closed; dependent watcher exiting");
                return Ok(());
            }
        }
    }
    warn!(kind = %kind, "dependent watcher stream ended");
    Ok(())
}

/// Periodically list every record and post a resync trigger for each.
pub async fn resync_records(
    client: Client,
    registry: &KindRegistry,
    namespace: Option<&str>,
    every: Duration,
    tx: mpsc::Sender<Trigger>,
) -> Result<()> {
    let api = records_api(client, registry, namespace);
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        let list = match api.list(&ListParams::default()).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "resync list failed");
                continue;
            }
        };
        debug!(count = list.items.len(), "resync sweep");
        for o in list.items {
            let Some(name) = o.metadata.name.clone() else { continue };
            let key = Key::new(o.metadata.namespace.clone().unwrap_or_default(), name);
            if !send(&tx, Trigger::new(key, TriggerReason::Resync)).await {
                return Ok(());
            }
        }
    }
}
