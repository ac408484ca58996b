//! Cumulus store: per-kind resource stores, the reducer, and snapshot publishing.
//!
//! The reducer never fails. Every event has a defined transition; events
//! for identities the store does not know are no-ops.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use cumulus_core::{
    Event, Identity, KindId, KindRegistry, OpFlag, Operation, Payload, Record, ResourceKind, ScopeId,
    SyncError,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Mirror of one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStore {
    pub initialised: bool,
    pub fetching: bool,
    pub fetch_error: Option<SyncError>,
    pub creating: bool,
    /// `None` until the first successful list fetch.
    pub data: Option<FxHashMap<Identity, Record>>,
}

impl KindStore {
    pub fn get(&self, id: &Identity) -> Option<&Record> { self.data.as_ref()?.get(id) }
    pub fn contains(&self, id: &Identity) -> bool { self.get(id).is_some() }
    pub fn len(&self) -> usize { self.data.as_ref().map(|d| d.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Ids in sorted order, for stable output.
    pub fn ids(&self) -> Vec<&Identity> {
        let mut ids: Vec<&Identity> = self.data.iter().flat_map(|d| d.keys()).collect();
        ids.sort();
        ids
    }

    fn upsert(&mut self, id: Identity, data: Value, clear: Option<OpFlag>) -> bool {
        let Some(map) = self.data.as_mut() else {
            debug!(id = %id, "upsert before first list fetch; dropped");
            return false;
        };
        let mut rec = Record::carry_over(map.remove(&id), data);
        if let Some(flag) = clear { rec.flags.clear(flag); }
        map.insert(id, rec);
        true
    }

    fn remove(&mut self, id: &Identity) -> bool {
        self.data.as_mut().map(|d| d.remove(id).is_some()).unwrap_or(false)
    }

    fn mark(&mut self, id: &Identity, flag: OpFlag, set: bool) -> bool {
        let Some(rec) = self.data.as_mut().and_then(|d| d.get_mut(id)) else {
            trace!(id = %id, %flag, "flag change for unknown id ignored");
            return false;
        };
        if set { rec.flags.set(flag) } else { rec.flags.clear(flag) }
    }

    fn replace_all(&mut self, kind: &dyn ResourceKind, items: &[Value]) {
        let mut prev = self.data.take().unwrap_or_default();
        let mut next = FxHashMap::default();
        next.reserve(items.len());
        for raw in items {
            let data = kind.transform(raw.clone());
            match kind.identity(&data) {
                Some(id) => {
                    let rec = Record::carry_over(prev.remove(&id), data);
                    next.insert(id, rec);
                }
                None => warn!(kind = %kind.id(), "list item without identity skipped"),
            }
        }
        self.data = Some(next);
    }
}

/// Identity of a response payload, falling back to the request's target.
fn payload_identity(kind: &dyn ResourceKind, data: &Value, op: &Operation) -> Option<Identity> {
    kind.identity(data).or_else(|| op.target().cloned())
}

/// Apply one event to one kind's store. Returns whether anything changed.
pub fn reduce(store: &mut KindStore, kind: &dyn ResourceKind, event: &Event) -> bool {
    match event {
        Event::Requested(req) => match &req.op {
            Operation::FetchList => { store.fetching = true; true }
            Operation::FetchOne { .. } => false,
            Operation::Create { .. } => { store.creating = true; true }
            Operation::Update { id, .. } | Operation::Delete { id } | Operation::Auxiliary { id, .. } => {
                match req.op.flag() {
                    Some(flag) => store.mark(id, flag, true),
                    None => false,
                }
            }
        },
        Event::Succeeded { request, payload } => match (&request.op, payload) {
            (Operation::FetchList, payload) => {
                let items: &[Value] = match payload {
                    Payload::Many(items) => items,
                    other => {
                        warn!(kind = %kind.id(), payload = ?other, "list response was not a list; treating as empty");
                        &[]
                    }
                };
                store.replace_all(kind, items);
                store.initialised = true;
                store.fetching = false;
                store.fetch_error = None;
                metrics::gauge!("store_records", store.len() as f64, "kind" => kind.id().as_str());
                true
            }
            (Operation::Create { .. }, payload) => {
                store.creating = false;
                if let Some(raw) = payload.one() {
                    let data = kind.transform(raw.clone());
                    if let Some(id) = kind.identity(&data) {
                        store.upsert(id, data, None);
                    }
                }
                true
            }
            (Operation::Delete { id }, Payload::Nothing) => store.remove(id),
            (Operation::Auxiliary { id, topic }, payload) => {
                let Some(rec) = store.data.as_mut().and_then(|d| d.get_mut(id)) else { return false; };
                rec.flags.clear(OpFlag::Aux(*topic));
                let value = match payload {
                    Payload::One(v) => v.clone(),
                    Payload::Many(items) => Value::Array(items.clone()),
                    Payload::Nothing => Value::Null,
                };
                rec.set_extra(*topic, value);
                true
            }
            (op, Payload::One(raw)) => {
                let data = kind.transform(raw.clone());
                match payload_identity(kind, &data, op) {
                    Some(id) => store.upsert(id, data, op.flag()),
                    None => {
                        warn!(kind = %kind.id(), "response without identity ignored");
                        false
                    }
                }
            }
            (op, _) => match (op.target(), op.flag()) {
                (Some(id), Some(flag)) => store.mark(id, flag, false),
                _ => false,
            },
        },
        Event::Failed { request, error } => match &request.op {
            Operation::FetchList => {
                store.fetching = false;
                store.fetch_error = Some(error.clone());
                true
            }
            Operation::FetchOne { id } if error.is_not_found() => store.remove(id),
            Operation::FetchOne { .. } => false,
            Operation::Create { .. } => { store.creating = false; true }
            op => match (op.target(), op.flag()) {
                (Some(id), Some(flag)) => store.mark(id, flag, false),
                _ => false,
            },
        },
        Event::Marked { id, flag, set, .. } => store.mark(id, *flag, *set),
    }
}

/// Result of offering an event to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// Tagged with a scope that is not current for the kind.
    StaleScope,
    UnknownKind,
}

/// All kinds' stores for the current scope.
///
/// Owns the stores exclusively: everything else reads snapshots.
pub struct Mirror {
    registry: KindRegistry,
    current: Option<ScopeId>,
    stores: FxHashMap<KindId, KindStore>,
    epoch: u64,
}

impl Mirror {
    pub fn new(registry: KindRegistry) -> Self {
        let stores = registry.ids().iter().map(|k| (*k, KindStore::default())).collect();
        Self { registry, current: None, stores, epoch: 0 }
    }

    pub fn registry(&self) -> &KindRegistry { &self.registry }
    pub fn current(&self) -> Option<&ScopeId> { self.current.as_ref() }
    pub fn epoch(&self) -> u64 { self.epoch }

    /// Scope a kind's events must carry right now.
    pub fn scope_for(&self, kind: KindId) -> Option<ScopeId> {
        let level = self.registry.get(kind)?.level();
        self.current.as_ref()?.for_level(level)
    }

    pub fn is_current(&self, kind: KindId, scope: &ScopeId) -> bool {
        self.scope_for(kind).as_ref() == Some(scope)
    }

    /// Make `next` current. Stores whose level-scope changes are discarded and
    /// replaced with fresh ones; the rest are kept.
    pub fn enter(&mut self, next: Option<ScopeId>) {
        let mut reset = 0usize;
        for kind in self.registry.iter() {
            let level = kind.level();
            let before = self.current.as_ref().and_then(|s| s.for_level(level));
            let after = next.as_ref().and_then(|s| s.for_level(level));
            if before != after {
                self.stores.insert(kind.id(), KindStore::default());
                reset += 1;
            }
        }
        debug!(reset, scope = ?next.as_ref().map(|s| s.to_string()), "mirror scope entered");
        self.current = next;
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Reduce an event into its kind's store unless its scope is stale.
    pub fn apply(&mut self, event: &Event) -> Applied {
        let kind_id = event.kind();
        let Some(kind) = self.registry.get(kind_id).cloned() else { return Applied::UnknownKind; };
        if !self.is_current(kind_id, event.scope()) {
            metrics::counter!("store_stale_events_total", 1u64, "kind" => kind_id.as_str());
            debug!(kind = %kind_id, event = %event.label(), scope = %event.scope(), "event for stale scope ignored");
            return Applied::StaleScope;
        }
        let store = self.stores.entry(kind_id).or_default();
        if reduce(store, kind.as_ref(), event) {
            self.epoch = self.epoch.saturating_add(1);
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    pub fn store(&self, kind: KindId) -> Option<&KindStore> { self.stores.get(&kind) }

    pub fn record(&self, kind: KindId, id: &Identity) -> Option<&Record> { self.stores.get(&kind)?.get(id) }

    pub fn snapshot(&self) -> MirrorSnapshot {
        MirrorSnapshot { epoch: self.epoch, scope: self.current.clone(), kinds: self.stores.clone() }
    }
}

/// Immutable copy of the mirror handed to readers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorSnapshot {
    pub epoch: u64,
    pub scope: Option<ScopeId>,
    pub kinds: FxHashMap<KindId, KindStore>,
}

impl MirrorSnapshot {
    pub fn kind(&self, kind: KindId) -> Option<&KindStore> { self.kinds.get(&kind) }
}

/// Writer side: swaps snapshots in and bumps the epoch channel.
pub struct SnapshotPublisher {
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    last: Option<u64>,
}

impl SnapshotPublisher {
    pub fn new() -> (Self, MirrorHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(MirrorSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let handle = MirrorHandle { snap: Arc::clone(&snap), epoch_rx };
        (Self { snap, epoch_tx, last: None }, handle)
    }

    /// Publish if the mirror changed since the last call.
    pub fn publish(&mut self, mirror: &Mirror) -> bool {
        if self.last == Some(mirror.epoch()) { return false; }
        self.last = Some(mirror.epoch());
        self.snap.store(Arc::new(mirror.snapshot()));
        let _ = self.epoch_tx.send(mirror.epoch());
        true
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct MirrorHandle {
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl MirrorHandle {
    pub fn current(&self) -> Arc<MirrorSnapshot> { self.snap.load_full() }
    pub fn kind(&self, kind: KindId) -> Option<KindStore> { self.snap.load().kind(kind).cloned() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::{Request, SessionId};
    use serde_json::json;

    struct Quota;
    impl ResourceKind for Quota {
        fn id(&self) -> KindId { KindId("quota") }
        fn identity(&self, record: &Value) -> Option<Identity> { cumulus_core::field_identity(record, "resource") }
    }

    fn scope() -> ScopeId { ScopeId::session(SessionId::new()).with_project("p", 1) }

    #[test]
    fn custom_identity_projection_is_used() {
        let s = scope();
        let mut store = KindStore::default();
        let req = Request::new(KindId("quota"), s, Operation::FetchList);
        let items = vec![json!({"resource": "cpus", "used": 2}), json!({"resource": "ram", "used": 4})];
        assert!(reduce(&mut store, &Quota, &Event::Succeeded { request: req, payload: Payload::Many(items) }));
        assert!(store.contains(&"cpus".into()));
        assert!(store.contains(&"ram".into()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn non_list_payload_for_list_success_yields_empty_initialised_store() {
        let mut store = KindStore::default();
        let req = Request::new(KindId("quota"), scope(), Operation::FetchList);
        reduce(&mut store, &Quota, &Event::Succeeded { request: req, payload: Payload::Nothing });
        assert!(store.initialised);
        assert_eq!(store.data.as_ref().map(|d| d.len()), Some(0));
    }

    #[test]
    fn upsert_before_first_list_keeps_data_unset() {
        let mut store = KindStore::default();
        let req = Request::new(KindId("quota"), scope(), Operation::FetchOne { id: "cpus".into() });
        let changed = reduce(&mut store, &Quota, &Event::Succeeded { request: req, payload: Payload::One(json!({"resource": "cpus"})) });
        assert!(!changed);
        assert!(store.data.is_none());
    }

    #[test]
    fn publisher_skips_unchanged_epochs() {
        let registry = KindRegistry::new().with(Quota);
        let mut mirror = Mirror::new(registry);
        let (mut publisher, handle) = SnapshotPublisher::new();
        assert!(publisher.publish(&mirror));
        assert!(!publisher.publish(&mirror));
        mirror.enter(Some(scope()));
        assert!(publisher.publish(&mirror));
        assert_eq!(*handle.subscribe_epoch().borrow(), mirror.epoch());
        assert!(handle.current().scope.is_some());
    }
}
