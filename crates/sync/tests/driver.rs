use std::sync::Arc;
use std::time::Duration;

use cumulus_api::{DeleteMode, KindConfig, MemoryBackend};
use cumulus_core::{Family, KindId, KindRegistry, ResourceKind, SyncError};
use cumulus_sync::{spawn_engine, EffectTable, EngineError, EngineHandle, Reaction, ScopeError, SyncConfig, Trigger};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;

const MACHINE: KindId = KindId("machine");
const VOLUME: KindId = KindId("volume");
const CLUSTER: KindId = KindId("cluster");
const QUOTA: KindId = KindId("quota");

struct Kind {
    id: KindId,
    active: &'static [&'static str],
}

impl ResourceKind for Kind {
    fn id(&self) -> KindId { self.id }
    fn is_active(&self, r: &Value) -> bool {
        r.get("status").and_then(Value::as_str).map(|s| self.active.iter().any(|a| *a == s)).unwrap_or(false)
    }
}

fn registry() -> KindRegistry {
    KindRegistry::new()
        .with(Kind { id: MACHINE, active: &["BUILD"] })
        .with(Kind { id: VOLUME, active: &[] })
        .with(Kind { id: CLUSTER, active: &["CONFIGURING", "DELETING"] })
        .with(Kind { id: QUOTA, active: &[] })
}

fn effects() -> EffectTable {
    EffectTable::new().on(VOLUME, Trigger::Succeeded(Family::Create), Reaction::RefreshList(QUOTA))
}

async fn start(backend: &Arc<MemoryBackend>) -> (EngineHandle, JoinHandle<()>) {
    let (h, join) = spawn_engine(registry(), effects(), backend.clone(), SyncConfig::default());
    h.begin_session().await.unwrap();
    h.select_project("p1").await.unwrap();
    (h, join)
}

/// Let every ready task run, then advance the paused clock by `d`.
async fn idle(d: Duration) {
    tokio::time::sleep(d).await;
}

fn status(h: &EngineHandle, kind: KindId, id: &str) -> Option<String> {
    let store = h.snapshot(kind)?;
    let rec = store.get(&id.into())?;
    rec.data["status"].as_str().map(str::to_string)
}

#[tokio::test(start_paused = true)]
async fn list_sweeps_active_records_and_refreshes_periodically() {
    let be = Arc::new(MemoryBackend::new());
    be.seed(MACHINE, "m1", json!({"id": "m1", "status": "BUILD"}));
    be.script(MACHINE, "m1", vec![json!({"status": "ACTIVE"})]);
    let (h, _join) = start(&be).await;

    h.fetch_list(MACHINE).await.unwrap();
    idle(Duration::from_millis(1)).await;
    assert_eq!(be.calls_to(MACHINE, "list"), 1);
    assert_eq!(be.calls_to(MACHINE, "get"), 1, "active record fetched right away");
    assert_eq!(status(&h, MACHINE, "m1").as_deref(), Some("ACTIVE"));

    idle(Duration::from_secs(121)).await;
    assert_eq!(be.calls_to(MACHINE, "list"), 2);
    assert_eq!(be.calls_to(MACHINE, "get"), 1);
}

#[tokio::test(start_paused = true)]
async fn settle_polling_runs_until_the_record_is_terminal() {
    let be = Arc::new(MemoryBackend::new());
    be.configure(CLUSTER, KindConfig {
        create_steps: vec![json!({"status": "CONFIGURING"}), json!({"status": "CONFIGURING"}), json!({"status": "READY"})],
        ..Default::default()
    });
    let (h, _join) = start(&be).await;
    h.fetch_list(CLUSTER).await.unwrap();
    idle(Duration::from_millis(1)).await;

    h.create(CLUSTER, json!({"name": "k8s"})).await.unwrap();
    idle(Duration::from_millis(1)).await;
    assert_eq!(status(&h, CLUSTER, "cluster-1").as_deref(), Some("CONFIGURING"));
    assert!(!h.snapshot(CLUSTER).unwrap().creating);
    assert_eq!(be.calls_to(CLUSTER, "get"), 0);

    idle(Duration::from_secs(60)).await;
    assert_eq!(be.calls_to(CLUSTER, "get"), 2);
    assert_eq!(status(&h, CLUSTER, "cluster-1").as_deref(), Some("READY"));
}

#[tokio::test(start_paused = true)]
async fn soft_delete_is_confirmed_then_pruned_quietly() {
    let be = Arc::new(MemoryBackend::new());
    be.configure(CLUSTER, KindConfig { delete: DeleteMode::Soft { status: "DELETING", linger: 1 }, ..Default::default() });
    be.seed(CLUSTER, "c1", json!({"id": "c1", "status": "READY"}));
    let (h, _join) = start(&be).await;
    let mut notices = h.notices();
    h.fetch_list(CLUSTER).await.unwrap();
    idle(Duration::from_millis(1)).await;

    h.delete(CLUSTER, "c1").await.unwrap();
    idle(Duration::from_millis(1)).await;
    let store = h.snapshot(CLUSTER).unwrap();
    let rec = store.get(&"c1".into()).expect("still present while deleting");
    assert!(!rec.deleting());
    assert_eq!(rec.data["status"], "DELETING");
    assert_eq!(be.calls_to(CLUSTER, "get"), 1, "delete confirmation fetched immediately");

    idle(Duration::from_secs(10)).await;
    assert!(!h.snapshot(CLUSTER).unwrap().contains(&"c1".into()));
    assert_eq!(be.calls_to(CLUSTER, "get"), 2);
    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn hard_delete_removes_the_record() {
    let be = Arc::new(MemoryBackend::new());
    be.seed(VOLUME, "v1", json!({"id": "v1", "size": 10}));
    let (h, _join) = start(&be).await;
    h.fetch_list(VOLUME).await.unwrap();
    idle(Duration::from_millis(1)).await;
    assert!(h.snapshot(VOLUME).unwrap().contains(&"v1".into()));

    h.delete(VOLUME, "v1").await.unwrap();
    idle(Duration::from_millis(1)).await;
    assert!(!h.snapshot(VOLUME).unwrap().contains(&"v1".into()));
    assert_eq!(be.calls_to(VOLUME, "get"), 0);
}

#[tokio::test(start_paused = true)]
async fn project_switch_stops_polling_the_old_scope() {
    let be = Arc::new(MemoryBackend::new());
    be.seed(MACHINE, "m1", json!({"id": "m1", "status": "BUILD"}));
    let (h, _join) = start(&be).await;
    h.fetch_list(MACHINE).await.unwrap();
    idle(Duration::from_secs(12)).await;
    let gets = be.calls_to(MACHINE, "get");
    assert!(gets >= 3, "stuck record keeps settling, got {}", gets);

    let scope = h.select_project("p2").await.unwrap().unwrap();
    assert_eq!(scope.project_id(), Some("p2"));
    assert!(h.snapshot(MACHINE).unwrap().data.is_none());
    idle(Duration::from_secs(600)).await;
    assert_eq!(be.calls_to(MACHINE, "get"), gets);
    assert_eq!(be.calls_to(MACHINE, "list"), 1);
}

#[tokio::test(start_paused = true)]
async fn effects_refresh_other_kinds() {
    let be = Arc::new(MemoryBackend::new());
    let (h, _join) = start(&be).await;
    h.fetch_list(VOLUME).await.unwrap();
    h.fetch_list(QUOTA).await.unwrap();
    idle(Duration::from_millis(1)).await;
    assert_eq!(be.calls_to(QUOTA, "list"), 1);

    h.create(VOLUME, json!({"size": 5})).await.unwrap();
    idle(Duration::from_millis(1)).await;
    assert_eq!(be.calls_to(QUOTA, "list"), 2);
    assert_eq!(h.snapshot(VOLUME).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failures_are_reported_once_as_notices() {
    let be = Arc::new(MemoryBackend::new());
    be.fail_next(MACHINE, SyncError::Network("unreachable".into()));
    let (h, _join) = start(&be).await;
    let mut notices = h.notices();
    h.fetch_list(MACHINE).await.unwrap();
    idle(Duration::from_millis(1)).await;

    let n = notices.try_recv().unwrap();
    assert_eq!(n.id, 1);
    assert_eq!(n.kind, MACHINE);
    assert!(n.message.contains("unreachable"));
    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));
    let store = h.snapshot(MACHINE).unwrap();
    assert!(!store.fetching);
    assert_eq!(store.fetch_error, Some(SyncError::Network("unreachable".into())));

    idle(Duration::from_secs(600)).await;
    assert_eq!(be.calls_to(MACHINE, "list"), 1, "no retry after failure");
}

#[tokio::test(start_paused = true)]
async fn scope_and_kind_errors_surface_to_callers() {
    let be = Arc::new(MemoryBackend::new());
    let (h, join) = spawn_engine(registry(), effects(), be.clone(), SyncConfig::default());
    assert!(matches!(h.select_project("p1").await, Err(EngineError::Scope(ScopeError::NoSession))));
    assert!(matches!(h.fetch_list(KindId("nope")).await, Err(EngineError::UnknownKind(_))));

    h.begin_session().await.unwrap();
    h.fetch_list(MACHINE).await.unwrap();
    h.flush().await.unwrap();
    assert_eq!(be.calls_to(MACHINE, "list"), 0, "project-level kind needs a project");

    h.shutdown().await.unwrap();
    join.await.unwrap();
    assert!(matches!(h.fetch_list(MACHINE).await, Err(EngineError::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_stops_the_engine() {
    let be = Arc::new(MemoryBackend::new());
    let (h, join) = start(&be).await;
    h.fetch_list(MACHINE).await.unwrap();
    idle(Duration::from_millis(1)).await;
    drop(h);
    join.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn snapshots_bump_the_epoch_channel() {
    let be = Arc::new(MemoryBackend::new());
    let (h, _join) = start(&be).await;
    let mut epochs = h.subscribe();
    let before = *epochs.borrow_and_update();
    h.fetch_list(VOLUME).await.unwrap();
    idle(Duration::from_millis(1)).await;
    assert!(epochs.has_changed().unwrap());
    assert!(*epochs.borrow() > before);
    assert!(h.snapshot(VOLUME).unwrap().initialised);
}
