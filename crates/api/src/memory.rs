//! In-memory backing service with scripted state progressions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cumulus_core::{Identity, KindId, ScopeId, SyncError, Write};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::debug;

use crate::{SyncResult, Transport};

/// How a kind's deletes behave.
#[derive(Debug, Clone, Default)]
pub enum DeleteMode {
    /// Gone immediately; the delete returns no body.
    #[default]
    Hard,
    /// The delete returns the record in a terminal state; it answers `linger`
    /// more single fetches before reporting not-found.
    Soft { status: &'static str, linger: usize },
}

#[derive(Debug, Clone, Default)]
pub struct KindConfig {
    pub delete: DeleteMode,
    /// Patches applied to every created record, one per single fetch.
    /// The first is applied at creation.
    pub create_steps: Vec<Value>,
}

/// One transport call as observed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: KindId,
    pub op: &'static str,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
struct Entry {
    value: Value,
    script: VecDeque<Value>,
    doomed: Option<usize>,
}

#[derive(Debug, Default)]
struct Table {
    config: KindConfig,
    entries: BTreeMap<String, Entry>,
    aux: FxHashMap<(String, String), Value>,
    failures: VecDeque<SyncError>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct Inner {
    tables: FxHashMap<KindId, Table>,
    calls: Vec<Call>,
}

/// Shared in-process "cloud". Scopes are ignored: every session and project
/// sees the same data.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

fn merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p { t.insert(k.clone(), v.clone()); }
        }
        _ => *target = patch.clone(),
    }
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    /// Delay every call by `latency` (tokio time, so paused clocks apply).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn configure(&self, kind: KindId, config: KindConfig) {
        self.lock().tables.entry(kind).or_default().config = config;
    }

    pub fn seed(&self, kind: KindId, id: &str, value: Value) {
        let mut inner = self.lock();
        let entry = inner.tables.entry(kind).or_default().entries.entry(id.to_string()).or_default();
        entry.value = value;
    }

    /// Queue patches applied one per single fetch of the record.
    pub fn script(&self, kind: KindId, id: &str, steps: Vec<Value>) {
        let mut inner = self.lock();
        if let Some(e) = inner.tables.entry(kind).or_default().entries.get_mut(id) {
            e.script.extend(steps);
        }
    }

    pub fn set_aux(&self, kind: KindId, id: &str, topic: &str, value: Value) {
        self.lock().tables.entry(kind).or_default().aux.insert((id.to_string(), topic.to_string()), value);
    }

    /// Make the next call for `kind` fail with `error`.
    pub fn fail_next(&self, kind: KindId, error: SyncError) {
        self.lock().tables.entry(kind).or_default().failures.push_back(error);
    }

    /// Remove a record behind the engine's back.
    pub fn remove(&self, kind: KindId, id: &str) -> bool {
        self.lock().tables.get_mut(&kind).map(|t| t.entries.remove(id).is_some()).unwrap_or(false)
    }

    pub fn get(&self, kind: KindId, id: &str) -> Option<Value> {
        self.lock().tables.get(&kind)?.entries.get(id).map(|e| e.value.clone())
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn calls_to(&self, kind: KindId, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.kind == kind && c.op == op).count()
    }

    async fn enter(&self, kind: KindId, op: &'static str, id: Option<&Identity>) -> SyncResult<()> {
        if let Some(d) = self.latency { tokio::time::sleep(d).await; }
        let mut inner = self.lock();
        inner.calls.push(Call { kind, op, id: id.map(|i| i.to_string()) });
        let failure = inner.tables.get_mut(&kind).and_then(|t| t.failures.pop_front());
        match failure {
            Some(e) => {
                debug!(kind = %kind, op, error = %e, "memory backend: injected failure");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryBackend {
    async fn list(&self, kind: KindId, _scope: &ScopeId) -> SyncResult<Vec<Value>> {
        self.enter(kind, "list", None).await?;
        let inner = self.lock();
        Ok(inner.tables.get(&kind).map(|t| t.entries.values().map(|e| e.value.clone()).collect()).unwrap_or_default())
    }

    async fn get_one(&self, kind: KindId, _scope: &ScopeId, id: &Identity) -> SyncResult<Value> {
        self.enter(kind, "get", Some(id)).await?;
        let mut inner = self.lock();
        let not_found = || SyncError::NotFound(format!("{} {}", kind, id));
        let table = inner.tables.get_mut(&kind).ok_or_else(not_found)?;
        let entry = table.entries.get_mut(id.as_str()).ok_or_else(not_found)?;
        let doomed = entry.doomed;
        match doomed {
            Some(0) => {
                table.entries.remove(id.as_str());
                return Err(not_found());
            }
            Some(n) => entry.doomed = Some(n - 1),
            None => {
                if let Some(step) = entry.script.pop_front() { merge(&mut entry.value, &step); }
            }
        }
        Ok(entry.value.clone())
    }

    async fn mutate(
        &self,
        kind: KindId,
        _scope: &ScopeId,
        write: Write,
        id: Option<&Identity>,
        body: Option<&Value>,
    ) -> SyncResult<Option<Value>> {
        let op = match write { Write::Create => "create", Write::Update => "update", Write::Delete => "delete" };
        self.enter(kind, op, id).await?;
        let mut inner = self.lock();
        let table = inner.tables.entry(kind).or_default();
        match (write, id) {
            (Write::Create, _) => {
                table.next_id += 1;
                let mut value = body.cloned().unwrap_or_else(|| json!({}));
                let new_id = value.get("id").and_then(|v| v.as_str()).map(str::to_string)
                    .unwrap_or_else(|| format!("{}-{}", kind, table.next_id));
                merge(&mut value, &json!({ "id": new_id }));
                let mut steps: VecDeque<Value> = table.config.create_steps.iter().cloned().collect();
                if let Some(first) = steps.pop_front() { merge(&mut value, &first); }
                table.entries.insert(new_id, Entry { value: value.clone(), script: steps, doomed: None });
                Ok(Some(value))
            }
            (Write::Update, Some(id)) => {
                let entry = table.entries.get_mut(id.as_str())
                    .ok_or_else(|| SyncError::NotFound(format!("{} {}", kind, id)))?;
                if let Some(patch) = body { merge(&mut entry.value, patch); }
                Ok(Some(entry.value.clone()))
            }
            (Write::Delete, Some(id)) => match table.config.delete.clone() {
                DeleteMode::Hard => {
                    table.entries.remove(id.as_str())
                        .ok_or_else(|| SyncError::NotFound(format!("{} {}", kind, id)))?;
                    Ok(None)
                }
                DeleteMode::Soft { status, linger } => {
                    let entry = table.entries.get_mut(id.as_str())
                        .ok_or_else(|| SyncError::NotFound(format!("{} {}", kind, id)))?;
                    merge(&mut entry.value, &json!({ "status": status }));
                    entry.script.clear();
                    entry.doomed = Some(linger);
                    Ok(Some(entry.value.clone()))
                }
            },
            (_, None) => Err(SyncError::Rejected(format!("{} {} requires an id", kind, op))),
        }
    }

    async fn auxiliary(&self, kind: KindId, _scope: &ScopeId, id: &Identity, topic: &str) -> SyncResult<Value> {
        self.enter(kind, "aux", Some(id)).await?;
        let inner = self.lock();
        let table = inner.tables.get(&kind).ok_or_else(|| SyncError::NotFound(format!("{} {}", kind, id)))?;
        if !table.entries.contains_key(id.as_str()) {
            return Err(SyncError::NotFound(format!("{} {}", kind, id)));
        }
        Ok(table.aux.get(&(id.to_string(), topic.to_string())).cloned().unwrap_or(Value::Null))
    }
}
