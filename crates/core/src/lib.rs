//! Cumulus core types: identities, scopes, resource kinds and the error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod action;
pub mod record;

pub use action::{Event, Family, Operation, Origin, Payload, Request, Write};
pub use record::{OpFlag, OpFlags, Record};

pub mod prelude {
    pub use super::{
        Event, Family, Identity, KindId, KindRegistry, OpFlag, Operation, Origin, Payload, Record,
        Request, ResourceKind, ScopeId, ScopeLevel, SessionId, SyncError, Write,
    };
}

/// List refresh cadence for kinds that do not override it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(120);
/// Delay before re-fetching a record that is still changing.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Stable identity of a record within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for Identity {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for Identity {
    fn from(v: String) -> Self { Self(v) }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Name of a resource kind, e.g. `machine` or `quota`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KindId(pub &'static str);

impl KindId {
    pub fn as_str(&self) -> &'static str { self.0 }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.0) }
}

/// One login session. A fresh id is minted on every login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for SessionId {
    fn default() -> Self { Self::new() }
}

/// A selected project inside a session. `epoch` distinguishes two selections
/// of the same project within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    pub epoch: u64,
}

/// Which scope a kind's data belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeLevel {
    /// Lives for the whole login session (e.g. the tenancy list).
    Session,
    /// Discarded whenever the selected project changes.
    Project,
}

/// Cancellation boundary that every request, event and timer is tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId {
    pub session: SessionId,
    pub project: Option<ProjectRef>,
}

impl ScopeId {
    pub fn session(session: SessionId) -> Self { Self { session, project: None } }

    pub fn with_project(&self, id: impl Into<String>, epoch: u64) -> Self {
        Self { session: self.session, project: Some(ProjectRef { id: id.into(), epoch }) }
    }

    /// The project-less scope of the same session.
    pub fn session_scope(&self) -> Self { Self { session: self.session, project: None } }

    pub fn project_id(&self) -> Option<&str> { self.project.as_ref().map(|p| p.id.as_str()) }

    /// The scope a kind of the given level is tagged with while `self` is current.
    /// Project-level kinds have no scope until a project is selected.
    pub fn for_level(&self, level: ScopeLevel) -> Option<ScopeId> {
        match level {
            ScopeLevel::Session => Some(self.session_scope()),
            ScopeLevel::Project => self.project.as_ref().map(|_| self.clone()),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.session.0.simple().to_string();
        match &self.project {
            Some(p) => write!(f, "{}/{}@{}", &s[..8], p.id, p.epoch),
            None => write!(f, "{}", &s[..8]),
        }
    }
}

/// Errors reported by the transport collaborator.
///
/// `NotFound` is the only kind with business meaning: it prunes the record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("network: {0}")]
    Network(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn is_not_found(&self) -> bool { matches!(self, SyncError::NotFound(_)) }

    pub fn message(&self) -> &str {
        match self {
            SyncError::NotFound(m) | SyncError::Network(m) | SyncError::Rejected(m) | SyncError::Other(m) => m,
        }
    }
}

/// Per-kind rules the generic engine is instantiated with.
pub trait ResourceKind: Send + Sync {
    fn id(&self) -> KindId;

    fn level(&self) -> ScopeLevel { ScopeLevel::Project }

    /// Stable identity of a (transformed) record. Records without one are skipped.
    fn identity(&self, record: &Value) -> Option<Identity> { field_identity(record, "id") }

    /// Whether the record is still changing and warrants settle polling.
    /// Must eventually return false for every terminal state.
    fn is_active(&self, _record: &Value) -> bool { false }

    /// Applied to every payload before it is stored or inspected.
    fn transform(&self, record: Value) -> Value { record }

    fn poll_interval(&self) -> Duration { DEFAULT_POLL_INTERVAL }

    fn settle_delay(&self) -> Duration { DEFAULT_SETTLE_DELAY }
}

/// Read `field` as an identity; numbers are rendered in decimal.
pub fn field_identity(record: &Value, field: &str) -> Option<Identity> {
    match record.get(field)? {
        Value::String(s) if !s.is_empty() => Some(Identity::new(s.clone())),
        Value::Number(n) => Some(Identity::new(n.to_string())),
        _ => None,
    }
}

/// Set of kinds one engine instance synchronizes, in registration order.
#[derive(Clone, Default)]
pub struct KindRegistry {
    kinds: FxHashMap<KindId, Arc<dyn ResourceKind>>,
    order: Vec<KindId>,
}

impl KindRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register a kind; a later registration with the same id replaces the earlier one.
    pub fn register(&mut self, kind: Arc<dyn ResourceKind>) {
        let id = kind.id();
        if self.kinds.insert(id, kind).is_none() {
            self.order.push(id);
        }
    }

    pub fn with(mut self, kind: impl ResourceKind + 'static) -> Self {
        self.register(Arc::new(kind));
        self
    }

    pub fn get(&self, id: KindId) -> Option<&Arc<dyn ResourceKind>> { self.kinds.get(&id) }

    pub fn ids(&self) -> &[KindId] { &self.order }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ResourceKind>> + '_ {
        self.order.iter().filter_map(|id| self.kinds.get(id))
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.order.iter().map(|k| k.0)).finish()
    }
}
