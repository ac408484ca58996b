//! Cumulus transport seam.
//!
//! The engine never talks to the network itself. It hands every request to a
//! [`Transport`] and turns the result into a terminal event. [`MemoryBackend`]
//! is an in-process implementation used by tests and the CLI simulator.

#![forbid(unsafe_code)]

use std::time::Instant;

use cumulus_core::{Event, Identity, KindId, Operation, Payload, Request, ScopeId, SyncError, Write};
use serde_json::Value;
use tracing::debug;

mod memory;

pub use memory::{Call, DeleteMode, KindConfig, MemoryBackend};

pub type SyncResult<T> = Result<T, SyncError>;

/// Backing-service operations the engine consumes per kind.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn list(&self, kind: KindId, scope: &ScopeId) -> SyncResult<Vec<Value>>;

    async fn get_one(&self, kind: KindId, scope: &ScopeId, id: &Identity) -> SyncResult<Value>;

    /// Create, update or delete. `Ok(None)` means the write returned no body
    /// (for deletes: the record is gone immediately).
    async fn mutate(
        &self,
        kind: KindId,
        scope: &ScopeId,
        write: Write,
        id: Option<&Identity>,
        body: Option<&Value>,
    ) -> SyncResult<Option<Value>>;

    /// Kind-specific sub-resource fetch, e.g. machine logs.
    async fn auxiliary(&self, kind: KindId, _scope: &ScopeId, _id: &Identity, topic: &str) -> SyncResult<Value> {
        Err(SyncError::Rejected(format!("{} does not support {}", kind, topic)))
    }
}

/// Run a request through the transport and return its terminal event.
pub async fn execute(transport: &dyn Transport, request: Request) -> Event {
    let t0 = Instant::now();
    let (kind, scope) = (request.kind, &request.scope);
    let result = match &request.op {
        Operation::FetchList => transport.list(kind, scope).await.map(Payload::Many),
        Operation::FetchOne { id } => transport.get_one(kind, scope, id).await.map(Payload::One),
        Operation::Create { body } => transport.mutate(kind, scope, Write::Create, None, Some(body)).await.map(optional),
        Operation::Update { id, body } => transport.mutate(kind, scope, Write::Update, Some(id), Some(body)).await.map(optional),
        Operation::Delete { id } => transport.mutate(kind, scope, Write::Delete, Some(id), None).await.map(optional),
        Operation::Auxiliary { id, topic } => transport.auxiliary(kind, scope, id, topic).await.map(Payload::One),
    };
    let ms = t0.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("transport_call_ms", ms, "kind" => kind.as_str(), "family" => request.family().to_string());
    debug!(kind = %kind, family = %request.family(), ok = result.is_ok(), took_ms = %ms, "transport call done");
    match result {
        Ok(payload) => Event::Succeeded { request, payload },
        Err(error) => Event::Failed { request, error },
    }
}

fn optional(v: Option<Value>) -> Payload {
    match v { Some(v) => Payload::One(v), None => Payload::Nothing }
}
