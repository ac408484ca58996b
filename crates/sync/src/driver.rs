//! Tokio runtime around [`EngineCore`].
//!
//! One task owns the core and processes inputs strictly one at a time from an
//! mpsc queue. Transport calls and timers run in their own tasks and feed
//! their results back through the queue. Spawned tasks only hold weak senders,
//! so the engine stops once every [`EngineHandle`] is dropped.

use std::sync::Arc;

use cumulus_api::Transport;
use cumulus_core::{Identity, KindId, KindRegistry, Operation, ScopeId};
use cumulus_store::{KindStore, MirrorHandle, MirrorSnapshot, SnapshotPublisher};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::effects::EffectTable;
use crate::engine::{Command, EngineCore, Input};
use crate::notify::Notice;
use crate::scope::{ScopeChange, ScopeError};
use crate::timers::TimerToken;
use crate::EngineError;

type ScopeReply = oneshot::Sender<Result<Option<ScopeId>, ScopeError>>;

enum Msg {
    Input(Input),
    Scope { change: ScopeChange, reply: ScopeReply },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Per-request options for caller dispatches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Failures update the store but raise no notice.
    pub silent: bool,
}

impl RequestOptions {
    pub fn silent() -> Self { Self { silent: true } }
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Msg>,
    mirror: MirrorHandle,
    notices: broadcast::Sender<Notice>,
    registry: KindRegistry,
}

/// Start the engine task. The returned join handle completes after
/// [`EngineHandle::shutdown`] or once every handle is dropped.
pub fn spawn_engine(
    registry: KindRegistry,
    effects: EffectTable,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_cap);
    let (notices, _) = broadcast::channel(config.notice_cap);
    let (publisher, mirror) = SnapshotPublisher::new();
    let core = EngineCore::new(registry.clone(), effects, &config);
    info!(kinds = registry.len(), queue_cap = config.queue_cap, "engine: starting");
    let runtime = Runtime {
        core,
        rx,
        weak: tx.downgrade(),
        transport,
        notices: notices.clone(),
        publisher,
        timers: FxHashMap::default(),
    };
    let join = tokio::spawn(runtime.run());
    (EngineHandle { tx, mirror, notices, registry }, join)
}

struct Runtime {
    core: EngineCore,
    rx: mpsc::Receiver<Msg>,
    weak: mpsc::WeakSender<Msg>,
    transport: Arc<dyn Transport>,
    notices: broadcast::Sender<Notice>,
    publisher: SnapshotPublisher,
    timers: FxHashMap<TimerToken, JoinHandle<()>>,
}

impl Runtime {
    async fn run(mut self) {
        self.publisher.publish(self.core.mirror());
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Msg::Input(input) => {
                    if let Input::Fired { token, .. } = &input {
                        self.timers.remove(token);
                    }
                    let commands = self.core.handle(input);
                    self.perform(commands);
                    self.publisher.publish(self.core.mirror());
                }
                Msg::Scope { change, reply } => {
                    let result = self.core.change_scope(&change).map(|commands| self.perform(commands));
                    self.publisher.publish(self.core.mirror());
                    let _ = reply.send(result.map(|()| self.core.scope().cloned()));
                }
                Msg::Flush(reply) => {
                    let _ = reply.send(());
                }
                Msg::Shutdown => break,
            }
        }
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        info!("engine: stopped");
    }

    fn perform(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Arm { key, token, after } => {
                    let weak = self.weak.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if let Some(tx) = weak.upgrade() {
                            let _ = tx.send(Msg::Input(Input::Fired { key, token })).await;
                        }
                    });
                    self.timers.insert(token, task);
                }
                Command::Abort(token) => {
                    if let Some(task) = self.timers.remove(&token) {
                        task.abort();
                    }
                }
                Command::Call(request) => {
                    let weak = self.weak.clone();
                    let transport = Arc::clone(&self.transport);
                    tokio::spawn(async move {
                        let event = cumulus_api::execute(transport.as_ref(), request).await;
                        match weak.upgrade() {
                            Some(tx) => {
                                let _ = tx.send(Msg::Input(Input::Completed(event))).await;
                            }
                            None => debug!(event = %event.label(), "engine gone; completion dropped"),
                        }
                    });
                }
                Command::Notify(notice) => {
                    // No receivers is fine.
                    let _ = self.notices.send(notice);
                }
            }
        }
    }
}

impl EngineHandle {
    async fn send(&self, msg: Msg) -> Result<(), EngineError> {
        self.tx.send(msg).await.map_err(|_| EngineError::Stopped)
    }

    /// Queue a caller request for `kind`. It is stamped with the scope that is
    /// current when the engine processes it.
    pub async fn dispatch(&self, kind: KindId, op: Operation, opts: RequestOptions) -> Result<(), EngineError> {
        if self.registry.get(kind).is_none() {
            return Err(EngineError::UnknownKind(kind));
        }
        self.send(Msg::Input(Input::Dispatch { kind, op, silent: opts.silent })).await
    }

    pub async fn fetch_list(&self, kind: KindId) -> Result<(), EngineError> {
        self.dispatch(kind, Operation::FetchList, RequestOptions::default()).await
    }

    pub async fn fetch_one(&self, kind: KindId, id: impl Into<Identity>) -> Result<(), EngineError> {
        self.dispatch(kind, Operation::FetchOne { id: id.into() }, RequestOptions::default()).await
    }

    pub async fn create(&self, kind: KindId, body: Value) -> Result<(), EngineError> {
        self.dispatch(kind, Operation::Create { body }, RequestOptions::default()).await
    }

    pub async fn update(&self, kind: KindId, id: impl Into<Identity>, body: Value) -> Result<(), EngineError> {
        self.dispatch(kind, Operation::Update { id: id.into(), body }, RequestOptions::default()).await
    }

    pub async fn delete(&self, kind: KindId, id: impl Into<Identity>) -> Result<(), EngineError> {
        self.dispatch(kind, Operation::Delete { id: id.into() }, RequestOptions::default()).await
    }

    pub async fn auxiliary(&self, kind: KindId, id: impl Into<Identity>, topic: &'static str) -> Result<(), EngineError> {
        self.dispatch(kind, Operation::Auxiliary { id: id.into(), topic }, RequestOptions::default()).await
    }

    async fn change_scope(&self, change: ScopeChange) -> Result<Option<ScopeId>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Scope { change, reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::Stopped)??)
    }

    /// Start a fresh session (ending any current one) and return its scope.
    pub async fn begin_session(&self) -> Result<Option<ScopeId>, EngineError> {
        self.change_scope(ScopeChange::BeginSession).await
    }

    pub async fn select_project(&self, id: impl Into<String>) -> Result<Option<ScopeId>, EngineError> {
        self.change_scope(ScopeChange::SelectProject(id.into())).await
    }

    pub async fn clear_project(&self) -> Result<Option<ScopeId>, EngineError> {
        self.change_scope(ScopeChange::ClearProject).await
    }

    pub async fn end_session(&self) -> Result<Option<ScopeId>, EngineError> {
        self.change_scope(ScopeChange::EndSession).await
    }

    /// Resolves once every message queued before it has been processed.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Flush(reply)).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(Msg::Shutdown).await
    }

    pub fn registry(&self) -> &KindRegistry { &self.registry }

    pub fn mirror(&self) -> Arc<MirrorSnapshot> { self.mirror.current() }

    pub fn snapshot(&self, kind: KindId) -> Option<KindStore> { self.mirror.kind(kind) }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.mirror.subscribe_epoch() }

    pub fn notices(&self) -> broadcast::Receiver<Notice> { self.notices.subscribe() }
}
