//! Scheduling rules: what to arm, revoke and dispatch after an event.
//!
//! The scheduler is read-only. It inspects the event, the kind's predicate and
//! the mirror, and returns [`Directive`]s for the engine to carry out.

use std::time::Duration;

use cumulus_core::{Event, Family, Identity, Operation, Origin, Payload, Request, ResourceKind};
use cumulus_store::Mirror;
use serde_json::Value;
use tracing::trace;

use crate::config::SyncConfig;
use crate::effects::EffectTable;
use crate::timers::TimerKey;

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Arm (or re-arm) the single-shot timer for `key`.
    Arm { key: TimerKey, after: Duration, request: Request },
    Revoke(TimerKey),
    /// Issue a request now.
    Dispatch(Request),
    /// Reduce a flag toggle into another kind's store.
    Mark(Event),
}

pub struct Scheduler {
    effects: EffectTable,
    poll_override: Option<Duration>,
    settle_override: Option<Duration>,
}

impl Scheduler {
    pub fn new(effects: EffectTable, config: &SyncConfig) -> Self {
        Self { effects, poll_override: config.poll_override, settle_override: config.settle_override }
    }

    pub fn effects(&self) -> &EffectTable { &self.effects }

    fn poll_interval(&self, kind: &dyn ResourceKind) -> Duration {
        self.poll_override.unwrap_or_else(|| kind.poll_interval())
    }

    fn settle_delay(&self, kind: &dyn ResourceKind) -> Duration {
        self.settle_override.unwrap_or_else(|| kind.settle_delay())
    }

    /// Directives for an event that has already been reduced into `mirror`.
    pub fn plan(&self, event: &Event, kind: &dyn ResourceKind, mirror: &Mirror) -> Vec<Directive> {
        let mut out = Vec::new();
        match event {
            Event::Requested(req) => match &req.op {
                Operation::FetchList => out.push(Directive::Revoke(TimerKey::refresh(req.scope.clone(), req.kind))),
                Operation::FetchOne { id } => {
                    out.push(Directive::Revoke(TimerKey::settle(req.scope.clone(), req.kind, id.clone())))
                }
                _ => {}
            },
            Event::Succeeded { request, payload } => self.after_success(request, payload, kind, &mut out),
            Event::Failed { .. } | Event::Marked { .. } => {}
        }
        out.extend(self.effects.route(event, mirror));
        if !out.is_empty() {
            trace!(kind = %kind.id(), event = %event.label(), directives = out.len(), "scheduler plan");
        }
        out
    }

    fn after_success(&self, request: &Request, payload: &Payload, kind: &dyn ResourceKind, out: &mut Vec<Directive>) {
        let (scope, kid) = (&request.scope, request.kind);
        let fetch_one = |id: Identity, origin: Origin| {
            Request::new(kid, scope.clone(), Operation::FetchOne { id }).via(origin).silent()
        };
        match (request.family(), payload) {
            (Family::FetchList, payload) => {
                out.push(Directive::Arm {
                    key: TimerKey::refresh(scope.clone(), kid),
                    after: self.poll_interval(kind),
                    request: Request::new(kid, scope.clone(), Operation::FetchList).via(Origin::Refresh),
                });
                if let Payload::Many(items) = payload {
                    for raw in items {
                        let data = kind.transform(raw.clone());
                        if !kind.is_active(&data) { continue; }
                        if let Some(id) = kind.identity(&data) {
                            out.push(Directive::Dispatch(fetch_one(id, Origin::Sweep)));
                        }
                    }
                }
            }
            (Family::FetchOne | Family::Create | Family::Update, Payload::One(raw)) => {
                let data = kind.transform(raw.clone());
                if !kind.is_active(&data) { return; }
                if let Some(id) = resolve_id(kind, &data, &request.op) {
                    out.push(Directive::Arm {
                        key: TimerKey::settle(scope.clone(), kid, id.clone()),
                        after: self.settle_delay(kind),
                        request: fetch_one(id, Origin::Settle),
                    });
                }
            }
            (Family::Delete, Payload::One(raw)) => {
                let data = kind.transform(raw.clone());
                if let Some(id) = resolve_id(kind, &data, &request.op) {
                    out.push(Directive::Dispatch(fetch_one(id, Origin::DeleteConfirm)));
                }
            }
            _ => {}
        }
    }
}

fn resolve_id(kind: &dyn ResourceKind, data: &Value, op: &Operation) -> Option<Identity> {
    kind.identity(data).or_else(|| op.target().cloned())
}
