//! Cross-kind effect routing.
//!
//! A fixed table of `(source kind, trigger) -> reaction` registrations. The
//! source kind is only read; the target kind is only written through request
//! or mark events, so no kind holds a reference into another kind's store.
//! Reactions are idempotent: replaying one while it is in flight is harmless.

use cumulus_core::{field_identity, Event, Family, Identity, KindId, OpFlag, Operation, Origin, Request};
use cumulus_store::Mirror;
use tracing::debug;

use crate::rules::Directive;

/// Which event of the source kind fires an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Requested(Family),
    Succeeded(Family),
    Failed(Family),
    /// A single fetch failed with not-found (the record is gone).
    NotFound,
}

impl Trigger {
    pub fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Trigger::Requested(f), Event::Requested(r)) => r.family() == *f,
            (Trigger::Succeeded(f), Event::Succeeded { request, .. }) => request.family() == *f,
            (Trigger::Failed(f), Event::Failed { request, .. }) => request.family() == *f,
            (Trigger::NotFound, Event::Failed { request, error }) => {
                request.family() == Family::FetchOne && error.is_not_found()
            }
            _ => false,
        }
    }
}

/// Where the target identity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    /// The identity the source request targeted.
    Target,
    /// A field of the source request body, e.g. `machine_id`.
    BodyField(&'static str),
    /// A field of the source response payload.
    PayloadField(&'static str),
    /// The id of the scope's selected project.
    Project,
}

impl IdSource {
    pub fn resolve(&self, event: &Event) -> Option<Identity> {
        let request = event.request();
        match self {
            IdSource::Target => match event {
                Event::Marked { id, .. } => Some(id.clone()),
                _ => request?.op.target().cloned(),
            },
            IdSource::BodyField(f) => field_identity(request?.op.body()?, f),
            IdSource::PayloadField(f) => match event {
                Event::Succeeded { payload, .. } => field_identity(payload.one()?, f),
                _ => None,
            },
            IdSource::Project => event.scope().project_id().map(Identity::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    RefreshList(KindId),
    FetchOne(KindId, IdSource),
    Mark { kind: KindId, id: IdSource, flag: OpFlag, set: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub source: KindId,
    pub trigger: Trigger,
    pub reaction: Reaction,
}

#[derive(Debug, Clone, Default)]
pub struct EffectTable {
    effects: Vec<Effect>,
}

impl EffectTable {
    pub fn new() -> Self { Self::default() }

    pub fn on(mut self, source: KindId, trigger: Trigger, reaction: Reaction) -> Self {
        self.effects.push(Effect { source, trigger, reaction });
        self
    }

    pub fn len(&self) -> usize { self.effects.len() }
    pub fn is_empty(&self) -> bool { self.effects.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Effect> + '_ { self.effects.iter() }

    /// Directives for every registration matching `event`. Targets without a
    /// current scope or without a resolvable identity are skipped.
    pub fn route(&self, event: &Event, mirror: &Mirror) -> Vec<Directive> {
        let source = event.kind();
        let mut out = Vec::new();
        for e in self.effects.iter().filter(|e| e.source == source && e.trigger.matches(event)) {
            let target = match e.reaction {
                Reaction::RefreshList(k) | Reaction::FetchOne(k, _) | Reaction::Mark { kind: k, .. } => k,
            };
            let Some(scope) = mirror.scope_for(target) else {
                debug!(source = %source, target = %target, "effect target has no current scope");
                continue;
            };
            let directive = match e.reaction {
                Reaction::RefreshList(k) => {
                    Directive::Dispatch(Request::new(k, scope, Operation::FetchList).via(Origin::Effect(source)).silent())
                }
                Reaction::FetchOne(k, src) => match src.resolve(event) {
                    Some(id) => Directive::Dispatch(
                        Request::new(k, scope, Operation::FetchOne { id }).via(Origin::Effect(source)).silent(),
                    ),
                    None => continue,
                },
                Reaction::Mark { kind, id, flag, set } => match id.resolve(event) {
                    Some(id) => Directive::Mark(Event::Marked { kind, scope, id, flag, set }),
                    None => continue,
                },
            };
            out.push(directive);
        }
        out
    }
}
