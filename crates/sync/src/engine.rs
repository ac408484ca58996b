//! Functional engine core.
//!
//! `EngineCore` owns the mirror, the timer book, the scope controller and the
//! notice counter. It is a synchronous state machine: every [`Input`] yields
//! the [`Command`]s the runtime has to perform (sleep, abort, call, notify).
//! Nothing here awaits or spawns.

use std::time::Duration;

use cumulus_core::{Event, KindId, KindRegistry, Operation, Origin, Request, ScopeId};
use cumulus_store::{Applied, Mirror};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::effects::EffectTable;
use crate::notify::{Notice, Notifier};
use crate::rules::{Directive, Scheduler};
use crate::scope::{ScopeChange, ScopeController, ScopeError, Transition};
use crate::timers::{TimerBook, TimerKey, TimerToken};

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// A caller-issued request; the scope is stamped when processed.
    Dispatch { kind: KindId, op: Operation, silent: bool },
    /// Terminal event returned by the transport.
    Completed(Event),
    Fired { key: TimerKey, token: TimerToken },
    Scope(ScopeChange),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Arm { key: TimerKey, token: TimerToken, after: Duration },
    Abort(TimerToken),
    Call(Request),
    Notify(Notice),
}

pub struct EngineCore {
    mirror: Mirror,
    scheduler: Scheduler,
    timers: TimerBook,
    scopes: ScopeController,
    notifier: Notifier,
    prime_on_enter: bool,
}

impl EngineCore {
    pub fn new(registry: KindRegistry, effects: EffectTable, config: &SyncConfig) -> Self {
        Self {
            mirror: Mirror::new(registry),
            scheduler: Scheduler::new(effects, config),
            timers: TimerBook::new(),
            scopes: ScopeController::new(),
            notifier: Notifier::new(),
            prime_on_enter: config.prime_on_enter,
        }
    }

    pub fn mirror(&self) -> &Mirror { &self.mirror }
    pub fn timers(&self) -> &TimerBook { &self.timers }
    pub fn scope(&self) -> Option<&ScopeId> { self.scopes.current() }

    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        let mut out = Vec::new();
        match input {
            Input::Dispatch { kind, op, silent } => self.dispatch(kind, op, silent, &mut out),
            Input::Completed(event) => self.process(event, &mut out),
            Input::Fired { key, token } => self.fired(key, token, &mut out),
            Input::Scope(change) => match self.change_scope(&change) {
                Ok(cmds) => out = cmds,
                Err(e) => warn!(?change, error = %e, "scope change rejected"),
            },
        }
        metrics::gauge!("sync_timers_live", self.timers.len() as f64);
        out
    }

    /// Apply a scope change. On a transition, the affected stores are reset
    /// and every timer tagged with a scope that is no longer current is
    /// revoked in the same step.
    pub fn change_scope(&mut self, change: &ScopeChange) -> Result<Vec<Command>, ScopeError> {
        let mut out = Vec::new();
        let Transition::Entered { previous, next } = self.scopes.change(change)? else {
            return Ok(out);
        };
        self.mirror.enter(next.clone());
        let mirror = &self.mirror;
        let revoked = self.timers.revoke_where(|k| !mirror.is_current(k.kind, &k.scope));
        if !revoked.is_empty() {
            metrics::counter!("sync_timers_revoked_total", revoked.len() as u64);
            info!(revoked = revoked.len(), "scope: timers revoked");
        }
        out.extend(revoked.into_iter().map(Command::Abort));
        if self.prime_on_enter {
            let ids: Vec<KindId> = self.mirror.registry().ids().to_vec();
            for kind in ids {
                let level = match self.mirror.registry().get(kind) { Some(k) => k.level(), None => continue };
                let before = previous.as_ref().and_then(|s| s.for_level(level));
                let after = next.as_ref().and_then(|s| s.for_level(level));
                if let Some(scope) = after.filter(|a| before.as_ref() != Some(a)) {
                    self.request(Request::new(kind, scope, Operation::FetchList).via(Origin::Refresh), &mut out);
                }
            }
        }
        Ok(out)
    }

    fn dispatch(&mut self, kind: KindId, op: Operation, silent: bool, out: &mut Vec<Command>) {
        if self.mirror.registry().get(kind).is_none() {
            warn!(kind = %kind, "dispatch for unknown kind dropped");
            return;
        }
        let Some(scope) = self.mirror.scope_for(kind) else {
            warn!(kind = %kind, family = %op.family(), "dispatch without a current scope dropped");
            return;
        };
        let mut req = Request::new(kind, scope, op);
        req.silent = silent;
        self.request(req, out);
    }

    fn request(&mut self, req: Request, out: &mut Vec<Command>) {
        debug!(kind = %req.kind, family = %req.family(), origin = ?req.origin, scope = %req.scope, "request");
        self.process(Event::Requested(req.clone()), out);
        out.push(Command::Call(req));
    }

    fn fired(&mut self, key: TimerKey, token: TimerToken, out: &mut Vec<Command>) {
        let Some(req) = self.timers.fire(&key, token) else {
            metrics::counter!("sync_stale_timer_total", 1u64, "kind" => key.kind.as_str());
            debug!(kind = %key.kind, purpose = %key.purpose, token, "stale timer dropped");
            return;
        };
        if !self.mirror.is_current(req.kind, &req.scope) {
            metrics::counter!("sync_stale_timer_total", 1u64, "kind" => key.kind.as_str());
            debug!(kind = %key.kind, scope = %req.scope, "timer for stale scope dropped");
            return;
        }
        self.request(req, out);
    }

    fn process(&mut self, event: Event, out: &mut Vec<Command>) {
        let kind_id = event.kind();
        match self.mirror.apply(&event) {
            Applied::StaleScope | Applied::UnknownKind => return,
            Applied::Changed | Applied::Unchanged => {}
        }
        metrics::counter!("sync_events_total", 1u64, "kind" => kind_id.as_str(), "event" => event.label());
        if let Some(notice) = self.notifier.failure(&event) {
            warn!(kind = %kind_id, notice = notice.id, title = %notice.title, message = %notice.message, "request failed");
            out.push(Command::Notify(notice));
        } else if let Event::Failed { request, error } = &event {
            debug!(kind = %kind_id, family = %request.family(), error = %error, "quiet failure");
        }
        let Some(kind) = self.mirror.registry().get(kind_id).cloned() else { return };
        for directive in self.scheduler.plan(&event, kind.as_ref(), &self.mirror) {
            self.execute(directive, out);
        }
    }

    fn execute(&mut self, directive: Directive, out: &mut Vec<Command>) {
        match directive {
            Directive::Arm { key, after, request } => {
                let (token, replaced) = self.timers.arm(key.clone(), request);
                if let Some(old) = replaced {
                    out.push(Command::Abort(old));
                }
                metrics::counter!("sync_timers_armed_total", 1u64, "kind" => key.kind.as_str(), "purpose" => key.purpose.to_string());
                out.push(Command::Arm { key, token, after });
            }
            Directive::Revoke(key) => {
                if let Some(token) = self.timers.revoke(&key) {
                    metrics::counter!("sync_timers_revoked_total", 1u64);
                    out.push(Command::Abort(token));
                }
            }
            Directive::Dispatch(req) => self.request(req, out),
            Directive::Mark(event) => self.process(event, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::{Payload, ResourceKind, ScopeLevel, SyncError};
    use serde_json::{json, Value};

    struct Cluster;
    impl ResourceKind for Cluster {
        fn id(&self) -> KindId { KindId("cluster") }
        fn is_active(&self, r: &Value) -> bool { r["status"] == "CONFIGURING" || r["status"] == "DELETING" }
    }

    struct Tenancy;
    impl ResourceKind for Tenancy {
        fn id(&self) -> KindId { KindId("tenancy") }
        fn level(&self) -> ScopeLevel { ScopeLevel::Session }
    }

    fn core() -> EngineCore {
        let reg = KindRegistry::new().with(Cluster).with(Tenancy);
        let mut c = EngineCore::new(reg, EffectTable::new(), &SyncConfig::default());
        c.change_scope(&ScopeChange::BeginSession).unwrap();
        c.change_scope(&ScopeChange::SelectProject("p".into())).unwrap();
        c
    }

    fn calls(cmds: &[Command]) -> Vec<Request> {
        cmds.iter().filter_map(|c| match c { Command::Call(r) => Some(r.clone()), _ => None }).collect()
    }

    fn arms(cmds: &[Command]) -> Vec<(TimerKey, TimerToken)> {
        cmds.iter().filter_map(|c| match c { Command::Arm { key, token, .. } => Some((key.clone(), *token)), _ => None }).collect()
    }

    fn complete(c: &mut EngineCore, req: Request, payload: Payload) -> Vec<Command> {
        c.handle(Input::Completed(Event::Succeeded { request: req, payload }))
    }

    #[test]
    fn settle_loop_stops_when_predicate_turns_false() {
        let mut c = core();
        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchList, silent: false });
        let list = calls(&cmds).remove(0);
        complete(&mut c, list, Payload::Many(vec![]));

        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::Create { body: json!({}) }, silent: false });
        let create = calls(&cmds).remove(0);
        let mut armed = 0;
        let mut cmds = complete(&mut c, create, Payload::One(json!({"id": "c1", "status": "CONFIGURING"})));
        for status in ["CONFIGURING", "READY"] {
            let (key, token) = arms(&cmds).pop().expect("settle timer armed");
            armed += 1;
            let fired = c.handle(Input::Fired { key, token });
            let fetch = calls(&fired).remove(0);
            assert_eq!(fetch.origin, Origin::Settle);
            cmds = complete(&mut c, fetch, Payload::One(json!({"id": "c1", "status": status})));
        }
        assert!(arms(&cmds).is_empty());
        assert_eq!(armed, 2);
        assert_eq!(c.timers().len(), 1, "only the list refresh remains");
    }

    #[test]
    fn fetch_one_settle_loop_arms_twice_then_stops() {
        let mut c = core();
        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchList, silent: false });
        let list = calls(&cmds).remove(0);
        complete(&mut c, list, Payload::Many(vec![]));

        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchOne { id: "c1".into() }, silent: false });
        let mut fetch = calls(&cmds).remove(0);
        let mut armed = 0;
        for (i, status) in ["CONFIGURING", "CONFIGURING", "READY"].into_iter().enumerate() {
            let cmds = complete(&mut c, fetch.clone(), Payload::One(json!({"id": "c1", "status": status})));
            let Some((key, token)) = arms(&cmds).pop() else {
                assert_eq!(i, 2, "only the terminal status stops the loop");
                break;
            };
            assert_eq!(key.purpose, crate::timers::Purpose::Settle);
            armed += 1;
            fetch = calls(&c.handle(Input::Fired { key, token })).remove(0);
        }
        assert_eq!(armed, 2);
        assert_eq!(c.mirror().record(KindId("cluster"), &"c1".into()).unwrap().data["status"], "READY");
        assert_eq!(c.timers().len(), 1, "only the list refresh remains");
    }

    #[test]
    fn reselecting_the_current_project_keeps_timers_and_data() {
        let mut c = core();
        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchList, silent: false });
        let list = calls(&cmds).remove(0);
        let (key, token) = arms(&complete(&mut c, list, Payload::Many(vec![json!({"id": "c1", "status": "READY"})]))).remove(0);
        let scope = c.scope().cloned();

        let cmds = c.change_scope(&ScopeChange::SelectProject("p".into())).unwrap();
        assert!(cmds.is_empty());
        assert!(c.handle(Input::Scope(ScopeChange::SelectProject("p".into()))).is_empty());
        assert_eq!(c.scope().cloned(), scope);
        assert_eq!(c.timers().len(), 1);
        assert_eq!(c.timers().token(&key), Some(token));
        assert!(c.mirror().store(KindId("cluster")).unwrap().contains(&"c1".into()));
        assert!(!calls(&c.handle(Input::Fired { key, token })).is_empty());
    }

    #[test]
    fn stale_and_replaced_tokens_do_nothing() {
        let mut c = core();
        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchList, silent: false });
        let list = calls(&cmds).remove(0);
        let first = arms(&complete(&mut c, list.clone(), Payload::Many(vec![]))).remove(0);
        let cmds = complete(&mut c, list, Payload::Many(vec![]));
        assert!(cmds.contains(&Command::Abort(first.1)));
        assert!(c.handle(Input::Fired { key: first.0, token: first.1 }).is_empty());
    }

    #[test]
    fn project_switch_revokes_project_timers_but_keeps_session_ones() {
        let mut c = core();
        for kind in [KindId("cluster"), KindId("tenancy")] {
            let cmds = c.handle(Input::Dispatch { kind, op: Operation::FetchList, silent: false });
            let req = calls(&cmds).remove(0);
            complete(&mut c, req, Payload::Many(vec![]));
        }
        assert_eq!(c.timers().len(), 2);
        let cmds = c.change_scope(&ScopeChange::SelectProject("q".into())).unwrap();
        assert_eq!(cmds.iter().filter(|c| matches!(c, Command::Abort(_))).count(), 1);
        assert_eq!(c.timers().len(), 1);
        assert!(c.timers().keys().all(|k| k.kind == KindId("tenancy")));
        let cmds = c.change_scope(&ScopeChange::EndSession).unwrap();
        assert_eq!(cmds.len(), 1);
        assert!(c.timers().is_empty());
    }

    #[test]
    fn completions_for_an_old_scope_are_ignored() {
        let mut c = core();
        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchList, silent: false });
        let old = calls(&cmds).remove(0);
        c.change_scope(&ScopeChange::SelectProject("q".into())).unwrap();
        let cmds = complete(&mut c, old, Payload::Many(vec![json!({"id": "c1", "status": "CONFIGURING"})]));
        assert!(cmds.is_empty());
        assert!(c.mirror().store(KindId("cluster")).unwrap().data.is_none());
    }

    #[test]
    fn failures_notify_unless_silent() {
        let mut c = core();
        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchList, silent: false });
        let req = calls(&cmds).remove(0);
        let cmds = c.handle(Input::Completed(Event::Failed { request: req, error: SyncError::Network("down".into()) }));
        assert!(matches!(cmds.as_slice(), [Command::Notify(n)] if n.id == 1));
        assert!(c.timers().is_empty(), "failures never re-arm");

        let cmds = c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::Delete { id: "c1".into() }, silent: true });
        let req = calls(&cmds).remove(0);
        let cmds = c.handle(Input::Completed(Event::Failed { request: req, error: SyncError::Rejected("no".into()) }));
        assert!(cmds.is_empty());
    }

    #[test]
    fn dispatch_without_project_is_dropped() {
        let reg = KindRegistry::new().with(Cluster);
        let mut c = EngineCore::new(reg, EffectTable::new(), &SyncConfig::default());
        c.change_scope(&ScopeChange::BeginSession).unwrap();
        assert!(c.handle(Input::Dispatch { kind: KindId("cluster"), op: Operation::FetchList, silent: false }).is_empty());
        assert!(c.handle(Input::Dispatch { kind: KindId("nope"), op: Operation::FetchList, silent: false }).is_empty());
    }

    #[test]
    fn priming_lists_every_kind_entering_scope() {
        let reg = KindRegistry::new().with(Cluster).with(Tenancy);
        let cfg = SyncConfig { prime_on_enter: true, ..SyncConfig::default() };
        let mut c = EngineCore::new(reg, EffectTable::new(), &cfg);
        let cmds = c.change_scope(&ScopeChange::BeginSession).unwrap();
        assert_eq!(calls(&cmds).iter().map(|r| r.kind).collect::<Vec<_>>(), vec![KindId("tenancy")]);
        let cmds = c.change_scope(&ScopeChange::SelectProject("p".into())).unwrap();
        assert_eq!(calls(&cmds).iter().map(|r| r.kind).collect::<Vec<_>>(), vec![KindId("cluster")]);
    }
}
