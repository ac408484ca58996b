//! Action vocabulary: request families and the requested / succeeded / failed events.

use std::fmt;

use serde_json::Value;

use crate::{Identity, KindId, OpFlag, ScopeId, SyncError};

/// The write a `mutate` transport call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Write {
    Create,
    Update,
    Delete,
}

/// Request families understood by every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    FetchList,
    FetchOne,
    Create,
    Update,
    Delete,
    Auxiliary,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::FetchList => "fetch_list",
            Family::FetchOne => "fetch_one",
            Family::Create => "create",
            Family::Update => "update",
            Family::Delete => "delete",
            Family::Auxiliary => "auxiliary",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FetchList,
    FetchOne { id: Identity },
    Create { body: Value },
    Update { id: Identity, body: Value },
    Delete { id: Identity },
    /// Kind-specific sub-resource fetch (e.g. machine logs).
    Auxiliary { id: Identity, topic: &'static str },
}

impl Operation {
    pub fn family(&self) -> Family {
        match self {
            Operation::FetchList => Family::FetchList,
            Operation::FetchOne { .. } => Family::FetchOne,
            Operation::Create { .. } => Family::Create,
            Operation::Update { .. } => Family::Update,
            Operation::Delete { .. } => Family::Delete,
            Operation::Auxiliary { .. } => Family::Auxiliary,
        }
    }

    /// Identity the operation targets, if any.
    pub fn target(&self) -> Option<&Identity> {
        match self {
            Operation::FetchOne { id }
            | Operation::Update { id, .. }
            | Operation::Delete { id }
            | Operation::Auxiliary { id, .. } => Some(id),
            Operation::FetchList | Operation::Create { .. } => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Operation::Create { body } | Operation::Update { body, .. } => Some(body),
            _ => None,
        }
    }

    /// The flag this operation sets on its target record while in flight.
    pub fn flag(&self) -> Option<OpFlag> {
        match self {
            Operation::Update { .. } => Some(OpFlag::Updating),
            Operation::Delete { .. } => Some(OpFlag::Deleting),
            Operation::Auxiliary { topic, .. } => Some(OpFlag::Aux(*topic)),
            _ => None,
        }
    }
}

/// What caused a request to be issued. Used for logging and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Caller,
    Refresh,
    Sweep,
    Settle,
    DeleteConfirm,
    Effect(KindId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: KindId,
    pub scope: ScopeId,
    pub op: Operation,
    /// Failures update the store but raise no notice.
    pub silent: bool,
    pub origin: Origin,
}

impl Request {
    pub fn new(kind: KindId, scope: ScopeId, op: Operation) -> Self {
        Self { kind, scope, op, silent: false, origin: Origin::Caller }
    }

    pub fn silent(mut self) -> Self { self.silent = true; self }

    pub fn via(mut self, origin: Origin) -> Self { self.origin = origin; self }

    pub fn family(&self) -> Family { self.op.family() }
}

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Many(Vec<Value>),
    One(Value),
    Nothing,
}

impl Payload {
    pub fn one(&self) -> Option<&Value> {
        match self { Payload::One(v) => Some(v), _ => None }
    }
}

/// Everything the reducer and the scheduler consume.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Requested(Request),
    Succeeded { request: Request, payload: Payload },
    Failed { request: Request, error: SyncError },
    /// Flag toggled on a record by a cross-kind effect.
    Marked { kind: KindId, scope: ScopeId, id: Identity, flag: OpFlag, set: bool },
}

impl Event {
    pub fn kind(&self) -> KindId {
        match self {
            Event::Requested(r) | Event::Succeeded { request: r, .. } | Event::Failed { request: r, .. } => r.kind,
            Event::Marked { kind, .. } => *kind,
        }
    }

    pub fn scope(&self) -> &ScopeId {
        match self {
            Event::Requested(r) | Event::Succeeded { request: r, .. } | Event::Failed { request: r, .. } => &r.scope,
            Event::Marked { scope, .. } => scope,
        }
    }

    pub fn request(&self) -> Option<&Request> {
        match self {
            Event::Requested(r) | Event::Succeeded { request: r, .. } | Event::Failed { request: r, .. } => Some(r),
            Event::Marked { .. } => None,
        }
    }

    /// Short label for logs and metrics, e.g. `update_succeeded`.
    pub fn label(&self) -> String {
        match self {
            Event::Requested(r) => format!("{}_requested", r.family()),
            Event::Succeeded { request, .. } => format!("{}_succeeded", request.family()),
            Event::Failed { request, .. } => format!("{}_failed", request.family()),
            Event::Marked { .. } => "marked".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionId;
    use serde_json::json;

    #[test]
    fn operations_report_target_body_and_flag() {
        let op = Operation::Update { id: "m1".into(), body: json!({"name": "x"}) };
        assert_eq!(op.family(), Family::Update);
        assert_eq!(op.target(), Some(&Identity::from("m1")));
        assert_eq!(op.body(), Some(&json!({"name": "x"})));
        assert_eq!(op.flag(), Some(OpFlag::Updating));
        assert_eq!(Operation::FetchList.target(), None);
        assert_eq!(Operation::Create { body: json!({}) }.flag(), None);
        assert_eq!(Operation::Auxiliary { id: "m1".into(), topic: "logs" }.flag(), Some(OpFlag::Aux("logs")));
    }

    #[test]
    fn event_labels_follow_family_and_phase() {
        let scope = ScopeId::session(SessionId::new());
        let req = Request::new(KindId("volume"), scope, Operation::Delete { id: "v1".into() });
        assert_eq!(Event::Requested(req.clone()).label(), "delete_requested");
        assert_eq!(Event::Succeeded { request: req.clone(), payload: Payload::Nothing }.label(), "delete_succeeded");
        assert_eq!(Event::Failed { request: req, error: SyncError::Other("x".into()) }.label(), "delete_failed");
    }
}
