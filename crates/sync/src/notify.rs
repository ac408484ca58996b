//! User-facing failure notices.

use chrono::{DateTime, Utc};
use cumulus_core::{Event, Family, KindId};

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub id: u64,
    pub kind: KindId,
    pub title: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Turns non-silent failures into notices with engine-local ids.
#[derive(Debug, Default)]
pub struct Notifier {
    next_id: u64,
}

impl Notifier {
    pub fn new() -> Self { Self::default() }

    pub fn failure(&mut self, event: &Event) -> Option<Notice> {
        let Event::Failed { request, error } = event else { return None };
        if request.silent {
            return None;
        }
        self.next_id += 1;
        let verb = match request.family() {
            Family::FetchList => "list",
            Family::FetchOne => "fetch",
            Family::Create => "create",
            Family::Update => "update",
            Family::Delete => "delete",
            Family::Auxiliary => "load details for",
        };
        let title = match request.op.target() {
            Some(id) => format!("Failed to {} {} {}", verb, request.kind, id),
            None => format!("Failed to {} {}", verb, request.kind),
        };
        Some(Notice { id: self.next_id, kind: request.kind, title, message: error.to_string(), at: Utc::now() })
    }
}
