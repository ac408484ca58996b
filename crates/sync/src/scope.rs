//! Session / project lifecycle.

use cumulus_core::{ScopeId, SessionId};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("no active session")]
    NoSession,
}

/// A requested scope change, as sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeChange {
    BeginSession,
    SelectProject(String),
    ClearProject,
    EndSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Entered { previous: Option<ScopeId>, next: Option<ScopeId> },
}

/// Tracks the current scope and allocates project epochs.
#[derive(Debug, Default)]
pub struct ScopeController {
    current: Option<ScopeId>,
    next_epoch: u64,
}

impl ScopeController {
    pub fn new() -> Self { Self::default() }

    pub fn current(&self) -> Option<&ScopeId> { self.current.as_ref() }

    fn enter(&mut self, next: Option<ScopeId>) -> Transition {
        let previous = std::mem::replace(&mut self.current, next.clone());
        info!(
            from = ?previous.as_ref().map(|s| s.to_string()),
            to = ?next.as_ref().map(|s| s.to_string()),
            "scope: transition"
        );
        Transition::Entered { previous, next }
    }

    /// Start a fresh session, ending any previous one.
    pub fn begin_session(&mut self) -> Transition {
        self.enter(Some(ScopeId::session(SessionId::new())))
    }

    /// Select a project within the current session. Re-selecting the current
    /// project is a no-op; selecting it again after a switch gets a new epoch.
    pub fn select_project(&mut self, id: &str) -> Result<Transition, ScopeError> {
        let current = self.current.as_ref().ok_or(ScopeError::NoSession)?;
        if current.project_id() == Some(id) {
            return Ok(Transition::Unchanged);
        }
        self.next_epoch += 1;
        let next = current.with_project(id, self.next_epoch);
        Ok(self.enter(Some(next)))
    }

    pub fn clear_project(&mut self) -> Transition {
        match &self.current {
            Some(s) if s.project.is_some() => {
                let next = s.session_scope();
                self.enter(Some(next))
            }
            _ => Transition::Unchanged,
        }
    }

    pub fn end_session(&mut self) -> Transition {
        if self.current.is_none() {
            return Transition::Unchanged;
        }
        self.enter(None)
    }

    pub fn change(&mut self, change: &ScopeChange) -> Result<Transition, ScopeError> {
        match change {
            ScopeChange::BeginSession => Ok(self.begin_session()),
            ScopeChange::SelectProject(id) => self.select_project(id),
            ScopeChange::ClearProject => Ok(self.clear_project()),
            ScopeChange::EndSession => Ok(self.end_session()),
        }
    }
}
