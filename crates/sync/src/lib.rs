//! Cumulus sync: scheduling rules, cross-kind effects, scope lifecycle and the engine runtime.
//!
//! The engine is split in two. [`EngineCore`] is a synchronous state machine
//! that turns inputs into commands; [`spawn_engine`] runs it on tokio, owning
//! the timer and transport tasks those commands ask for.

#![forbid(unsafe_code)]

use cumulus_core::KindId;

pub mod config;
pub mod driver;
pub mod effects;
pub mod engine;
pub mod notify;
pub mod rules;
pub mod scope;
pub mod timers;

pub use config::SyncConfig;
pub use driver::{spawn_engine, EngineHandle, RequestOptions};
pub use effects::{Effect, EffectTable, IdSource, Reaction, Trigger};
pub use engine::{Command, EngineCore, Input};
pub use notify::{Notice, Notifier};
pub use rules::{Directive, Scheduler};
pub use scope::{ScopeChange, ScopeController, ScopeError, Transition};
pub use timers::{Purpose, TimerBook, TimerKey, TimerToken};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine stopped")]
    Stopped,
    #[error("unknown resource kind: {0}")]
    UnknownKind(KindId),
    #[error(transparent)]
    Scope(#[from] ScopeError),
}
