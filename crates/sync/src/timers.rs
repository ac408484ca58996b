//! Revocable single-shot timers, keyed by `(scope, kind, identity, purpose)`.
//!
//! `TimerBook` is pure bookkeeping. The runtime driver owns the actual sleeping
//! tasks and reports firings back with the token it was armed with; a firing
//! whose token is no longer live for its key is stale and dropped.

use std::fmt;

use cumulus_core::{Identity, KindId, Request, ScopeId};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Periodic list refresh.
    Refresh,
    /// Re-fetch of a single record that is still changing.
    Settle,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Purpose::Refresh => "refresh", Purpose::Settle => "settle" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub scope: ScopeId,
    pub kind: KindId,
    pub id: Option<Identity>,
    pub purpose: Purpose,
}

impl TimerKey {
    pub fn refresh(scope: ScopeId, kind: KindId) -> Self {
        Self { scope, kind, id: None, purpose: Purpose::Refresh }
    }

    pub fn settle(scope: ScopeId, kind: KindId, id: Identity) -> Self {
        Self { scope, kind, id: Some(id), purpose: Purpose::Settle }
    }
}

pub type TimerToken = u64;

#[derive(Debug, Clone)]
struct Armed {
    token: TimerToken,
    request: Request,
}

#[derive(Debug, Default)]
pub struct TimerBook {
    live: FxHashMap<TimerKey, Armed>,
    next_token: TimerToken,
}

impl TimerBook {
    pub fn new() -> Self { Self::default() }

    /// Arm `key` to emit `request`. Returns the new token and the token of the
    /// timer it replaced, which must be aborted.
    pub fn arm(&mut self, key: TimerKey, request: Request) -> (TimerToken, Option<TimerToken>) {
        self.next_token += 1;
        let token = self.next_token;
        let replaced = self.live.insert(key, Armed { token, request }).map(|a| a.token);
        (token, replaced)
    }

    pub fn revoke(&mut self, key: &TimerKey) -> Option<TimerToken> {
        self.live.remove(key).map(|a| a.token)
    }

    /// Revoke every timer whose key matches, in one step.
    pub fn revoke_where(&mut self, mut pred: impl FnMut(&TimerKey) -> bool) -> Vec<TimerToken> {
        let mut out = Vec::new();
        self.live.retain(|k, a| {
            if pred(k) {
                out.push(a.token);
                false
            } else {
                true
            }
        });
        out
    }

    /// Consume a firing. `None` when the token is stale.
    pub fn fire(&mut self, key: &TimerKey, token: TimerToken) -> Option<Request> {
        match self.live.get(key) {
            Some(a) if a.token == token => self.live.remove(key).map(|a| a.request),
            _ => None,
        }
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool { self.live.contains_key(key) }

    pub fn token(&self, key: &TimerKey) -> Option<TimerToken> { self.live.get(key).map(|a| a.token) }

    pub fn len(&self) -> usize { self.live.len() }
    pub fn is_empty(&self) -> bool { self.live.is_empty() }

    pub fn keys(&self) -> impl Iterator<Item = &TimerKey> + '_ { self.live.keys() }
}
