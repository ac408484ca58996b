//! Engine configuration, overridable from the environment.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncConfig {
    /// Capacity of the engine's input queue.
    pub queue_cap: usize,
    /// Capacity of the notice broadcast channel.
    pub notice_cap: usize,
    /// Replaces every kind's list refresh interval when set.
    pub poll_override: Option<Duration>,
    /// Replaces every kind's settle delay when set.
    pub settle_override: Option<Duration>,
    /// Issue a list fetch for every kind whose scope becomes current.
    pub prime_on_enter: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { queue_cap: 1024, notice_cap: 64, poll_override: None, settle_override: None, prime_on_enter: false }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl SyncConfig {
    /// Defaults overlaid with `CUMULUS_QUEUE_CAP`, `CUMULUS_NOTICE_CAP`,
    /// `CUMULUS_POLL_SECS`, `CUMULUS_SETTLE_MS` and `CUMULUS_PRIME`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_cap: env_parse("CUMULUS_QUEUE_CAP").unwrap_or(d.queue_cap).max(1),
            notice_cap: env_parse("CUMULUS_NOTICE_CAP").unwrap_or(d.notice_cap).max(1),
            poll_override: env_parse::<u64>("CUMULUS_POLL_SECS").map(Duration::from_secs),
            settle_override: env_parse::<u64>("CUMULUS_SETTLE_MS").map(Duration::from_millis),
            prime_on_enter: env_parse("CUMULUS_PRIME").unwrap_or(d.prime_on_enter),
        }
    }
}
