//! Cumulus resource kinds: the per-kind rules and the table wiring them together.

#![forbid(unsafe_code)]

use cumulus_core::{KindId, KindRegistry};
use serde_json::Value;

mod account;
mod cluster;
mod compute;
mod wiring;

pub use account::{IdentityProvider, Platform, Quota, Tenancy};
pub use cluster::Cluster;
pub use compute::{ExternalIp, Image, Machine, Size, Volume};
pub use wiring::effects;

pub const TENANCY: KindId = KindId("tenancy");
pub const QUOTA: KindId = KindId("quota");
pub const IMAGE: KindId = KindId("image");
pub const SIZE: KindId = KindId("size");
pub const MACHINE: KindId = KindId("machine");
pub const VOLUME: KindId = KindId("volume");
pub const EXTERNAL_IP: KindId = KindId("external_ip");
pub const CLUSTER: KindId = KindId("cluster");
pub const PLATFORM: KindId = KindId("platform");
pub const IDENTITY_PROVIDER: KindId = KindId("identity_provider");

/// Every kind the console mirrors.
pub fn registry() -> KindRegistry {
    KindRegistry::new()
        .with(Tenancy)
        .with(Quota)
        .with(Image)
        .with(Size)
        .with(Machine)
        .with(Volume)
        .with(ExternalIp)
        .with(Cluster)
        .with(Platform)
        .with(IdentityProvider)
}

/// Whether `record[field]` is one of `states` (case-insensitive).
pub(crate) fn state_in(record: &Value, field: &str, states: &[&str]) -> bool {
    match record.get(field).and_then(Value::as_str) {
        Some(s) => states.iter().any(|st| st.eq_ignore_ascii_case(s)),
        None => false,
    }
}

/// Upper-case the `status` field so predicates see one spelling.
pub(crate) fn normalize_status(mut record: Value) -> Value {
    if let Some(s) = record.get("status").and_then(Value::as_str).map(str::to_ascii_uppercase) {
        record["status"] = Value::String(s);
    }
    record
}
