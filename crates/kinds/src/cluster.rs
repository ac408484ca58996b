//! Managed container clusters.
//!
//! Cluster deletion is soft: the delete returns the record in `DELETING` and
//! single fetches keep answering until the backend reports not-found.
//!
//! A cluster with autohealing enabled that reports itself unhealthy is kept
//! active so its recovery is tracked. This only holds while the cluster is in
//! a settled running state; a failure status or disabling autohealing ends it.
//! It terminates only if the backend eventually heals or fails the cluster.

use cumulus_core::{KindId, ResourceKind};
use serde_json::Value;

use crate::{normalize_status, state_in, CLUSTER};

const BUSY: &[&str] = &[
    "CONFIGURING",
    "CREATING",
    "UPDATING",
    "UPGRADING",
    "DELETING",
    "CREATE_IN_PROGRESS",
    "UPDATE_IN_PROGRESS",
    "DELETE_IN_PROGRESS",
];

const RUNNING: &[&str] = &["READY", "RUNNING", "CREATE_COMPLETE", "UPDATE_COMPLETE"];

pub struct Cluster;

impl Cluster {
    fn healing(record: &Value) -> bool {
        let autohealing = record.get("autohealing_enabled").and_then(Value::as_bool).unwrap_or(false);
        autohealing && state_in(record, "health_status", &["UNHEALTHY"]) && state_in(record, "status", RUNNING)
    }
}

impl ResourceKind for Cluster {
    fn id(&self) -> KindId { CLUSTER }

    fn is_active(&self, record: &Value) -> bool {
        state_in(record, "status", BUSY) || Self::healing(record)
    }

    fn transform(&self, record: Value) -> Value { normalize_status(record) }
}
