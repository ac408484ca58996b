//! Account-level resources.

use std::time::Duration;

use cumulus_core::{field_identity, Identity, KindId, ResourceKind, ScopeLevel};
use serde_json::Value;

use crate::{normalize_status, state_in, IDENTITY_PROVIDER, PLATFORM, QUOTA, TENANCY};

/// Projects the user can select. Lives for the whole session.
pub struct Tenancy;

impl ResourceKind for Tenancy {
    fn id(&self) -> KindId { TENANCY }
    fn level(&self) -> ScopeLevel { ScopeLevel::Session }
    fn poll_interval(&self) -> Duration { Duration::from_secs(30 * 60) }
}

/// Usage per limited resource, keyed by the resource name.
pub struct Quota;

impl ResourceKind for Quota {
    fn id(&self) -> KindId { QUOTA }
    fn identity(&self, record: &Value) -> Option<Identity> { field_identity(record, "resource") }
}

pub struct Platform;

impl ResourceKind for Platform {
    fn id(&self) -> KindId { PLATFORM }

    fn is_active(&self, record: &Value) -> bool {
        state_in(record, "status", &["CREATING", "UPDATING", "DELETING"])
    }

    fn transform(&self, record: Value) -> Value { normalize_status(record) }
}

/// One identity provider per project, keyed by the project id.
pub struct IdentityProvider;

impl ResourceKind for IdentityProvider {
    fn id(&self) -> KindId { IDENTITY_PROVIDER }

    fn identity(&self, record: &Value) -> Option<Identity> {
        field_identity(record, "project_id").or_else(|| field_identity(record, "id"))
    }

    fn poll_interval(&self) -> Duration { Duration::from_secs(5 * 60) }
}
