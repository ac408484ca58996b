//! Compute resources: machines, volumes, external addresses, images and sizes.

use cumulus_core::{KindId, ResourceKind};
use serde_json::Value;

use crate::{normalize_status, state_in, EXTERNAL_IP, IMAGE, MACHINE, SIZE, VOLUME};

/// Machine states that resolve on their own. `ERROR`, `ACTIVE`, `SHUTOFF`,
/// `PAUSED`, `SUSPENDED` and `VERIFY_RESIZE` (waits on the user) are terminal.
const MACHINE_BUSY: &[&str] = &["BUILD", "REBUILD", "REBOOT", "HARD_REBOOT", "RESIZE", "MIGRATING", "PASSWORD"];

pub struct Machine;

impl Machine {
    pub const LOGS: &'static str = "logs";
}

impl ResourceKind for Machine {
    fn id(&self) -> KindId { MACHINE }

    fn is_active(&self, record: &Value) -> bool {
        state_in(record, "status", MACHINE_BUSY)
    }

    fn transform(&self, record: Value) -> Value { normalize_status(record) }
}

const VOLUME_BUSY: &[&str] = &["CREATING", "ATTACHING", "DETACHING", "DELETING", "EXTENDING", "DOWNLOADING", "UPLOADING"];

pub struct Volume;

impl ResourceKind for Volume {
    fn id(&self) -> KindId { VOLUME }

    fn is_active(&self, record: &Value) -> bool {
        state_in(record, "status", VOLUME_BUSY)
    }

    fn transform(&self, record: Value) -> Value { normalize_status(record) }
}

pub struct ExternalIp;

impl ResourceKind for ExternalIp {
    fn id(&self) -> KindId { EXTERNAL_IP }
}

pub struct Image;

impl ResourceKind for Image {
    fn id(&self) -> KindId { IMAGE }

    fn is_active(&self, record: &Value) -> bool {
        state_in(record, "status", &["QUEUED", "SAVING", "IMPORTING"])
    }

    fn transform(&self, record: Value) -> Value { normalize_status(record) }
}

pub struct Size;

impl ResourceKind for Size {
    fn id(&self) -> KindId { SIZE }
}
