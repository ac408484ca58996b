//! Cross-kind effects between the console's kinds.

use cumulus_core::{Family, OpFlag};
use cumulus_sync::{EffectTable, IdSource, Reaction, Trigger};

use crate::{CLUSTER, EXTERNAL_IP, IDENTITY_PROVIDER, MACHINE, PLATFORM, QUOTA, VOLUME};

/// Every registration, declared once per (source, trigger) pair.
pub fn effects() -> EffectTable {
    let owner = IdSource::BodyField("machine_id");
    let mark_owner = |set| Reaction::Mark { kind: MACHINE, id: owner, flag: OpFlag::Updating, set };

    let mut table = EffectTable::new()
        // Attaching or detaching an address updates its machine.
        .on(EXTERNAL_IP, Trigger::Requested(Family::Update), mark_owner(true))
        .on(EXTERNAL_IP, Trigger::Succeeded(Family::Update), mark_owner(false))
        .on(EXTERNAL_IP, Trigger::Failed(Family::Update), mark_owner(false))
        .on(EXTERNAL_IP, Trigger::Succeeded(Family::Update), Reaction::FetchOne(MACHINE, owner))
        .on(VOLUME, Trigger::Succeeded(Family::Update), Reaction::FetchOne(MACHINE, owner))
        // A new platform provisions the project's identity provider.
        .on(PLATFORM, Trigger::Succeeded(Family::Create), Reaction::FetchOne(IDENTITY_PROVIDER, IdSource::Project))
        // A deleted machine may have freed its address.
        .on(MACHINE, Trigger::Succeeded(Family::Delete), Reaction::RefreshList(EXTERNAL_IP))
        .on(MACHINE, Trigger::NotFound, Reaction::RefreshList(EXTERNAL_IP));

    for source in [MACHINE, VOLUME, CLUSTER] {
        for family in [Family::Create, Family::Delete] {
            table = table.on(source, Trigger::Succeeded(family), Reaction::RefreshList(QUOTA));
        }
    }
    table
}
