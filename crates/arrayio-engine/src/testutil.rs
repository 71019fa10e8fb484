//! Fixtures shared by unit tests

use crate::clock::ManualClock;
use crate::events::EventBus;
use crate::persist::PersistQueue;
use crate::records::{Fru, LogicalUnit, RaidGroup};
use crate::store::ObjectStore;
use arrayio_common::config::EngineConfig;
use arrayio_common::{
    DriveType, ExpansionCheckpoints, FruId, FruLocation, FruPersistentFlags, FruRecord, FruState,
    Lba, LuId, LuPersistentFlags, LuPowerPolicy, LuRecord, LuState, LuStatus, PartitionRecord,
    RaidGroupId, RaidGroupPersistentFlags, RaidGroupPowerPolicy, RaidGroupRecord, RaidType,
};
use std::sync::Arc;

pub struct TestStore {
    pub store: Arc<ObjectStore>,
    pub clock: Arc<ManualClock>,
    pub queue: Arc<PersistQueue>,
    pub events: Arc<EventBus>,
}

pub fn test_store() -> TestStore {
    let clock = Arc::new(ManualClock::new());
    let queue = Arc::new(PersistQueue::new());
    let events = Arc::new(EventBus::new());
    let store = Arc::new(ObjectStore::new(
        &EngineConfig::default(),
        queue.clone(),
        events.clone(),
        clock.clone(),
    ));
    TestStore {
        store,
        clock,
        queue,
        events,
    }
}

pub fn fru_record(enclosure: u8, slot: u16, capacity: u64) -> FruRecord {
    FruRecord {
        location: FruLocation::new(0, enclosure, slot),
        capacity,
        drive_type: DriveType::Sas,
        block_size: 520,
        flags: FruPersistentFlags::default(),
        partitions: Vec::new(),
        spare_info: None,
        death_reason: None,
    }
}

pub fn add_fru(store: &ObjectStore, record: FruRecord) -> FruId {
    store
        .transact(|txn| {
            let now = txn.now_secs();
            txn.insert_fru(|id| Fru::new(id, record, FruState::Ready, now))
        })
        .unwrap()
}

/// Bind a valid group over fresh drives, one partition each over `[0, end)`
pub fn add_group(
    store: &ObjectStore,
    raid_type: RaidType,
    width: u16,
    end: Lba,
    power_enabled: bool,
) -> (RaidGroupId, Vec<FruId>) {
    let base = store.read(|t| t.frus().count());
    let members: Vec<FruId> = (0..width)
        .map(|i| add_fru(store, fru_record(0, base as u16 + i, end * 2)))
        .collect();
    let rg = store
        .transact(|txn| {
            let now = txn.now_secs();
            let record = RaidGroupRecord {
                raid_type,
                members: members.clone(),
                flags: RaidGroupPersistentFlags {
                    valid: true,
                    ..RaidGroupPersistentFlags::default()
                },
                address_offset: 0,
                ending_address: end,
                expansion: ExpansionCheckpoints::default(),
                lus: Vec::new(),
                power_policy: RaidGroupPowerPolicy {
                    enabled: power_enabled,
                    idle_secs: 600,
                },
            };
            let rg = txn.insert_raid_group(|id| RaidGroup::new(id, record, now))?;
            for (position, fru) in members.iter().enumerate() {
                let drive = txn.fru_mut(*fru)?;
                let index = drive.record.free_partition_index(4).unwrap_or(0);
                drive
                    .record
                    .partitions
                    .push(PartitionRecord::new(index, rg, position as u16, 0, end));
            }
            Ok(rg)
        })
        .unwrap();
    (rg, members)
}

pub fn lu_record(raid_group: RaidGroupId, offset: Lba, capacity: u64) -> LuRecord {
    LuRecord {
        raid_group,
        offset,
        capacity,
        rebuild_priority: 0,
        verify_priority: 0,
        flags: LuPersistentFlags::default(),
        status: LuStatus::default(),
        power_policy: LuPowerPolicy::default(),
    }
}

pub fn add_lu(store: &ObjectStore, raid_group: RaidGroupId, state: LuState) -> LuId {
    store
        .transact(|txn| {
            let now = txn.now_secs();
            let lu = txn.insert_lu(|id| {
                let mut lu = LogicalUnit::new(id, lu_record(raid_group, 0, 1000), now);
                lu.state = state;
                lu
            })?;
            txn.raid_group_mut(raid_group)?.record.lus.push(lu);
            Ok(lu)
        })
        .unwrap()
}
