//! Persisted record layouts
//!
//! These structs are exactly what the persistence substrate stores. The
//! engine wraps each of them with runtime-only state; anything not reachable
//! from here is re-derived after a restart.

use crate::flags::{
    FruPersistentFlags, LuPersistentFlags, LuStatus, RaidGroupPersistentFlags, Scope,
};
use crate::region::RegionSet;
use crate::types::{
    CHECKPOINT_COMPLETE, CheckpointKind, DeathReason, DriveType, FruId, FruLocation, Lba, LuId,
    OpState, RaidGroupId, RaidType, SpareInfo,
};
use serde::{Deserialize, Serialize};

/// One checkpointed operation on a partition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub value: Lba,
    pub state: OpState,
}

impl CheckpointEntry {
    /// Nothing to do
    pub const COMPLETE: Self = Self {
        value: CHECKPOINT_COMPLETE,
        state: OpState::Complete,
    };

    /// Fresh pass starting at `start`
    #[must_use]
    pub const fn starting_at(start: Lba) -> Self {
        Self {
            value: start,
            state: OpState::InProgress,
        }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.value == CHECKPOINT_COMPLETE
    }
}

impl Default for CheckpointEntry {
    fn default() -> Self {
        Self::COMPLETE
    }
}

/// Slice of a drive that belongs to one RAID group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    /// Slot in the drive's partition table
    pub index: u8,
    pub raid_group: RaidGroupId,
    /// Position in the RAID group's member table
    pub position: u16,
    /// First block of the extent on this drive
    pub start: Lba,
    /// One past the last block of the extent
    pub end: Lba,
    /// Indexed by [`CheckpointKind::index`]
    pub checkpoints: [CheckpointEntry; 4],
    pub needs_rebuild: bool,
    /// Blocks at or above this point are rebuilt in full; below it only
    /// dirty regions are
    pub rebuild_from: Lba,
    pub dirty: RegionSet,
    /// Source of an in-flight proactive copy
    pub copy_source: bool,
}

impl PartitionRecord {
    /// A fully consistent partition with nothing pending
    #[must_use]
    pub fn new(index: u8, raid_group: RaidGroupId, position: u16, start: Lba, end: Lba) -> Self {
        Self {
            index,
            raid_group,
            position,
            start,
            end,
            checkpoints: [CheckpointEntry::COMPLETE; 4],
            needs_rebuild: false,
            rebuild_from: end,
            dirty: RegionSet::new(),
            copy_source: false,
        }
    }

    #[must_use]
    pub const fn checkpoint(&self, kind: CheckpointKind) -> &CheckpointEntry {
        &self.checkpoints[kind.index()]
    }

    pub const fn checkpoint_mut(&mut self, kind: CheckpointKind) -> &mut CheckpointEntry {
        &mut self.checkpoints[kind.index()]
    }

    /// Checkpoint value with the sentinel mapped to the partition end
    #[must_use]
    pub const fn normalized(&self, kind: CheckpointKind) -> Lba {
        let value = self.checkpoints[kind.index()].value;
        if value == CHECKPOINT_COMPLETE || value > self.end {
            self.end
        } else {
            value
        }
    }
}

/// Persisted drive record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FruRecord {
    pub location: FruLocation,
    /// Capacity in blocks
    pub capacity: u64,
    pub drive_type: DriveType,
    pub block_size: u32,
    pub flags: FruPersistentFlags,
    pub partitions: Vec<PartitionRecord>,
    pub spare_info: Option<SpareInfo>,
    pub death_reason: Option<DeathReason>,
}

impl FruRecord {
    #[must_use]
    pub fn partition(&self, index: u8) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.index == index)
    }

    pub fn partition_mut(&mut self, index: u8) -> Option<&mut PartitionRecord> {
        self.partitions.iter_mut().find(|p| p.index == index)
    }

    /// Partition this drive contributes to `raid_group`
    #[must_use]
    pub fn partition_for(&self, raid_group: RaidGroupId) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.raid_group == raid_group)
    }

    /// Lowest unused partition slot below `max`
    #[must_use]
    pub fn free_partition_index(&self, max: usize) -> Option<u8> {
        (0..max)
            .filter_map(|i| u8::try_from(i).ok())
            .find(|i| self.partition(*i).is_none())
    }
}

/// Expansion progress across the whole group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionCheckpoints {
    /// Group-relative address expanded so far
    pub logical: Lba,
    /// Per-member address expanded so far
    pub physical: Lba,
}

impl Default for ExpansionCheckpoints {
    fn default() -> Self {
        Self {
            logical: CHECKPOINT_COMPLETE,
            physical: CHECKPOINT_COMPLETE,
        }
    }
}

/// RAID group power-save policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGroupPowerPolicy {
    pub enabled: bool,
    pub idle_secs: u64,
}

impl Default for RaidGroupPowerPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_secs: 1800, // 30 minutes
        }
    }
}

/// LU power-save policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuPowerPolicy {
    pub enabled: bool,
    /// Overrides the RAID group idle time when set
    pub hibernate_delay_secs: Option<u64>,
    pub max_wake_latency_secs: u64,
}

impl Default for LuPowerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            hibernate_delay_secs: None,
            max_wake_latency_secs: 120,
        }
    }
}

/// Persisted RAID group record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGroupRecord {
    pub raid_type: RaidType,
    /// position -> drive
    pub members: Vec<FruId>,
    pub flags: RaidGroupPersistentFlags,
    pub address_offset: Lba,
    /// One past the last block used on each member
    pub ending_address: Lba,
    pub expansion: ExpansionCheckpoints,
    pub lus: Vec<LuId>,
    pub power_policy: RaidGroupPowerPolicy,
}

impl RaidGroupRecord {
    #[must_use]
    pub fn width(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn position_of(&self, fru: FruId) -> Option<usize> {
        self.members.iter().position(|m| *m == fru)
    }

    /// Blocks of user data the group exposes
    #[must_use]
    pub fn user_capacity(&self) -> u64 {
        let per_member = self.ending_address.saturating_sub(self.address_offset);
        per_member * self.raid_type.data_disks(self.width()) as u64
    }
}

/// Persisted LU record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuRecord {
    pub raid_group: RaidGroupId,
    /// Start of the unit within the RAID group address space
    pub offset: Lba,
    pub capacity: u64,
    pub rebuild_priority: u8,
    pub verify_priority: u8,
    pub flags: LuPersistentFlags,
    pub status: LuStatus,
    pub power_policy: LuPowerPolicy,
}

/// Persistent requestor bits of one scope, one word per service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGateRecord {
    pub scope: Scope,
    pub words: [u32; 10],
}

/// Array-wide settings that survive a restart
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub power_save_enabled: bool,
    pub wakeup_interval_secs: u64,
    pub scale_percent: u8,
}
