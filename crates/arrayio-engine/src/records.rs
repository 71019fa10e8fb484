//! In-memory object records.
//!
//! Each record wraps its persisted layout (`record`) with the runtime-only
//! state the engine re-derives after a restart.

use arrayio_common::{
    Error, FruFlag, FruId, FruRecord, FruRuntimeFlags, FruState, LuId, LuRecord, LuRuntimeFlags,
    LuState, PartitionRecord, PowerSaveInfo, ProbationState, RaidGroupId, RaidGroupRecord,
    RaidGroupRuntimeFlags, Result,
};
use serde::Serialize;
use std::collections::BTreeSet;

/// Drive slot record
#[derive(Clone, Debug, Serialize)]
pub struct Fru {
    pub id: FruId,
    /// Persisted version counter
    pub generation: u64,
    pub record: FruRecord,
    pub state: FruState,
    /// Engine time (seconds) of the last state change
    pub state_changed_at: u64,
    pub runtime: FruRuntimeFlags,
    pub probation: ProbationState,
    pub power: PowerSaveInfo,
    /// Partition slots with rebuild logging active
    pub logging: BTreeSet<u8>,
}

impl Fru {
    #[must_use]
    pub fn new(id: FruId, record: FruRecord, state: FruState, now_secs: u64) -> Self {
        Self {
            id,
            generation: 0,
            record,
            state,
            state_changed_at: now_secs,
            runtime: FruRuntimeFlags::default(),
            probation: ProbationState::Idle,
            power: PowerSaveInfo::new(now_secs),
            logging: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == FruState::Ready
    }

    #[must_use]
    pub const fn is_flag_set(&self, flag: FruFlag) -> bool {
        flag.get(&self.record.flags, &self.runtime)
    }

    pub fn partition(&self, index: u8) -> Result<&PartitionRecord> {
        self.record
            .partition(index)
            .ok_or_else(|| Error::not_found(format!("{} partition {index}", self.id)))
    }

    pub fn partition_mut(&mut self, index: u8) -> Result<&mut PartitionRecord> {
        let id = self.id;
        self.record
            .partition_mut(index)
            .ok_or_else(|| Error::not_found(format!("{id} partition {index}")))
    }

    #[must_use]
    pub fn is_logging(&self, index: u8) -> bool {
        self.logging.contains(&index)
    }

    /// Any partition with outstanding rebuild work
    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        self.record.partitions.iter().any(|p| p.needs_rebuild)
    }

    /// RAID groups this drive contributes to
    pub fn raid_groups(&self) -> impl Iterator<Item = RaidGroupId> + '_ {
        self.record.partitions.iter().map(|p| p.raid_group)
    }

    /// Move to `next`, enforcing the drive state machine
    pub fn transition(&mut self, next: FruState, now_secs: u64) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition(format!(
                "{}: {} -> {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.state_changed_at = now_secs;
        Ok(())
    }
}

/// RAID group record
#[derive(Clone, Debug, Serialize)]
pub struct RaidGroup {
    pub id: RaidGroupId,
    pub generation: u64,
    pub record: RaidGroupRecord,
    pub runtime: RaidGroupRuntimeFlags,
    pub power: PowerSaveInfo,
}

impl RaidGroup {
    #[must_use]
    pub fn new(id: RaidGroupId, record: RaidGroupRecord, now_secs: u64) -> Self {
        Self {
            id,
            generation: 0,
            record,
            runtime: RaidGroupRuntimeFlags::default(),
            power: PowerSaveInfo::new(now_secs),
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.record.flags.valid
    }

    /// Expansion, defragment, unbind or quiesce in progress
    #[must_use]
    pub const fn is_reconfiguring(&self) -> bool {
        self.record.flags.expanding
            || self.record.flags.defragmenting
            || self.runtime.unbinding
            || self.runtime.busy
    }
}

/// Logical unit record
#[derive(Clone, Debug, Serialize)]
pub struct LogicalUnit {
    pub id: LuId,
    pub generation: u64,
    pub record: LuRecord,
    pub state: LuState,
    pub runtime: LuRuntimeFlags,
    pub power: PowerSaveInfo,
}

impl LogicalUnit {
    #[must_use]
    pub fn new(id: LuId, record: LuRecord, now_secs: u64) -> Self {
        Self {
            id,
            generation: 0,
            record,
            state: LuState::Unbound,
            runtime: LuRuntimeFlags::default(),
            power: PowerSaveInfo::new(now_secs),
        }
    }

    /// Move to `next`, enforcing the LU state machine
    pub fn transition(&mut self, next: LuState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition(format!(
                "{}: {} -> {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Borrowed view of any record, for type predicates
#[derive(Clone, Copy, Debug)]
pub enum ObjectRecord<'a> {
    Fru(&'a Fru),
    RaidGroup(&'a RaidGroup),
    Lu(&'a LogicalUnit),
}
