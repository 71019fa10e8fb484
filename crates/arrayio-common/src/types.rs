//! Core type definitions for ArrayIO
//!
//! This module defines the identifiers and closed state enums shared by the
//! object store, the checkpoint tracker, the sparing engine, the power-save
//! propagator and the background-service arbiter.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Logical block address on a drive or within a RAID group
pub type Lba = u64;

/// Reserved checkpoint value meaning "nothing to do" / "complete"
pub const CHECKPOINT_COMPLETE: Lba = u64::MAX;

/// Identifier of a physical drive slot (field-replaceable unit)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("fru-{_0}")]
pub struct FruId(u32);

impl FruId {
    /// Create from a raw arena index
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Arena slot this id addresses
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for FruId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FruId({})", self.0)
    }
}

/// Identifier of a RAID group
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("rg-{_0}")]
pub struct RaidGroupId(u32);

impl RaidGroupId {
    /// Create from a raw arena index
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Arena slot this id addresses
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for RaidGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaidGroupId({})", self.0)
    }
}

/// Identifier of a logical unit
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("lu-{_0}")]
pub struct LuId(u32);

impl LuId {
    /// Create from a raw arena index
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Arena slot this id addresses
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for LuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuId({})", self.0)
    }
}

/// Object kinds held by the object store
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
pub enum ObjectType {
    #[display("fru")]
    Fru,
    #[display("raid-group")]
    RaidGroup,
    #[display("lu")]
    Lu,
}

/// Typed reference to any object in the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
pub enum ObjectRef {
    #[display("{_0}")]
    Fru(FruId),
    #[display("{_0}")]
    RaidGroup(RaidGroupId),
    #[display("{_0}")]
    Lu(LuId),
}

impl ObjectRef {
    /// Kind of object referenced
    #[must_use]
    pub const fn object_type(&self) -> ObjectType {
        match self {
            Self::Fru(_) => ObjectType::Fru,
            Self::RaidGroup(_) => ObjectType::RaidGroup,
            Self::Lu(_) => ObjectType::Lu,
        }
    }
}

/// Storage processor (controller) of a dual-controller array
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SpId {
    #[default]
    #[display("SPA")]
    A,
    #[display("SPB")]
    B,
}

impl SpId {
    /// The other controller
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Physical location of a drive slot
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{bus}_{enclosure}_{slot}")]
pub struct FruLocation {
    pub bus: u8,
    pub enclosure: u8,
    pub slot: u16,
}

impl FruLocation {
    #[must_use]
    pub const fn new(bus: u8, enclosure: u8, slot: u16) -> Self {
        Self {
            bus,
            enclosure,
            slot,
        }
    }
}

/// Drive performance tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum DriveType {
    #[default]
    #[display("sas")]
    Sas,
    #[display("nl-sas")]
    NlSas,
    #[display("flash")]
    Flash,
}

/// RAID layout of a group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RaidType {
    #[display("raid0")]
    Raid0,
    #[display("raid1")]
    Raid1,
    #[display("raid10")]
    Raid10,
    #[display("raid3")]
    Raid3,
    #[display("raid5")]
    Raid5,
    #[display("raid6")]
    Raid6,
}

impl RaidType {
    /// Smallest legal member count
    #[must_use]
    pub const fn min_width(self) -> usize {
        match self {
            Self::Raid0 => 1,
            Self::Raid1 | Self::Raid10 => 2,
            Self::Raid5 => 3,
            Self::Raid6 => 4,
            Self::Raid3 => 5,
        }
    }

    /// Largest legal member count
    #[must_use]
    pub const fn max_width(self) -> usize {
        match self {
            Self::Raid1 => 3,
            Self::Raid3 => 9,
            Self::Raid0 | Self::Raid10 | Self::Raid5 | Self::Raid6 => 16,
        }
    }

    /// Check whether `width` members form a legal group of this type
    #[must_use]
    pub const fn is_valid_width(self, width: usize) -> bool {
        if width < self.min_width() || width > self.max_width() {
            return false;
        }
        match self {
            Self::Raid10 => width % 2 == 0,
            Self::Raid3 => width == 5 || width == 9,
            _ => true,
        }
    }

    /// Number of members carrying user data (not redundancy)
    #[must_use]
    pub const fn data_disks(self, width: usize) -> usize {
        match self {
            Self::Raid0 => width,
            Self::Raid1 => 1,
            Self::Raid10 => width / 2,
            Self::Raid3 | Self::Raid5 => width.saturating_sub(1),
            Self::Raid6 => width.saturating_sub(2),
        }
    }

    /// Number of simultaneously failed members the layout survives
    #[must_use]
    pub const fn fault_tolerance(self, width: usize) -> usize {
        match self {
            Self::Raid0 => 0,
            Self::Raid1 => width.saturating_sub(1),
            Self::Raid10 | Self::Raid3 | Self::Raid5 => 1,
            Self::Raid6 => 2,
        }
    }

    /// Mirrored layouts rebuild by equalizing rather than reconstructing
    #[must_use]
    pub const fn is_mirror(self) -> bool {
        matches!(self, Self::Raid1 | Self::Raid10)
    }

    /// Whether the given failed positions break redundancy entirely.
    ///
    /// Raid10 is evaluated per mirror pair: losing both halves of any pair
    /// breaks the group, while one loss per pair only degrades it.
    #[must_use]
    pub fn is_broken(self, width: usize, failed: &BTreeSet<usize>) -> bool {
        match self {
            Self::Raid10 => (0..width / 2).any(|pair| {
                failed.contains(&(pair * 2)) && failed.contains(&(pair * 2 + 1))
            }),
            _ => failed.len() > self.fault_tolerance(width),
        }
    }
}

/// Lifecycle state of a drive slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum FruState {
    Removed,
    Faulted,
    PoweringUp,
    Defined,
    Ready,
}

impl FruState {
    /// Legal edges of the drive state machine
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Removed, Self::PoweringUp | Self::Defined)
                | (Self::Defined, Self::PoweringUp | Self::Ready | Self::Removed | Self::Faulted)
                | (Self::PoweringUp, Self::Ready | Self::Faulted | Self::Removed)
                | (Self::Ready, Self::Removed | Self::Faulted | Self::PoweringUp)
                | (Self::Faulted, Self::Removed | Self::PoweringUp)
        )
    }
}

/// Why a drive is not Ready
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum DeathReason {
    Removed,
    HardwareFault,
    LinkFault,
    EndOfLife,
    ProactivelySpared,
    DatabaseMismatch,
    Unknown,
}

/// Lifecycle state of a logical unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum LuState {
    Unbound,
    Binding,
    Ready,
    Degraded,
    Faulted,
    Unbinding,
}

impl LuState {
    /// Whether the unit is bound and serving (possibly degraded) I/O
    #[must_use]
    pub const fn is_bound(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded | Self::Faulted)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unbound, Self::Binding)
                | (Self::Binding, Self::Ready | Self::Degraded | Self::Faulted | Self::Unbinding)
                | (Self::Ready, Self::Degraded | Self::Faulted | Self::Unbinding)
                | (Self::Degraded, Self::Ready | Self::Faulted | Self::Unbinding)
                | (Self::Faulted, Self::Ready | Self::Degraded | Self::Unbinding)
                | (Self::Unbinding, Self::Unbound)
        )
    }
}

/// Derived health of a RAID group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RaidGroupState {
    Ready,
    Degraded,
    Broken,
}

/// Drive probation sub-state machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ProbationState {
    #[default]
    Idle,
    Init,
    Active,
    PoweringUp,
    Stopping,
    Cancel,
}

impl ProbationState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Init)
                | (Self::Init, Self::Active | Self::Cancel)
                | (Self::Active, Self::PoweringUp | Self::Stopping | Self::Cancel)
                | (Self::PoweringUp | Self::Stopping, Self::Idle | Self::Cancel)
                | (Self::Cancel, Self::Idle)
        )
    }
}

/// Power-save state of any object on the LU → RAID group → drive chain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum PowerSaveState {
    /// Not saving power
    #[default]
    Active,
    /// Idle timer expired, waiting for upstream agreement
    Entering,
    /// Saving power
    Hibernating,
    /// Leaving power save, waiting for downstream objects
    WakingUp,
}

/// Background operation tracked by a per-partition checkpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
pub enum CheckpointKind {
    Rebuild,
    Verify,
    Zero,
    Expansion,
}

impl CheckpointKind {
    pub const ALL: [Self; 4] = [Self::Rebuild, Self::Verify, Self::Zero, Self::Expansion];

    /// Slot in a partition's checkpoint array
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Rebuild => 0,
            Self::Verify => 1,
            Self::Zero => 2,
            Self::Expansion => 3,
        }
    }
}

/// Progress state of one checkpointed operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum OpState {
    #[default]
    Idle,
    InProgress,
    Complete,
}

/// How a spare was brought in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SpareKind {
    /// Replaces a failed member; the failed member's data is rebuilt
    #[display("hot-spare")]
    HotSpare,
    /// Copies a still-working member flagged end-of-life
    #[display("proactive")]
    Proactive,
}

/// Record of which spare replaced a drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpareInfo {
    pub kind: SpareKind,
    pub replacement: FruId,
}

/// Runtime power-save bookkeeping carried by every object on the chain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerSaveInfo {
    pub state: PowerSaveState,
    /// Engine time (seconds) of the last host I/O seen on this object
    pub last_io_secs: u64,
    pub seconds_since_last_io: u64,
    /// Effective enablement computed by the last pass
    pub power_saving_enabled: bool,
    pub idle_threshold_secs: u64,
    pub hibernating_since: Option<u64>,
    /// Stay Active until this time after a forced wake-up
    pub hold_awake_until: u64,
    /// Upstream objects that marked this edge as slumbering
    pub slumber_edges: BTreeSet<ObjectRef>,
}

impl PowerSaveInfo {
    /// Fresh bookkeeping for an object created at `now_secs`
    #[must_use]
    pub fn new(now_secs: u64) -> Self {
        Self {
            last_io_secs: now_secs,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_hibernating(&self) -> bool {
        self.state == PowerSaveState::Hibernating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(FruId::new(3).to_string(), "fru-3");
        assert_eq!(RaidGroupId::new(0).to_string(), "rg-0");
        assert_eq!(ObjectRef::Lu(LuId::new(7)).to_string(), "lu-7");
        assert_eq!(FruLocation::new(0, 1, 4).to_string(), "0_1_4");
    }

    #[test]
    fn test_raid_widths() {
        assert!(RaidType::Raid5.is_valid_width(5));
        assert!(!RaidType::Raid5.is_valid_width(2));
        assert!(!RaidType::Raid10.is_valid_width(5));
        assert!(RaidType::Raid3.is_valid_width(9));
        assert!(!RaidType::Raid3.is_valid_width(6));
        assert_eq!(RaidType::Raid6.data_disks(8), 6);
        assert_eq!(RaidType::Raid10.data_disks(4), 2);
    }

    #[test]
    fn test_raid5_broken() {
        let one: BTreeSet<usize> = [2].into_iter().collect();
        let two: BTreeSet<usize> = [1, 3].into_iter().collect();
        assert!(!RaidType::Raid5.is_broken(5, &one));
        assert!(RaidType::Raid5.is_broken(5, &two));
        assert!(!RaidType::Raid6.is_broken(6, &two));
    }

    #[test]
    fn test_raid10_pairs() {
        let split: BTreeSet<usize> = [0, 3].into_iter().collect();
        let pair: BTreeSet<usize> = [2, 3].into_iter().collect();
        assert!(!RaidType::Raid10.is_broken(4, &split));
        assert!(RaidType::Raid10.is_broken(4, &pair));
    }

    #[test]
    fn test_state_machines() {
        assert!(FruState::Ready.can_transition_to(FruState::Removed));
        assert!(!FruState::Removed.can_transition_to(FruState::Ready));
        assert!(LuState::Binding.can_transition_to(LuState::Ready));
        assert!(!LuState::Unbound.can_transition_to(LuState::Ready));
        assert!(ProbationState::Idle.can_transition_to(ProbationState::Init));
        assert!(!ProbationState::Idle.can_transition_to(ProbationState::Active));
        assert!(ProbationState::Cancel.can_transition_to(ProbationState::Idle));
    }
}
