//! Named-boolean flag sets
//!
//! Every object carries two flag structs: the persistent half is part of the
//! committed record, the runtime half is rebuilt after a restart. Moving a
//! field between the two structs is the only way to change whether it
//! persists.

use crate::types::{FruId, LuId, RaidGroupId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted drive flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FruPersistentFlags {
    pub hot_spare: bool,
    pub needs_db_rebuild: bool,
    /// End of life reported; a proactive spare was requested
    pub end_of_life: bool,
    /// Joined its RAID groups as a spare
    pub spared_in: bool,
}

/// Drive flags rebuilt after restart
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FruRuntimeFlags {
    pub update_in_progress: bool,
    pub swap_in_progress: bool,
}

/// Single drive flag, addressable by name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FruFlag {
    HotSpare,
    NeedsDbRebuild,
    EndOfLife,
    SparedIn,
    UpdateInProgress,
    SwapInProgress,
}

impl FruFlag {
    #[must_use]
    pub const fn get(self, persistent: &FruPersistentFlags, runtime: &FruRuntimeFlags) -> bool {
        match self {
            Self::HotSpare => persistent.hot_spare,
            Self::NeedsDbRebuild => persistent.needs_db_rebuild,
            Self::EndOfLife => persistent.end_of_life,
            Self::SparedIn => persistent.spared_in,
            Self::UpdateInProgress => runtime.update_in_progress,
            Self::SwapInProgress => runtime.swap_in_progress,
        }
    }

    pub const fn set(
        self,
        persistent: &mut FruPersistentFlags,
        runtime: &mut FruRuntimeFlags,
        value: bool,
    ) {
        match self {
            Self::HotSpare => persistent.hot_spare = value,
            Self::NeedsDbRebuild => persistent.needs_db_rebuild = value,
            Self::EndOfLife => persistent.end_of_life = value,
            Self::SparedIn => persistent.spared_in = value,
            Self::UpdateInProgress => runtime.update_in_progress = value,
            Self::SwapInProgress => runtime.swap_in_progress = value,
        }
    }
}

/// Persisted RAID group flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGroupPersistentFlags {
    pub valid: bool,
    pub expanding: bool,
    pub defragmenting: bool,
    pub zeroing: bool,
}

/// RAID group flags rebuilt after restart
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGroupRuntimeFlags {
    pub busy: bool,
    pub unbinding: bool,
}

/// Persisted LU flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuPersistentFlags {
    pub needs_background_verify: bool,
    pub sniff_verify_enabled: bool,
}

/// LU flags rebuilt after restart
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuRuntimeFlags {
    pub capacity_notify_needed: bool,
}

/// Which controllers have the unit bound
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuStatus {
    pub bound_by_spa: bool,
    pub bound_by_spb: bool,
    pub unbind_queued: bool,
}

/// Background services gated by the arbiter
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BackgroundService {
    Swap,
    DbRebuild,
    Rebuild,
    Equalize,
    ProactiveCopy,
    BackgroundVerify,
    LunZero,
    DiskZero,
    ExpansionDefrag,
    SniffVerify,
}

impl BackgroundService {
    pub const COUNT: usize = 10;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Swap,
        Self::DbRebuild,
        Self::Rebuild,
        Self::Equalize,
        Self::ProactiveCopy,
        Self::BackgroundVerify,
        Self::LunZero,
        Self::DiskZero,
        Self::ExpansionDefrag,
        Self::SniffVerify,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bit in the master gate word
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self.index()
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Swap => "swap",
            Self::DbRebuild => "db-rebuild",
            Self::Rebuild => "rebuild",
            Self::Equalize => "equalize",
            Self::ProactiveCopy => "proactive-copy",
            Self::BackgroundVerify => "background-verify",
            Self::LunZero => "lun-zero",
            Self::DiskZero => "disk-zero",
            Self::ExpansionDefrag => "expansion-defrag",
            Self::SniffVerify => "sniff-verify",
        }
    }

    /// Parse the kebab-case name used by the operator surface
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl fmt::Display for BackgroundService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parties that may hold a background service disabled
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Requestor {
    User,
    ErrorHandling,
    VerifyCommand,
    ExpansionDefrag,
    Unbind,
    PeerBoot,
    LunShrink,
    DbCommit,
    Quiesce,
    CacheDump,
    NeedsRebuild,
    Ndu,
    RegistryKey,
    VaultZero,
}

/// Whether a requestor's bit survives a restart
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persistence {
    Persistent,
    Runtime,
}

/// Requestor schema: the single source of truth for bit positions and
/// persistence of every requestor.
pub const REQUESTOR_SCHEMA: [(Requestor, Persistence); Requestor::COUNT] = [
    (Requestor::User, Persistence::Persistent),
    (Requestor::ErrorHandling, Persistence::Runtime),
    (Requestor::VerifyCommand, Persistence::Runtime),
    (Requestor::ExpansionDefrag, Persistence::Persistent),
    (Requestor::Unbind, Persistence::Runtime),
    (Requestor::PeerBoot, Persistence::Runtime),
    (Requestor::LunShrink, Persistence::Persistent),
    (Requestor::DbCommit, Persistence::Runtime),
    (Requestor::Quiesce, Persistence::Runtime),
    (Requestor::CacheDump, Persistence::Runtime),
    (Requestor::NeedsRebuild, Persistence::Persistent),
    (Requestor::Ndu, Persistence::Runtime),
    (Requestor::RegistryKey, Persistence::Persistent),
    (Requestor::VaultZero, Persistence::Runtime),
];

impl Requestor {
    pub const COUNT: usize = 14;

    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    #[must_use]
    pub const fn persistence(self) -> Persistence {
        REQUESTOR_SCHEMA[self as usize].1
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ErrorHandling => "error-handling",
            Self::VerifyCommand => "verify-command",
            Self::ExpansionDefrag => "expansion-defrag",
            Self::Unbind => "unbind",
            Self::PeerBoot => "peer-boot",
            Self::LunShrink => "lun-shrink",
            Self::DbCommit => "db-commit",
            Self::Quiesce => "quiesce",
            Self::CacheDump => "cache-dump",
            Self::NeedsRebuild => "needs-rebuild",
            Self::Ndu => "ndu",
            Self::RegistryKey => "registry-key",
            Self::VaultZero => "vault-zero",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        REQUESTOR_SCHEMA
            .iter()
            .map(|(r, _)| *r)
            .find(|r| r.name() == name)
    }
}

impl fmt::Display for Requestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every requestor bit set: the service is enabled
pub const ALL_REQUESTORS: u32 = (1 << Requestor::COUNT) - 1;

/// Requestor bits that are committed to the persistence substrate
pub const PERSISTENT_REQUESTORS: u32 = persistent_mask();

const fn persistent_mask() -> u32 {
    let mut mask = 0;
    let mut i = 0;
    while i < REQUESTOR_SCHEMA.len() {
        if matches!(REQUESTOR_SCHEMA[i].1, Persistence::Persistent) {
            mask |= REQUESTOR_SCHEMA[i].0.bit();
        }
        i += 1;
    }
    mask
}

/// Decoded view of a requestor word: `true` means the requestor allows the
/// service to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestorFlags {
    pub user: bool,
    pub error_handling: bool,
    pub verify_command: bool,
    pub expansion_defrag: bool,
    pub unbind: bool,
    pub peer_boot: bool,
    pub lun_shrink: bool,
    pub db_commit: bool,
    pub quiesce: bool,
    pub cache_dump: bool,
    pub needs_rebuild: bool,
    pub ndu: bool,
    pub registry_key: bool,
    pub vault_zero: bool,
}

impl RequestorFlags {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            user: bits & Requestor::User.bit() != 0,
            error_handling: bits & Requestor::ErrorHandling.bit() != 0,
            verify_command: bits & Requestor::VerifyCommand.bit() != 0,
            expansion_defrag: bits & Requestor::ExpansionDefrag.bit() != 0,
            unbind: bits & Requestor::Unbind.bit() != 0,
            peer_boot: bits & Requestor::PeerBoot.bit() != 0,
            lun_shrink: bits & Requestor::LunShrink.bit() != 0,
            db_commit: bits & Requestor::DbCommit.bit() != 0,
            quiesce: bits & Requestor::Quiesce.bit() != 0,
            cache_dump: bits & Requestor::CacheDump.bit() != 0,
            needs_rebuild: bits & Requestor::NeedsRebuild.bit() != 0,
            ndu: bits & Requestor::Ndu.bit() != 0,
            registry_key: bits & Requestor::RegistryKey.bit() != 0,
            vault_zero: bits & Requestor::VaultZero.bit() != 0,
        }
    }

    /// Requestors currently holding the service off
    #[must_use]
    pub fn disabled_by(bits: u32) -> Vec<Requestor> {
        REQUESTOR_SCHEMA
            .iter()
            .map(|(r, _)| *r)
            .filter(|r| bits & r.bit() == 0)
            .collect()
    }
}

/// Scope a requestor word applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    System,
    RaidGroup(RaidGroupId),
    Lu(LuId),
    Fru(FruId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::RaidGroup(id) => write!(f, "{id}"),
            Self::Lu(id) => write!(f, "{id}"),
            Self::Fru(id) => write!(f, "{id}"),
        }
    }
}
