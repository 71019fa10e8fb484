//! Configuration types for ArrayIO
//!
//! This module defines configuration structures used across components.

use crate::types::SpId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for ArrayIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Object store limits and identity
    pub engine: EngineConfig,
    /// Power-save propagation
    pub power_save: PowerSaveConfig,
    /// Background operation pacing
    pub background: BackgroundConfig,
    /// Spare selection and automatic sparing
    pub sparing: SparingConfig,
    /// Persistence substrate
    pub persist: PersistConfig,
}

/// Object store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Controller this engine runs on
    pub local_sp: SpId,
    pub max_frus: usize,
    pub max_raid_groups: usize,
    pub max_lus: usize,
    /// Partitions per drive
    pub max_partitions: usize,
    /// Dirty-region granularity in blocks
    pub dirty_chunk_blocks: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_sp: SpId::A,
            max_frus: 1000,
            max_raid_groups: 512,
            max_lus: 4096,
            max_partitions: 4,
            dirty_chunk_blocks: 2048, // 1 MiB at 512-byte blocks
        }
    }
}

/// Power-save configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSaveConfig {
    /// Array-wide switch
    pub system_enabled: bool,
    /// Idle time for drives that belong to no RAID group
    pub default_idle_secs: u64,
    /// Forced wake-up period while hibernating (0 disables)
    pub wakeup_interval_secs: u64,
    /// How long a forced wake-up keeps the chain active
    pub wake_hold_secs: u64,
}

impl Default for PowerSaveConfig {
    fn default() -> Self {
        Self {
            system_enabled: false,
            default_idle_secs: 1800,     // 30 minutes
            wakeup_interval_secs: 86400, // daily sniff pass
            wake_hold_secs: 60,
        }
    }
}

/// Background operation pacing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Global throughput scale (0-100)
    pub scale_percent: u8,
    /// Per-service rate at full scale
    pub blocks_per_sec: u64,
    /// Largest range handed out in one step
    pub max_step_blocks: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            scale_percent: 100,
            blocks_per_sec: 65536, // 32 MiB/s at 512-byte blocks
            max_step_blocks: 8192,
        }
    }
}

/// How a spare is chosen among eligible candidates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SparePolicy {
    /// Lowest drive id wins
    #[default]
    FirstFit,
    /// Same enclosure first, then smallest sufficient capacity
    BestFit,
}

/// Sparing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SparingConfig {
    pub policy: SparePolicy,
    /// How long a member may stay out before a spare replaces it
    pub permanent_spare_delay_secs: u64,
    /// Run the automatic sparing pass on every tick
    pub auto_swap: bool,
}

impl Default for SparingConfig {
    fn default() -> Self {
        Self {
            policy: SparePolicy::FirstFit,
            permanent_spare_delay_secs: 300, // 5 minutes
            auto_swap: true,
        }
    }
}

/// Persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// redb database file
    pub path: PathBuf,
    /// Flush the commit queue at the end of every tick
    pub flush_on_tick: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/arrayio/meta.redb"),
            flush_on_tick: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"sparing": {"policy": "best-fit"}}"#).unwrap();
        assert_eq!(config.sparing.policy, SparePolicy::BestFit);
        assert_eq!(config.sparing.permanent_spare_delay_secs, 300);
        assert_eq!(config.engine.max_partitions, 4);
        assert_eq!(config.background.scale_percent, 100);
    }
}
