//! Redb table definitions for persistent object records.

use redb::TableDefinition;

// Key: zero-padded object id, Value: crc32c + bincode CommitRecord
pub const FRUS: TableDefinition<&str, &[u8]> = TableDefinition::new("frus");
pub const RAID_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("raid_groups");
pub const LUS: TableDefinition<&str, &[u8]> = TableDefinition::new("lus");

// Key: scope name ("system", "rg-3", ...)
pub const SERVICE_GATES: TableDefinition<&str, &[u8]> = TableDefinition::new("service_gates");

// Single key "system"
pub const SYSTEM: TableDefinition<&str, &[u8]> = TableDefinition::new("system");

pub const ALL: [TableDefinition<&str, &[u8]>; 5] = [FRUS, RAID_GROUPS, LUS, SERVICE_GATES, SYSTEM];
