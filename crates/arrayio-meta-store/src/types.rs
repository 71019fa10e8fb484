//! Commit record types and on-disk framing.

use crate::store::{MetaStoreError, MetaStoreResult};
use crate::tables;
use arrayio_common::{
    FruId, FruRecord, LuId, LuRecord, RaidGroupId, RaidGroupRecord, Scope, ServiceGateRecord,
    SpId, SystemRecord,
};
use redb::TableDefinition;
use serde::{Deserialize, Serialize};

/// Identity of a persisted record
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKey {
    Fru(FruId),
    RaidGroup(RaidGroupId),
    Lu(LuId),
    ServiceGate(Scope),
    System,
}

impl RecordKey {
    /// Table this record lives in
    #[must_use]
    pub const fn table(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Self::Fru(_) => tables::FRUS,
            Self::RaidGroup(_) => tables::RAID_GROUPS,
            Self::Lu(_) => tables::LUS,
            Self::ServiceGate(_) => tables::SERVICE_GATES,
            Self::System => tables::SYSTEM,
        }
    }

    /// Key string inside its table
    #[must_use]
    pub fn table_key(&self) -> String {
        match self {
            Self::Fru(id) => format!("{:08}", id.as_u32()),
            Self::RaidGroup(id) => format!("{:08}", id.as_u32()),
            Self::Lu(id) => format!("{:08}", id.as_u32()),
            Self::ServiceGate(scope) => scope.to_string(),
            Self::System => "system".to_string(),
        }
    }

    /// Recover the key of an entry whose payload could not be decoded
    #[must_use]
    pub fn from_table_key(table: &str, key: &str) -> Option<Self> {
        let id = || key.parse::<u32>().ok();
        match table {
            "frus" => id().map(|raw| Self::Fru(FruId::new(raw))),
            "raid_groups" => id().map(|raw| Self::RaidGroup(RaidGroupId::new(raw))),
            "lus" => id().map(|raw| Self::Lu(LuId::new(raw))),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Payload of a persisted record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordBody {
    Fru(FruRecord),
    RaidGroup(RaidGroupRecord),
    Lu(LuRecord),
    ServiceGate(ServiceGateRecord),
    System(SystemRecord),
}

/// One committed change: a new record version, or a deletion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub key: RecordKey,
    /// Bumped every time the persisted projection changes
    pub generation: u64,
    /// Controller that produced the change
    pub origin: SpId,
    /// Wall-clock commit time (milliseconds since the Unix epoch)
    pub committed_at_ms: i64,
    /// `None` deletes the record
    pub body: Option<RecordBody>,
}

impl CommitRecord {
    #[must_use]
    pub fn put(key: RecordKey, generation: u64, origin: SpId, body: RecordBody) -> Self {
        Self {
            key,
            generation,
            origin,
            committed_at_ms: chrono::Utc::now().timestamp_millis(),
            body: Some(body),
        }
    }

    #[must_use]
    pub fn delete(key: RecordKey, generation: u64, origin: SpId) -> Self {
        Self {
            key,
            generation,
            origin,
            committed_at_ms: chrono::Utc::now().timestamp_millis(),
            body: None,
        }
    }

    #[must_use]
    pub const fn is_delete(&self) -> bool {
        self.body.is_none()
    }

    /// Frame as `crc32c (LE) || bincode payload`
    pub fn encode(&self) -> MetaStoreResult<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let crc = crc32c::crc32c(&payload);
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Verify and decode a frame produced by [`Self::encode`]
    pub fn decode(frame: &[u8]) -> MetaStoreResult<Self> {
        if frame.len() < 4 {
            return Err(MetaStoreError::Corrupt(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        let (crc_bytes, payload) = frame.split_at(4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(crc_bytes);
        let expected = u32::from_le_bytes(stored);
        let actual = crc32c::crc32c(payload);
        if expected != actual {
            return Err(MetaStoreError::ChecksumMismatch { expected, actual });
        }
        Ok(bincode::deserialize(payload)?)
    }
}

/// Everything read back from a backend at startup
#[derive(Clone, Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<CommitRecord>,
    /// Entries whose frame failed verification
    pub corrupt: Vec<RecordKey>,
}
