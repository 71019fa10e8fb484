//! Persistent record store backed by redb.
//!
//! A commit batch is written in a single redb write transaction, so a batch
//! either lands completely or not at all. Writes are idempotent: replaying a
//! batch leaves the same table contents.

use crate::backend::PersistBackend;
use crate::tables;
use crate::types::{CommitRecord, LoadedRecords, RecordKey};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use tracing::{debug, error};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for arrayio_common::Error {
    fn from(e: MetaStoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent record store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            for table in tables::ALL {
                let _t = write_txn.open_table(table)?;
            }
        }
        write_txn.commit()?;

        debug!("Opened meta store at {}", path.display());
        Ok(Self { db })
    }

    fn write_batch(&self, batch: &[CommitRecord]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            for record in batch {
                let mut table = write_txn.open_table(record.key.table())?;
                let key = record.key.table_key();
                if record.is_delete() {
                    table.remove(key.as_str())?;
                } else {
                    let frame = record.encode()?;
                    table.insert(key.as_str(), frame.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_table(
        &self,
        name: &str,
        table_def: TableDefinition<&str, &[u8]>,
        out: &mut LoadedRecords,
    ) -> MetaStoreResult<()> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match CommitRecord::decode(entry.1.value()) {
                Ok(record) => out.records.push(record),
                Err(e) => {
                    error!("Failed to decode {} entry '{}': {}", name, key, e);
                    if let Some(record_key) = RecordKey::from_table_key(name, &key) {
                        out.corrupt.push(record_key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of entries across all tables
    pub fn entry_count(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let mut total = 0;
        for table_def in tables::ALL {
            let table = read_txn.open_table(table_def)?;
            total += table.len()?;
        }
        Ok(total)
    }

    /// Overwrite one entry with raw bytes, bypassing framing
    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: RecordKey, bytes: &[u8]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(key.table())?;
            table.insert(key.table_key().as_str(), bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl PersistBackend for MetaStore {
    fn commit(&self, batch: &[CommitRecord]) -> MetaStoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.write_batch(batch).inspect_err(|e| {
            error!("Failed to commit batch of {} records: {}", batch.len(), e);
        })
    }

    fn load(&self) -> MetaStoreResult<LoadedRecords> {
        let mut out = LoadedRecords::default();
        self.load_table("frus", tables::FRUS, &mut out)?;
        self.load_table("raid_groups", tables::RAID_GROUPS, &mut out)?;
        self.load_table("lus", tables::LUS, &mut out)?;
        self.load_table("service_gates", tables::SERVICE_GATES, &mut out)?;
        self.load_table("system", tables::SYSTEM, &mut out)?;
        Ok(out)
    }
}
