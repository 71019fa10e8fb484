//! ArrayIO Metadata Store - persistence substrate
//!
//! Committed object records are framed as a crc32c followed by a bincode
//! payload. [`MetaStore`] keeps them in redb; [`MemoryBackend`] keeps them in
//! memory for tests and crash simulation. Both implement [`PersistBackend`].

pub mod backend;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use backend::{MemoryBackend, PersistBackend};
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
pub use types::{CommitRecord, LoadedRecords, RecordBody, RecordKey};
