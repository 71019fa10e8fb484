//! Persistence backends.

use crate::store::{MetaStoreError, MetaStoreResult};
use crate::types::{CommitRecord, LoadedRecords, RecordKey};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Durable home of committed records.
///
/// `commit` must be idempotent and atomic per batch; `load` returns the
/// latest committed version of every record.
pub trait PersistBackend: Send + Sync {
    fn commit(&self, batch: &[CommitRecord]) -> MetaStoreResult<()>;

    fn load(&self) -> MetaStoreResult<LoadedRecords>;
}

/// In-memory backend holding framed records.
///
/// Supports failure injection and corruption so tests can exercise
/// retry and recovery paths.
#[derive(Default)]
pub struct MemoryBackend {
    frames: Mutex<BTreeMap<RecordKey, Vec<u8>>>,
    fail_commits: AtomicU32,
    commits: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail without writing anything
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Number of successful commit batches
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Latest committed version of one record
    #[must_use]
    pub fn get(&self, key: RecordKey) -> Option<CommitRecord> {
        let frames = self.frames.lock();
        frames
            .get(&key)
            .and_then(|frame| CommitRecord::decode(frame).ok())
    }

    /// Flip a payload byte so the stored frame fails verification
    pub fn corrupt(&self, key: RecordKey) -> bool {
        let mut frames = self.frames.lock();
        match frames.get_mut(&key) {
            Some(frame) if frame.len() > 4 => {
                let last = frame.len() - 1;
                frame[last] ^= 0xff;
                true
            }
            _ => false,
        }
    }
}

impl PersistBackend for MemoryBackend {
    fn commit(&self, batch: &[CommitRecord]) -> MetaStoreResult<()> {
        let pending_failures = self.fail_commits.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_commits
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(MetaStoreError::Unavailable("injected commit failure".into()));
        }

        // Encode everything first so a bad record leaves the map untouched
        let mut encoded = Vec::with_capacity(batch.len());
        for record in batch {
            let frame = if record.is_delete() {
                None
            } else {
                Some(record.encode()?)
            };
            encoded.push((record.key, frame));
        }

        let mut frames = self.frames.lock();
        for (key, frame) in encoded {
            match frame {
                Some(frame) => {
                    frames.insert(key, frame);
                }
                None => {
                    frames.remove(&key);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> MetaStoreResult<LoadedRecords> {
        let frames = self.frames.lock();
        let mut out = LoadedRecords::default();
        for (key, frame) in frames.iter() {
            match CommitRecord::decode(frame) {
                Ok(record) => out.records.push(record),
                Err(e) => {
                    tracing::error!("Failed to decode record {:?}: {}", key, e);
                    out.corrupt.push(*key);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordBody;
    use arrayio_common::{SpId, SystemRecord};

    fn system(generation: u64, scale: u8) -> CommitRecord {
        CommitRecord::put(
            RecordKey::System,
            generation,
            SpId::B,
            RecordBody::System(SystemRecord {
                power_save_enabled: false,
                wakeup_interval_secs: 0,
                scale_percent: scale,
            }),
        )
    }

    #[test]
    fn test_injected_failure_writes_nothing() {
        let backend = MemoryBackend::new();
        backend.fail_next_commits(1);
        assert!(backend.commit(&[system(1, 10)]).is_err());
        assert!(backend.is_empty());

        backend.commit(&[system(1, 10)]).unwrap();
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.commit_count(), 1);
    }

    #[test]
    fn test_latest_version_wins() {
        let backend = MemoryBackend::new();
        backend.commit(&[system(1, 10), system(2, 20)]).unwrap();
        let stored = backend.get(RecordKey::System).unwrap();
        assert_eq!(stored.generation, 2);
    }

    #[test]
    fn test_corrupt_reported_on_load() {
        let backend = MemoryBackend::new();
        backend.commit(&[system(1, 10)]).unwrap();
        assert!(backend.corrupt(RecordKey::System));

        let loaded = backend.load().unwrap();
        assert!(loaded.records.is_empty());
        assert_eq!(loaded.corrupt, vec![RecordKey::System]);
    }
}
