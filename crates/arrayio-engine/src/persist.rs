//! Write-behind persistence queue.
//!
//! Transactions enqueue commit records while holding the store lock; the
//! queue is drained into a [`PersistBackend`] later, outside any critical
//! section. Pending records are coalesced per key so a checkpoint advanced a
//! thousand times between flushes costs one write.

use arrayio_common::{Error, Result};
use arrayio_meta_store::{CommitRecord, PersistBackend, RecordKey};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivery of flushed commits to the peer controller
pub trait PeerLink: Send + Sync {
    fn push(&self, records: &[CommitRecord]);
}

/// Peer link that buffers pushed records until drained; used to wire two
/// engines together in-process
#[derive(Default)]
pub struct BufferedPeerLink {
    buffer: Mutex<Vec<CommitRecord>>,
}

impl BufferedPeerLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<CommitRecord> {
        std::mem::take(&mut *self.buffer.lock())
    }
}

impl PeerLink for BufferedPeerLink {
    fn push(&self, records: &[CommitRecord]) {
        self.buffer.lock().extend_from_slice(records);
    }
}

/// Coalescing commit queue
#[derive(Default)]
pub struct PersistQueue {
    pending: Mutex<BTreeMap<RecordKey, CommitRecord>>,
    peer: Mutex<Option<Arc<dyn PeerLink>>>,
    /// Serializes flushes so batches reach the backend in queue order
    flushing: Mutex<()>,
}

impl PersistQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_peer(&self, peer: Arc<dyn PeerLink>) {
        *self.peer.lock() = Some(peer);
    }

    /// Queue a record, replacing any older pending version of the same key
    pub fn enqueue(&self, record: CommitRecord) {
        let mut pending = self.pending.lock();
        match pending.get(&record.key) {
            Some(existing) if existing.generation > record.generation => {}
            _ => {
                pending.insert(record.key, record);
            }
        }
    }

    pub fn enqueue_all(&self, records: impl IntoIterator<Item = CommitRecord>) {
        for record in records {
            self.enqueue(record);
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Latest pending version of a record
    #[must_use]
    pub fn pending(&self, key: RecordKey) -> Option<CommitRecord> {
        self.pending.lock().get(&key).cloned()
    }

    /// Commit everything pending. On failure the batch goes back on the
    /// queue (unless superseded meanwhile) and the error is returned.
    pub fn flush(&self, backend: &dyn PersistBackend) -> Result<usize> {
        let _flushing = self.flushing.lock();
        let batch: Vec<CommitRecord> = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending).into_values().collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        if let Err(e) = backend.commit(&batch) {
            warn!("Commit of {} records failed, requeueing: {}", batch.len(), e);
            let mut pending = self.pending.lock();
            for record in batch {
                pending.entry(record.key).or_insert(record);
            }
            return Err(Error::from(e));
        }

        debug!("Committed {} records", batch.len());
        let peer = self.peer.lock().clone();
        if let Some(peer) = peer {
            peer.push(&batch);
        }
        Ok(batch.len())
    }
}
