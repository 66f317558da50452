//! Snapshot-bound transactions and read-only views.
//!
//! Both handles pin one snapshot descriptor and hold the snap-spin read
//! side for their whole lifetime, which keeps snapshot transitions out
//! while they are open. Long-lived handles therefore delay flushes — the
//! price of observing one consistent cut of the key space.
//!
//! A [`Txn`] buffers its writes and applies them to the writable tier at
//! commit, serialized with other read-modify-write commits on the engine's
//! commit lock. A [`View`] only reads.
//!
//! Lock order is uniform across the engine: the snap-spin read side first,
//! then the commit lock. A commit already holds the read side (taken at
//! `begin_txn`) when it takes the commit lock, and the escalated CAS path
//! acquires the two in the same order, so neither can deadlock the other
//! against a pending snapshot transition.

use std::sync::Arc;

use tracing::trace;

use super::read::{ScanIter, y_get};
use super::snapshot::SnapshotRef;
use super::{Engine, EngineError, Entry};

enum TxnOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8>, lsm: bool },
}

/// A read-write transaction bound to one snapshot.
pub struct Txn {
    engine: Engine,
    snap: Option<SnapshotRef>,
    pending: Vec<TxnOp>,
    id: u64,
    finished: bool,
}

impl Txn {
    pub(crate) fn new(engine: Engine, snap: SnapshotRef, id: u64) -> Self {
        Self {
            engine,
            snap: Some(snap),
            pending: Vec::new(),
            id,
            finished: false,
        }
    }

    /// Caller-supplied transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read through the transaction: buffered writes first, then the bound
    /// snapshot. Tombstones are observable.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, EngineError> {
        for op in self.pending.iter().rev() {
            match op {
                TxnOp::Set { key: k, value } if k.as_slice() == key => {
                    return Ok(Some(Entry {
                        key: key.to_vec(),
                        value: value.clone(),
                        seqno: 0,
                        deleted: false,
                    }));
                }
                TxnOp::Delete { key: k, .. } if k.as_slice() == key => {
                    return Ok(Some(Entry {
                        key: key.to_vec(),
                        value: Vec::new(),
                        seqno: 0,
                        deleted: true,
                    }));
                }
                _ => {}
            }
        }
        let snap = self
            .snap
            .as_ref()
            .ok_or_else(|| EngineError::Internal("transaction already finished".into()))?;
        y_get(&self.engine.inner, snap, key)
    }

    /// Buffer an insert/overwrite.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.pending.push(TxnOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: &[u8], lsm: bool) {
        self.pending.push(TxnOp::Delete {
            key: key.to_vec(),
            lsm,
        });
    }

    /// Apply the buffered writes to the writable tier, then release the
    /// snapshot and the read lock. The whole batch holds the engine's
    /// commit lock, so it cannot interleave with an escalated CAS's
    /// observe-then-write, or with another commit.
    pub fn commit(mut self) -> Result<(), EngineError> {
        let inner = Arc::clone(&self.engine.inner);
        let _serialize = inner
            .commit_lock
            .lock()
            .map_err(|_| EngineError::Internal("commit lock poisoned".into()))?;

        let ops = std::mem::take(&mut self.pending);
        trace!(id = self.id, ops = ops.len(), "committing transaction");
        for op in ops {
            match op {
                TxnOp::Set { key, value } => {
                    self.engine.inner.write_set(&key, &value)?;
                }
                TxnOp::Delete { key, lsm } => {
                    self.engine.inner.write_delete(&key, lsm)?;
                }
            }
        }
        self.finish();
        Ok(())
    }

    /// Drop the buffered writes and release the snapshot and the read lock.
    pub fn abort(mut self) {
        self.pending.clear();
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.snap.take();
            self.engine.inner.spin.runlock();
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A read-only view bound to one snapshot.
pub struct View {
    engine: Engine,
    snap: Option<SnapshotRef>,
    id: u64,
    finished: bool,
}

impl View {
    pub(crate) fn new(engine: Engine, snap: SnapshotRef, id: u64) -> Self {
        Self {
            engine,
            snap: Some(snap),
            id,
            finished: false,
        }
    }

    /// Caller-supplied view id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Point lookup against the bound snapshot; tombstones observable.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, EngineError> {
        let snap = self
            .snap
            .as_ref()
            .ok_or_else(|| EngineError::Internal("view already finished".into()))?;
        y_get(&self.engine.inner, snap, key)
    }

    /// Ordered scan over the bound snapshot.
    pub fn scan(&self) -> Result<ScanIter, EngineError> {
        let snap = self
            .snap
            .as_ref()
            .ok_or_else(|| EngineError::Internal("view already finished".into()))?;
        ScanIter::full(snap.clone_ref())
    }

    /// Release the snapshot and the read lock.
    pub fn abort(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.snap.take();
            self.engine.inner.spin.runlock();
        }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.finish();
    }
}
