//! Snapshot descriptors and the level manager.
//!
//! A [`Snapshot`] is the immutable tuple of every tier visible to readers at
//! a point in time: up to three in-memory indexes (`mw` writable, `mr` being
//! flushed, `mc` working set) and up to sixteen disk tiers, one per slot,
//! slot index = level, lower slot = newer data.
//!
//! The [`LevelManager`] owns the single published pointer. Every transition
//! builds a fresh descriptor from the old one plus a delta, publishes it
//! while holding the snap-spin write side, and retires the old descriptor to
//! the purger. Readers take [`LevelManager::latest`], which loops
//! load → refer → check-retired → retry, so a reader either holds a
//! descriptor that is still safe or observes a newer one.
//!
//! Reference counts here are the engine's own (coarse, per descriptor) and
//! drive the purger; `Arc` only manages memory.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::mem::OrderedIndex;
use crate::table::TableSnapshot;

/// Number of disk slots; slot index is the tier's level.
pub const NLEVELS: usize = 16;

pub(crate) type MemTier = Arc<dyn OrderedIndex>;
pub(crate) type DiskTier = Arc<TableSnapshot>;

// ------------------------------------------------------------------------------------------------
// Snapshot descriptor
// ------------------------------------------------------------------------------------------------

pub(crate) struct Snapshot {
    /// Writable in-memory tier. Nil only while the engine shuts down.
    pub(crate) mw: Option<MemTier>,

    /// In-memory tier currently being flushed.
    pub(crate) mr: Option<MemTier>,

    /// Working-set cache of hot keys promoted from disk tiers.
    pub(crate) mc: Option<MemTier>,

    /// One immutable disk tier per slot.
    pub(crate) disks: [Option<DiskTier>; NLEVELS],

    refcount: AtomicI64,
    retired: AtomicBool,
}

impl Snapshot {
    pub(crate) fn new(
        mw: Option<MemTier>,
        mr: Option<MemTier>,
        mc: Option<MemTier>,
        disks: [Option<DiskTier>; NLEVELS],
    ) -> Arc<Self> {
        Arc::new(Self {
            mw,
            mr,
            mc,
            disks,
            refcount: AtomicI64::new(0),
            retired: AtomicBool::new(false),
        })
    }

    pub(crate) fn empty_disks() -> [Option<DiskTier>; NLEVELS] {
        std::array::from_fn(|_| None)
    }

    pub(crate) fn refer(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "snapshot refcount underflow");
    }

    pub(crate) fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Slot of the newest disk tier, if any.
    pub(crate) fn latest_level(&self) -> Option<usize> {
        self.disks.iter().position(|d| d.is_some())
    }

    /// Occupied slots, newest first.
    pub(crate) fn occupied(&self) -> Vec<usize> {
        (0..NLEVELS).filter(|&l| self.disks[l].is_some()).collect()
    }

    /// Disk tiers in slot order, newest first.
    pub(crate) fn disk_levels(&self) -> Vec<DiskTier> {
        self.disks.iter().flatten().cloned().collect()
    }

    /// One level further down when that slot is free, else the level itself.
    /// The output of a fuse never jumps past an occupied slot.
    pub(crate) fn next_but_level(&self, level: usize) -> usize {
        if level + 1 < NLEVELS && self.disks[level + 1].is_none() {
            level + 1
        } else {
            level
        }
    }

    /// Current mutation seqno, as seen by the writable tier.
    pub(crate) fn mw_seqno(&self) -> u64 {
        self.mw.as_ref().map(|mw| mw.seqno()).unwrap_or(0)
    }

    /// Heap bytes held by the mutable tiers.
    pub(crate) fn mem_footprint(&self) -> u64 {
        let mw = self.mw.as_ref().map(|t| t.footprint()).unwrap_or(0);
        let mr = self.mr.as_ref().map(|t| t.footprint()).unwrap_or(0);
        mw + mr
    }

    /// Highest seqno recorded across the disk tiers.
    pub(crate) fn disk_seqno(&self) -> u64 {
        self.disks
            .iter()
            .flatten()
            .map(|d| d.seqno())
            .max()
            .unwrap_or(0)
    }

    /// Anything not yet persisted? A warmed writable tier holds data but
    /// no mutations past the disk seqno, so it does not count as dirty.
    pub(crate) fn is_dirty(&self) -> bool {
        self.mr.is_some() || self.mw_seqno() > self.disk_seqno()
    }
}

// ------------------------------------------------------------------------------------------------
// Reader guard
// ------------------------------------------------------------------------------------------------

/// Holds one reference on a snapshot descriptor; released on drop. A reader
/// bound to this guard observes the descriptor unchanged for its lifetime,
/// regardless of concurrent snapshot swaps.
pub(crate) struct SnapshotRef {
    snap: Arc<Snapshot>,
}

impl SnapshotRef {
    /// Take an additional counted reference on the same descriptor.
    pub(crate) fn clone_ref(&self) -> SnapshotRef {
        self.snap.refer();
        SnapshotRef {
            snap: Arc::clone(&self.snap),
        }
    }
}

impl std::ops::Deref for SnapshotRef {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snap
    }
}

impl Drop for SnapshotRef {
    fn drop(&mut self) {
        self.snap.release();
    }
}

// ------------------------------------------------------------------------------------------------
// Level manager
// ------------------------------------------------------------------------------------------------

/// Owns the published snapshot pointer. Swaps happen under the snap-spin
/// write side, so exactly one transition is in flight at a time.
pub(crate) struct LevelManager {
    slot: Mutex<Option<Arc<Snapshot>>>,
}

impl LevelManager {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Current head without taking a reference. For engine-internal use
    /// while the caller holds the snap-spin write side or is the only
    /// remaining thread.
    pub(crate) fn head(&self) -> Option<Arc<Snapshot>> {
        self.slot.lock().ok()?.clone()
    }

    /// Take a counted reference on the current head, retrying past
    /// descriptors that retired between the load and the refer.
    pub(crate) fn latest(&self) -> Option<SnapshotRef> {
        loop {
            let snap = self.head()?;
            snap.refer();
            if !snap.is_retired() {
                return Some(SnapshotRef { snap });
            }
            snap.release();
            std::thread::yield_now();
        }
    }

    /// Publish a new descriptor: reference it on the engine's behalf, swap
    /// it in, and retire the old one. Returns the old descriptor so the
    /// caller can hand it to the purger.
    pub(crate) fn publish(&self, new: Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        new.refer();
        let old = match self.slot.lock() {
            Ok(mut slot) => slot.replace(new),
            Err(_) => None,
        };
        if let Some(old) = &old {
            old.mark_retired();
            old.release();
        }
        old
    }

    /// Drop the head entirely; shutdown only.
    pub(crate) fn clear(&self) -> Option<Arc<Snapshot>> {
        let old = self.slot.lock().ok()?.take();
        if let Some(old) = &old {
            old.mark_retired();
            old.release();
        }
        old
    }
}
