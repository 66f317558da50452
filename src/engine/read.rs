//! Merged read path: point lookups and ordered scans over all tiers.
//!
//! Tiers are consulted newest first: `mw` → `mr` → `mc` → `disks[0..16]`.
//! Seqno precedence is implicit in that order, because every published
//! snapshot keeps newer tiers above older ones. Tombstones are observable:
//! a lookup that lands on a delete reports the tombstone, and a scan emits
//! it, so LSM consumers can interpret it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use tracing::trace;

use super::snapshot::{Snapshot, SnapshotRef};
use super::{EngineInner, Entry};
use crate::mem::OrderedIndex;
use crate::table::{EntryIter, TableSnapshot};

// ------------------------------------------------------------------------------------------------
// y-get
// ------------------------------------------------------------------------------------------------

/// Composed point lookup: first hit wins, tombstones included.
///
/// With the working set enabled, an entry served from a disk tier is
/// promoted into `mc` (bounded to a quarter of the memory capacity), so a
/// hot key's next lookup stops before the disk.
pub(crate) fn y_get(
    inner: &EngineInner,
    snap: &Snapshot,
    key: &[u8],
) -> Result<Option<Entry>, super::EngineError> {
    for tier in [&snap.mw, &snap.mr, &snap.mc].into_iter().flatten() {
        if let Some(entry) = tier.get(key) {
            return Ok(Some(entry));
        }
    }

    for disk in snap.disks.iter().flatten() {
        if let Some(entry) = disk.get(key)? {
            if let Some(mc) = &snap.mc {
                if mc.footprint() < inner.cfg.memcapacity / 4 {
                    let _ = mc.load(entry.clone());
                    trace!(key_len = key.len(), "promoted entry into working set");
                }
            }
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

// ------------------------------------------------------------------------------------------------
// y-scan
// ------------------------------------------------------------------------------------------------

pub(crate) enum TierSource {
    Mem(std::vec::IntoIter<Entry>),
    Disk(EntryIter),
}

impl TierSource {
    fn next(&mut self) -> Option<Result<Entry, super::EngineError>> {
        match self {
            TierSource::Mem(iter) => iter.next().map(Ok),
            TierSource::Disk(iter) => iter.next().map(|r| r.map_err(Into::into)),
        }
    }
}

struct HeapItem {
    entry: Entry,
    src: usize,
}

impl HeapItem {
    // Key ascending, then seqno descending, then tier rank ascending; with
    // `Reverse` on the heap this pops the smallest key, newest version
    // first.
    fn order(&self, other: &Self) -> CmpOrdering {
        self.entry
            .key
            .cmp(&other.entry.key)
            .then_with(|| other.entry.seqno.cmp(&self.entry.seqno))
            .then_with(|| self.src.cmp(&other.src))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.order(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.order(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.order(other)
    }
}

/// Lazy k-way merge over every tier of one snapshot, ordered by
/// `(key ascending, seqno descending)`. When several tiers hold the same
/// key, the highest seqno wins and the rest are advanced past it.
/// Tombstones are emitted, not filtered.
///
/// The iterator pins one snapshot reference for its lifetime and releases
/// it (plus all underlying tier iterators) on drop. The first read error is
/// terminal.
pub struct ScanIter {
    sources: Vec<TierSource>,
    heap: BinaryHeap<std::cmp::Reverse<HeapItem>>,
    last_key: Option<Vec<u8>>,
    done: bool,
    // Pin: released when the iterator goes away.
    _snap: Option<SnapshotRef>,
}

impl ScanIter {
    /// Merge over an explicit set of tier sources. Used by the schedulers
    /// to feed builders from `mr` plus the tiers being fused.
    pub(crate) fn over(
        snap: Option<SnapshotRef>,
        mut sources: Vec<TierSource>,
    ) -> Result<Self, super::EngineError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (src, source) in sources.iter_mut().enumerate() {
            match source.next() {
                Some(Ok(entry)) => heap.push(std::cmp::Reverse(HeapItem { entry, src })),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        Ok(Self {
            sources,
            heap,
            last_key: None,
            done: false,
            _snap: snap,
        })
    }

    /// Merge over every tier of `snap`, newest first.
    pub(crate) fn full(snap: SnapshotRef) -> Result<Self, super::EngineError> {
        let mut sources = Vec::new();
        for tier in [&snap.mw, &snap.mr, &snap.mc].into_iter().flatten() {
            sources.push(TierSource::Mem(tier.scan().into_iter()));
        }
        for disk in snap.disks.iter().flatten() {
            sources.push(TierSource::Disk(TableSnapshot::scan_entries(disk)));
        }
        Self::over(Some(snap), sources)
    }

    fn advance(&mut self, src: usize) -> Result<(), super::EngineError> {
        match self.sources[src].next() {
            Some(Ok(entry)) => {
                self.heap.push(std::cmp::Reverse(HeapItem { entry, src }));
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for ScanIter {
    type Item = Result<Entry, super::EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let std::cmp::Reverse(item) = self.heap.pop()?;
            if let Err(e) = self.advance(item.src) {
                self.done = true;
                return Some(Err(e));
            }
            if self.last_key.as_deref() == Some(item.entry.key.as_slice()) {
                continue; // older version of an emitted key
            }
            self.last_key = Some(item.entry.key.clone());
            return Some(Ok(item.entry));
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Builder feed
// ------------------------------------------------------------------------------------------------

/// Adapts a merge into the plain-entry stream the table builder consumes,
/// parking the first error for the caller to inspect after the build.
pub(crate) struct Drain<'a> {
    pub(crate) merged: &'a mut ScanIter,
    pub(crate) err: &'a mut Option<super::EngineError>,
}

impl Iterator for Drain<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        match self.merged.next() {
            Some(Ok(entry)) => Some(entry),
            Some(Err(e)) => {
                *self.err = Some(e);
                None
            }
            None => None,
        }
    }
}
