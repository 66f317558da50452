//! Flush scheduler.
//!
//! Runs on a periodic tick plus on-demand commits. A flush is two snapshot
//! transitions around one table build:
//!
//! 1. **Persist** — under the snap-spin write side, allocate a fresh empty
//!    `mw`, demote the current `mw` to `mr`, publish.
//! 2. **Build** — under no lock, drain the k-way merge of `mr` with the
//!    picked source tiers into a new disk tier at the picked level.
//! 3. **Publish** — swap the new tier in, drop the fused tiers, clear `mr`.
//!
//! The destination is picked by four policies evaluated in order, first
//! match wins:
//!
//! | pick | condition | target | fused in |
//! |------|-----------|--------|----------|
//! | fresh      | no disk tier exists        | last slot           | none |
//! | aggressive | every slot occupied        | above topmost compacting | all tiers above it |
//! | fallback   | compactor on newest tier, or mem/payload below flushratio | one above newest | none |
//! | merge      | otherwise                  | next-but-level above newest | newest tier |
//!
//! Fresh and fallback avoid rewriting a large tier for a small memory
//! drain; aggressive and merge bound the number of active levels.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::metadata::TierMetadata;
use super::purge::PurgeMsg;
use super::read::{Drain, ScanIter, TierSource};
use super::snapshot::{DiskTier, Snapshot};
use super::{EngineError, EngineInner};
use crate::mem::OrderedIndex;
use crate::table::{TableBuilder, TableSnapshot};

// ------------------------------------------------------------------------------------------------
// Build modes
// ------------------------------------------------------------------------------------------------

/// Why a tier build is happening; carried into logs and the value-log
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildMode {
    FlushFresh,
    FlushAggressive,
    FlushFallback,
    FlushMerge,
    CompactTombstonePurge,
    CompactAggressive,
    CompactRatio,
    CompactPeriod,
    CompactSelf,
    OfflineMerge,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildMode::FlushFresh => "flush.fresh",
            BuildMode::FlushAggressive => "flush.aggressive",
            BuildMode::FlushFallback => "flush.fallback",
            BuildMode::FlushMerge => "flush.merge",
            BuildMode::CompactTombstonePurge => "compact.tombstonepurge",
            BuildMode::CompactAggressive => "compact.aggressive",
            BuildMode::CompactRatio => "compact.ratio",
            BuildMode::CompactPeriod => "compact.period",
            BuildMode::CompactSelf => "compact.self",
            BuildMode::OfflineMerge => "offlinemerge",
        };
        f.write_str(s)
    }
}

// ------------------------------------------------------------------------------------------------
// Fuse registration
// ------------------------------------------------------------------------------------------------

/// Registers the levels one scheduler is working on, so the other scheduler
/// keeps its hands off them. Cleared on drop.
pub(crate) struct FuseGuard<'a> {
    list: &'a std::sync::Mutex<Vec<usize>>,
    levels: Vec<usize>,
}

impl<'a> FuseGuard<'a> {
    pub(crate) fn register(list: &'a std::sync::Mutex<Vec<usize>>, levels: Vec<usize>) -> Self {
        if let Ok(mut guard) = list.lock() {
            guard.extend(levels.iter().copied());
        }
        Self { list, levels }
    }
}

impl Drop for FuseGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.list.lock() {
            guard.retain(|l| !self.levels.contains(l));
        }
    }
}

pub(crate) fn levels_overlap(list: &std::sync::Mutex<Vec<usize>>, levels: &[usize]) -> bool {
    match list.lock() {
        Ok(guard) => levels.iter().any(|l| guard.contains(l)),
        Err(_) => true,
    }
}

// ------------------------------------------------------------------------------------------------
// Flusher loop
// ------------------------------------------------------------------------------------------------

pub(crate) enum FlushMsg {
    /// Explicit commit; `done` reports completion to the caller.
    Commit {
        appdata: Option<Vec<u8>>,
        done: Sender<Result<(), EngineError>>,
    },
    /// Memory-pressure nudge from the write path.
    Nudge,
    Shutdown,
}

pub(crate) fn flusher(inner: Arc<EngineInner>, rx: Receiver<FlushMsg>) {
    debug!("flusher started");
    let tick = if inner.cfg.autocommit.is_zero() {
        Duration::from_secs(1)
    } else {
        inner.cfg.autocommit
    };

    loop {
        match rx.recv_timeout(tick) {
            Ok(FlushMsg::Commit { appdata, done }) => {
                let result = flush(&inner, appdata);
                if let Err(e) = &result {
                    error!(error = %e, "commit-triggered flush failed");
                }
                let _ = done.send(result);
            }
            Ok(FlushMsg::Nudge) => {
                if let Err(e) = flush(&inner, None) {
                    error!(error = %e, "pressure-triggered flush failed");
                }
            }
            Ok(FlushMsg::Shutdown) => {
                if let Some(head) = inner.levels.head() {
                    if head.is_dirty() {
                        if let Err(e) = flush(&inner, None) {
                            error!(error = %e, "final flush failed");
                        }
                    }
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if should_flush(&inner) {
                    if let Err(e) = flush(&inner, None) {
                        error!(error = %e, "periodic flush failed");
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("flusher stopped");
}

/// Nothing to do only when `mw` is empty, no `mr` is pending, and the
/// flush-elapsed timer has not expired.
fn should_flush(inner: &EngineInner) -> bool {
    if inner.cfg.autocommit.is_zero() {
        return false;
    }
    let Some(head) = inner.levels.head() else {
        return false;
    };
    if head.mr.is_some() {
        return true;
    }
    head.is_dirty() && inner.flush_elapsed()
}

// ------------------------------------------------------------------------------------------------
// Destination pick
// ------------------------------------------------------------------------------------------------

/// Evaluate P1..P4 in order against the current snapshot. `cdisks` is the
/// set of levels the compactor is fusing right now. Returns the levels to
/// fuse in, the destination level, and the mode; `None` when every
/// candidate destination is busy.
pub(crate) fn pick_flush(
    inner: &EngineInner,
    snap: &Snapshot,
    cdisks: &[usize],
) -> Option<(Vec<usize>, usize, BuildMode)> {
    // P1 fresh: first ever flush goes to the last slot.
    let Some(latest) = snap.latest_level() else {
        return Some((Vec::new(), super::NLEVELS - 1, BuildMode::FlushFresh));
    };

    // P2 aggressive: every slot occupied, fold everything above the
    // topmost tier under compaction into one build.
    let occupied = snap.occupied();
    if occupied.len() == super::NLEVELS {
        let till = cdisks.iter().copied().min().unwrap_or(super::NLEVELS);
        let fuse: Vec<usize> = occupied.iter().copied().filter(|&l| l < till).collect();
        if fuse.is_empty() {
            // Everything is being compacted; skip this round.
            return None;
        }
        let target = snap.next_but_level(*fuse.last().expect("fuse non-empty"));
        return Some((fuse, target, BuildMode::FlushAggressive));
    }

    // P3 fallback: the compactor owns the newest tier, or the memory tier
    // is small relative to it; write one level above without merging.
    if latest > 0 {
        let compacting_newest = cdisks.contains(&latest);
        let small = {
            let payload = snap.disks[latest]
                .as_ref()
                .map(|d| d.payload())
                .unwrap_or(0);
            payload > 0
                && (snap.mem_footprint() as f64 / payload as f64) < inner.cfg.flushratio
        };
        if compacting_newest || small {
            return Some((Vec::new(), latest - 1, BuildMode::FlushFallback));
        }
    } else if cdisks.contains(&latest) {
        // Newest tier busy and no slot above it; wait for the compactor.
        return None;
    }

    // P4 merge: fuse the newest tier into the build.
    Some((
        vec![latest],
        snap.next_but_level(latest),
        BuildMode::FlushMerge,
    ))
}

// ------------------------------------------------------------------------------------------------
// The flush itself
// ------------------------------------------------------------------------------------------------

pub(crate) fn flush(inner: &EngineInner, appdata: Option<Vec<u8>>) -> Result<(), EngineError> {
    let head = inner.levels.head().ok_or(EngineError::Shutdown)?;
    if !head.is_dirty() {
        return Ok(());
    }

    // Pick the destination before rotating, so a busy tree never strands
    // a demoted `mr`.
    let cdisks = inner
        .compacting
        .lock()
        .map_err(|_| EngineError::Internal("compacting registry poisoned".into()))?
        .clone();
    let Some((fuse_levels, nlevel, mode)) = pick_flush(inner, &head, &cdisks) else {
        debug!("flush skipped: no destination level free");
        return Ok(());
    };

    let mut guarded = fuse_levels.clone();
    guarded.push(nlevel);
    let _guard = FuseGuard::register(&inner.flushing, guarded.clone());
    if levels_overlap(&inner.compacting, &guarded) {
        debug!("flush skipped: compactor moved onto the picked levels");
        return Ok(());
    }

    // Persist transition: fresh mw, demoted mr. Skipped when a previous
    // round already left an mr pending.
    inner.spin.lock();
    let head = match inner.levels.head() {
        Some(head) => head,
        None => {
            inner.spin.unlock();
            return Err(EngineError::Shutdown);
        }
    };
    if head.mr.is_none() {
        let mw2 = inner.new_mem_index("mw", head.mw_seqno());
        let next = Snapshot::new(Some(mw2), head.mw.clone(), head.mc.clone(), head.disks.clone());
        let old = inner.levels.publish(next);
        inner.spin.unlock();
        if let Some(old) = old {
            let _ = inner.purge_tx.send(PurgeMsg::Retire(old));
        }
    } else {
        inner.spin.unlock();
    }

    // Build, holding a snapshot reference so the purger cannot retire the
    // tiers we read from.
    let snap = inner.levels.latest().ok_or(EngineError::Shutdown)?;
    let mr = snap
        .mr
        .clone()
        .ok_or_else(|| EngineError::Internal("flush without an mr tier".into()))?;

    let mut sources = vec![TierSource::Mem(mr.scan().into_iter())];
    let mut fused: Vec<DiskTier> = Vec::with_capacity(fuse_levels.len());
    for &level in &fuse_levels {
        let disk = snap.disks[level]
            .clone()
            .ok_or_else(|| EngineError::Internal(format!("fuse level {level} is empty")))?;
        sources.push(TierSource::Disk(TableSnapshot::scan_entries(&disk)));
        fused.push(disk);
    }

    let flushunix = unix_now();
    let dir = inner.next_tier_dir(nlevel)?;
    let mut merged = ScanIter::over(None, sources)?;
    let ndisk = build_tier(
        inner,
        &dir,
        &mut merged,
        false,
        flushunix,
        appdata.as_deref().unwrap_or(&[]),
    )?;

    // Publish: new tier in, fused tiers out, mr cleared, working set reset.
    inner.spin.lock();
    let head = match inner.levels.head() {
        Some(head) => head,
        None => {
            inner.spin.unlock();
            let _ = ndisk.destroy();
            return Err(EngineError::Shutdown);
        }
    };
    for (level, disk) in fuse_levels.iter().zip(&fused) {
        let still_there = head.disks[*level]
            .as_ref()
            .map(|d| d.id() == disk.id())
            .unwrap_or(false);
        if !still_there {
            inner.spin.unlock();
            let _ = ndisk.destroy();
            return Err(EngineError::Internal(format!(
                "fused tier at level {level} changed during build"
            )));
        }
    }
    let mut disks = head.disks.clone();
    for level in &fuse_levels {
        disks[*level] = None;
    }
    disks[nlevel] = Some(ndisk.clone());
    let mc = inner.new_working_set();
    let next = Snapshot::new(head.mw.clone(), None, mc, disks);
    let old = inner.levels.publish(next);
    inner.spin.unlock();
    if let Some(old) = old {
        let _ = inner.purge_tx.send(PurgeMsg::Retire(old));
    }
    drop(snap);

    // Everything the redo log held is now covered by the new tier.
    if let Some(redo) = &inner.redo {
        if let Err(e) = redo.reset() {
            warn!(error = %e, "failed to reset redo log after flush");
        }
    }

    info!(
        mode = %mode,
        level = nlevel,
        id = ndisk.id(),
        entries = ndisk.count(),
        fused = fuse_levels.len(),
        "flush complete"
    );
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Shared tier build
// ------------------------------------------------------------------------------------------------

/// Drain a merge into a new tier directory, stamp metadata, and open the
/// result. On any failure the partial directory is removed.
pub(crate) fn build_tier(
    inner: &EngineInner,
    dir: &Path,
    merged: &mut ScanIter,
    tombstone_purge: bool,
    flushunix: u64,
    appdata: &[u8],
) -> Result<DiskTier, EngineError> {
    let result = build_tier_inner(inner, dir, merged, tombstone_purge, flushunix, appdata);
    if result.is_err() {
        let _ = std::fs::remove_dir_all(dir);
    }
    result
}

fn build_tier_inner(
    inner: &EngineInner,
    dir: &Path,
    merged: &mut ScanIter,
    tombstone_purge: bool,
    flushunix: u64,
    appdata: &[u8],
) -> Result<DiskTier, EngineError> {
    let cfg = &inner.cfg;
    let mut builder = TableBuilder::new(dir, cfg.mblocksize, cfg.zblocksize, cfg.vblocksize)?;
    builder.tombstone_purge(tombstone_purge);

    let mut err = None;
    let stats = {
        let mut feed = Drain {
            merged,
            err: &mut err,
        };
        builder.build(&mut feed)?
    };
    if let Some(e) = err {
        return Err(e);
    }

    let memversions = *inner
        .mem_versions
        .lock()
        .map_err(|_| EngineError::Internal("mem version registry poisoned".into()))?;
    let diskversions = *inner
        .disk_versions
        .lock()
        .map_err(|_| EngineError::Internal("disk version registry poisoned".into()))?;
    let metadata = TierMetadata::new(
        stats.seqno_max,
        flushunix,
        appdata,
        memversions,
        diskversions,
        cfg,
    )
    .encode()?;
    builder.finish(&metadata)?;

    let ndisk = Arc::new(TableSnapshot::open(dir, cfg.mmap)?);
    inner.wramp.fetch_add(ndisk.footprint(), Ordering::Relaxed);
    Ok(ndisk)
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
