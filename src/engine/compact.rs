//! Compaction scheduler.
//!
//! Fuses existing disk tiers on its own period, independent of the flusher.
//! Six policies are evaluated in order, first match wins:
//!
//! | pick | condition | sources | target |
//! |------|-----------|---------|--------|
//! | tombstone-purge | requested, oldest tier in last slot | last tier | same slot, deletes dropped |
//! | none       | zero or one disk tier                   | —         | skip |
//! | aggressive | more than three disk tiers              | all but first and last | next-but-level above lowest fused |
//! | ratio      | adjacent payload ratio above compactratio | that pair | next-but-level above the lower |
//! | period     | a tier older than compactperiod with something below it | it and everything older | next-but-level above oldest fused |
//! | self       | last tier mostly dead space             | last tier | same slot |
//!
//! Tombstones are dropped only when the output lands in the final slot and
//! the purge was explicitly requested — everywhere else an older overlay
//! might still resurface the key.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::flush::{BuildMode, FuseGuard, build_tier, levels_overlap, unix_now};
use super::purge::PurgeMsg;
use super::read::{ScanIter, TierSource};
use super::snapshot::{DiskTier, NLEVELS, Snapshot};
use super::{EngineError, EngineInner};
use crate::table::TableSnapshot;

pub(crate) enum CompactMsg {
    /// Explicit tombstone purge; `done` reports whether a build ran.
    TombstonePurge {
        done: Sender<Result<bool, EngineError>>,
    },
    Shutdown,
}

pub(crate) fn compactor(inner: Arc<EngineInner>, rx: Receiver<CompactMsg>) {
    debug!("compactor started");
    let tick = if inner.cfg.compactperiod.is_zero() {
        Duration::from_secs(30)
    } else {
        inner.cfg.compactperiod.min(Duration::from_secs(30))
    };

    loop {
        match rx.recv_timeout(tick) {
            Ok(CompactMsg::TombstonePurge { done }) => {
                let result = run_compaction(&inner, true);
                if let Err(e) = &result {
                    error!(error = %e, "tombstone purge failed");
                }
                let _ = done.send(result);
            }
            Ok(CompactMsg::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {
                if inner.cfg.compactperiod.is_zero() {
                    continue;
                }
                if let Err(e) = run_compaction(&inner, false) {
                    error!(error = %e, "periodic compaction failed");
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("compactor stopped");
}

// ------------------------------------------------------------------------------------------------
// Source pick
// ------------------------------------------------------------------------------------------------

/// Evaluate C1..C6 against the current snapshot. Returns the levels to
/// fuse, the destination level, and the mode.
pub(crate) fn pick_compact(
    inner: &EngineInner,
    snap: &Snapshot,
    tombstone_purge: bool,
) -> Result<Option<(Vec<usize>, usize, BuildMode)>, EngineError> {
    let occupied = snap.occupied();

    // C1 tombstone-purge: explicit request against the last slot.
    if tombstone_purge {
        match occupied.last() {
            Some(&last) if last == NLEVELS - 1 => {
                return Ok(Some((vec![last], last, BuildMode::CompactTombstonePurge)));
            }
            Some(&last) => {
                warn!(
                    level = last,
                    "tombstone purge skipped: oldest tier is not in the last slot"
                );
            }
            None => {}
        }
    }

    // C2 none: nothing worth fusing.
    if occupied.len() <= 1 {
        return Ok(None);
    }

    // C3 aggressive: too many active levels. Leave the first for the
    // flusher and the last because it may be too big.
    if occupied.len() > 3 {
        let fuse: Vec<usize> = occupied[1..occupied.len() - 1].to_vec();
        let target = snap.next_but_level(*fuse.last().expect("fuse non-empty"));
        return Ok(Some((fuse, target, BuildMode::CompactAggressive)));
    }

    // C4 ratio: an adjacent pair whose payloads are out of proportion.
    for pair in occupied.windows(2) {
        let (upper, lower) = (pair[0], pair[1]);
        let p0 = snap.disks[upper].as_ref().map(|d| d.payload()).unwrap_or(0);
        let p1 = snap.disks[lower].as_ref().map(|d| d.payload()).unwrap_or(0);
        if p1 > 0 && (p0 as f64 / p1 as f64) > inner.cfg.compactratio {
            let target = snap.next_but_level(lower);
            return Ok(Some((vec![upper, lower], target, BuildMode::CompactRatio)));
        }
    }

    // C5 period: a tier has been sitting longer than compactperiod and has
    // older tiers beneath it.
    if !inner.cfg.compactperiod.is_zero() {
        let now = unix_now();
        for (i, &level) in occupied.iter().enumerate() {
            if i + 1 >= occupied.len() {
                break;
            }
            let disk = snap.disks[level].as_ref().expect("occupied level");
            let flushed = inner.tier_metadata(disk)?.flushunix()?;
            let age = now.saturating_sub(flushed);
            if age > inner.cfg.compactperiod.as_secs() {
                let fuse: Vec<usize> = occupied[i..].to_vec();
                let target = snap.next_but_level(*fuse.last().expect("fuse non-empty"));
                return Ok(Some((fuse, target, BuildMode::CompactPeriod)));
            }
        }
    }

    // C6 self: the last tier is mostly dead space; rewrite it in place to
    // reclaim deletions. Applies only when it sits in the final slot.
    if let Some(&last) = occupied.last() {
        if last == NLEVELS - 1 {
            let disk = snap.disks[last].as_ref().expect("occupied level");
            let (payload, footprint) = (disk.payload(), disk.footprint());
            if footprint > 0 && (payload as f64 / footprint as f64) < 0.25 {
                return Ok(Some((vec![last], last, BuildMode::CompactSelf)));
            }
        }
    }

    Ok(None)
}

// ------------------------------------------------------------------------------------------------
// One round
// ------------------------------------------------------------------------------------------------

/// Run at most one compaction build. Returns whether a build happened.
pub(crate) fn run_compaction(
    inner: &EngineInner,
    tombstone_purge: bool,
) -> Result<bool, EngineError> {
    let Some(snap) = inner.levels.latest() else {
        return Err(EngineError::Shutdown);
    };

    let Some((fuse_levels, nlevel, mode)) = pick_compact(inner, &snap, tombstone_purge)? else {
        return Ok(false);
    };

    let mut guarded = fuse_levels.clone();
    guarded.push(nlevel);
    let _guard = FuseGuard::register(&inner.compacting, guarded.clone());
    if levels_overlap(&inner.flushing, &guarded) {
        debug!("compaction skipped: flusher owns the picked levels");
        return Ok(false);
    }

    let mut sources = Vec::with_capacity(fuse_levels.len());
    let mut fused: Vec<DiskTier> = Vec::with_capacity(fuse_levels.len());
    for &level in &fuse_levels {
        let disk = snap.disks[level]
            .clone()
            .ok_or_else(|| EngineError::Internal(format!("fuse level {level} is empty")))?;
        sources.push(TierSource::Disk(TableSnapshot::scan_entries(&disk)));
        fused.push(disk);
    }

    // Carry the newest fused tier's flush stamp and appdata forward, so
    // tier age stays truthful across compactions.
    let newest_meta = inner.tier_metadata(&fused[0])?;
    let flushunix = newest_meta.flushunix()?;
    let appdata = newest_meta.appdata()?;

    let purge = mode == BuildMode::CompactTombstonePurge && nlevel == NLEVELS - 1;
    let dir = inner.next_tier_dir(nlevel)?;
    let mut merged = ScanIter::over(None, sources)?;
    let ndisk = build_tier(inner, &dir, &mut merged, purge, flushunix, &appdata)?;

    // Publish: fused tiers out, new tier in. Mem tiers ride along
    // untouched.
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
                "fused tier at level {level} changed during compaction"
            )));
        }
    }
    let mut disks = head.disks.clone();
    for level in &fuse_levels {
        disks[*level] = None;
    }
    disks[nlevel] = Some(ndisk.clone());
    let next = Snapshot::new(head.mw.clone(), head.mr.clone(), head.mc.clone(), disks);
    let old = inner.levels.publish(next);
    inner.spin.unlock();
    if let Some(old) = old {
        let _ = inner.purge_tx.send(PurgeMsg::Retire(old));
    }
    drop(snap);

    info!(
        mode = %mode,
        level = nlevel,
        id = ndisk.id(),
        entries = ndisk.count(),
        fused = fuse_levels.len(),
        "compaction complete"
    );
    Ok(true)
}
