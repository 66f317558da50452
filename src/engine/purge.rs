//! Retired-descriptor purger.
//!
//! A single consumer drains retired snapshot descriptors. For each one it
//! sleep-polls until every outstanding reference is released, then disposes
//! of whatever the current descriptor no longer carries: disk tiers that
//! were fused away or superseded have their directories destroyed, and
//! in-memory indexes are closed. Tiers still referenced by the current
//! descriptor are left alone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use super::EngineInner;
use super::snapshot::Snapshot;
use crate::mem::OrderedIndex;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) enum PurgeMsg {
    Retire(Arc<Snapshot>),
    Shutdown,
}

pub(crate) fn purger(inner: Arc<EngineInner>, rx: Receiver<PurgeMsg>) {
    debug!("purger started");
    while let Ok(msg) = rx.recv() {
        match msg {
            PurgeMsg::Retire(snap) => dispose(&inner, snap),
            PurgeMsg::Shutdown => break,
        }
    }
    debug!("purger stopped");
}

fn dispose(inner: &EngineInner, snap: Arc<Snapshot>) {
    while snap.refcount() > 0 {
        std::thread::sleep(POLL_INTERVAL);
    }

    let current = inner.levels.head();

    let live_disks: HashSet<String> = current
        .as_ref()
        .map(|cur| {
            cur.disks
                .iter()
                .flatten()
                .map(|d| d.id().to_string())
                .collect()
        })
        .unwrap_or_default();

    let live_mem: HashSet<String> = current
        .as_ref()
        .map(|cur| {
            [&cur.mw, &cur.mr, &cur.mc]
                .into_iter()
                .flatten()
                .map(|t| t.id().to_string())
                .collect()
        })
        .unwrap_or_default();

    for disk in snap.disks.iter().flatten() {
        if live_disks.contains(disk.id()) {
            continue;
        }
        // When the head is gone the engine is closing and owns final
        // disposal; destroying here would erase still-valid data.
        if current.is_none() {
            continue;
        }
        debug!(id = disk.id(), "purging superseded disk tier");
        if let Err(e) = disk.destroy() {
            warn!(id = disk.id(), error = %e, "failed to destroy disk tier");
        }
    }

    for tier in [&snap.mw, &snap.mr, &snap.mc].into_iter().flatten() {
        if live_mem.contains(tier.id()) {
            continue;
        }
        debug!(id = tier.id(), "closing retired mem tier");
        tier.close();
    }
}
