//! # In-memory ordered index
//!
//! The mutable tiers of the engine (`mw`, `mr`, `mc`) are ordered in-memory
//! indexes behind the [`OrderedIndex`] trait. Two flavors exist, selected by
//! the `memstore` setting:
//!
//! - [`ExclusiveIndex`] — one version per key; an update overwrites in place.
//! - [`MvccIndex`] — multiple versions per key ordered by descending seqno;
//!   the highest-seqno version is authoritative on reads.
//!
//! ## Design Invariants
//!
//! - Every mutation is assigned a monotonically increasing seqno; the seqno
//!   doubles as the entry's CAS token.
//! - Deletes in LSM mode insert tombstones, never remove physically.
//! - `scan()` yields the latest version per key, in key order.
//! - `load()` is a recovery/warmup path: it inserts an entry carrying an
//!   externally assigned seqno and never advances the counter backwards.
//!
//! The engine freezes an index by dropping its own write references; the
//! type itself carries no frozen/mutable state machine.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::trace;

use crate::engine::Entry;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by in-memory index operations.
#[derive(Debug, Error)]
pub enum MemError {
    /// Compare-and-set token did not match the entry's current seqno.
    #[error("invalid CAS")]
    InvalidCas,

    /// The index holds no entry for the key, so a CAS cannot be decided
    /// against this tier alone.
    #[error("CAS unresolved in this tier")]
    CasUnresolved,

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// Accounted per entry on top of key/value bytes; mirrors the node overhead
// of a balanced-tree implementation so DGM projections stay comparable.
pub(crate) const NODE_FOOTPRINT: u64 = 96;

// ------------------------------------------------------------------------------------------------
// OrderedIndex trait
// ------------------------------------------------------------------------------------------------

/// Capability set the engine requires from a mutable in-memory tier.
///
/// All methods take `&self`; implementations synchronize internally so that
/// the engine's snapshot discipline never has to lock a tier to read it.
pub trait OrderedIndex: Send + Sync {
    /// Instance name, e.g. `myindex-mw-3`.
    fn id(&self) -> &str;

    /// Number of distinct keys, tombstones included.
    fn count(&self) -> u64;

    /// Approximate heap footprint in bytes.
    fn footprint(&self) -> u64;

    /// Highest seqno assigned so far.
    fn seqno(&self) -> u64;

    /// Override the seqno counter; recovery/warmup only, before any writes.
    fn set_seqno(&self, seqno: u64);

    /// Latest version for `key`, tombstones included.
    fn get(&self, key: &[u8]) -> Option<Entry>;

    /// Insert or overwrite `key`. Returns the previous latest version (if
    /// any) and the seqno assigned to this mutation.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(Option<Entry>, u64), MemError>;

    /// Insert `key` only if `cas` matches the current state: the latest
    /// version's seqno for a live key, or zero for a key that is absent or
    /// tombstoned. Fails with [`MemError::CasUnresolved`] when the key is
    /// not present in this tier at all.
    fn set_cas(&self, key: &[u8], value: &[u8], cas: u64) -> Result<(Option<Entry>, u64), MemError>;

    /// Delete `key`. With `lsm` true a tombstone is recorded (inserted if
    /// the key was never seen); with `lsm` false the entry is removed
    /// physically. Returns the previous latest version and the seqno
    /// assigned to the delete.
    fn delete(&self, key: &[u8], lsm: bool) -> Result<(Option<Entry>, u64), MemError>;

    /// Recovery/warmup insert carrying an already-assigned seqno.
    fn load(&self, entry: Entry) -> Result<(), MemError>;

    /// Latest version per key, in ascending key order.
    fn scan(&self) -> Vec<Entry>;

    /// Release the index's memory eagerly.
    fn close(&self);
}

// ------------------------------------------------------------------------------------------------
// Shared plumbing
// ------------------------------------------------------------------------------------------------

fn entry_footprint(key: &[u8], value: &[u8]) -> u64 {
    NODE_FOOTPRINT + key.len() as u64 + value.len() as u64
}

fn poisoned<T>(_: T) -> MemError {
    MemError::Internal("rwlock poisoned".into())
}

// ------------------------------------------------------------------------------------------------
// ExclusiveIndex — single version per key
// ------------------------------------------------------------------------------------------------

#[derive(Clone)]
struct Slot {
    value: Vec<u8>,
    seqno: u64,
    deleted: bool,
}

impl Slot {
    fn to_entry(&self, key: &[u8]) -> Entry {
        Entry {
            key: key.to_vec(),
            value: self.value.clone(),
            seqno: self.seqno,
            deleted: self.deleted,
        }
    }
}

/// Single-writer, single-version ordered index.
///
/// Keeps exactly one version per key; an overwrite replaces the slot in
/// place. This is the memstore for workloads where the full key space fits
/// in memory and history is never consulted.
pub struct ExclusiveIndex {
    name: String,
    tree: RwLock<ExclusiveInner>,
    seqno: AtomicU64,
}

struct ExclusiveInner {
    slots: BTreeMap<Vec<u8>, Slot>,
    footprint: u64,
}

impl ExclusiveIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tree: RwLock::new(ExclusiveInner {
                slots: BTreeMap::new(),
                footprint: 0,
            }),
            seqno: AtomicU64::new(0),
        }
    }

    fn apply(
        &self,
        key: &[u8],
        value: &[u8],
        deleted: bool,
        guard: &mut ExclusiveInner,
    ) -> (Option<Entry>, u64) {
        let seqno = self.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let old = guard.slots.get(key).map(|s| s.to_entry(key));
        if let Some(prev) = &old {
            guard.footprint -= entry_footprint(&prev.key, &prev.value);
        }
        guard.footprint += entry_footprint(key, value);
        guard.slots.insert(
            key.to_vec(),
            Slot {
                value: value.to_vec(),
                seqno,
                deleted,
            },
        );
        (old, seqno)
    }
}

impl OrderedIndex for ExclusiveIndex {
    fn id(&self) -> &str {
        &self.name
    }

    fn count(&self) -> u64 {
        self.tree.read().map(|g| g.slots.len() as u64).unwrap_or(0)
    }

    fn footprint(&self) -> u64 {
        self.tree.read().map(|g| g.footprint).unwrap_or(0)
    }

    fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::SeqCst)
    }

    fn set_seqno(&self, seqno: u64) {
        self.seqno.store(seqno, Ordering::SeqCst);
    }

    fn get(&self, key: &[u8]) -> Option<Entry> {
        let guard = self.tree.read().ok()?;
        guard.slots.get(key).map(|s| s.to_entry(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(Option<Entry>, u64), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        let (old, seqno) = self.apply(key, value, false, &mut guard);
        trace!(index = %self.name, seqno, "set");
        Ok((old, seqno))
    }

    fn set_cas(&self, key: &[u8], value: &[u8], cas: u64) -> Result<(Option<Entry>, u64), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        match guard.slots.get(key) {
            None => Err(MemError::CasUnresolved),
            Some(slot) if slot.deleted => {
                if cas != 0 {
                    return Err(MemError::InvalidCas);
                }
                Ok(self.apply(key, value, false, &mut guard))
            }
            Some(slot) => {
                if slot.seqno != cas {
                    return Err(MemError::InvalidCas);
                }
                Ok(self.apply(key, value, false, &mut guard))
            }
        }
    }

    fn delete(&self, key: &[u8], lsm: bool) -> Result<(Option<Entry>, u64), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        if lsm {
            let (old, seqno) = self.apply(key, &[], true, &mut guard);
            return Ok((old, seqno));
        }
        let seqno = self.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let old = guard.slots.remove(key);
        if let Some(slot) = &old {
            guard.footprint -= entry_footprint(key, &slot.value);
        }
        Ok((old.map(|s| s.to_entry(key)), seqno))
    }

    fn load(&self, entry: Entry) -> Result<(), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        self.seqno.fetch_max(entry.seqno, Ordering::SeqCst);
        guard.footprint += entry_footprint(&entry.key, &entry.value);
        if let Some(prev) = guard.slots.insert(
            entry.key.clone(),
            Slot {
                value: entry.value,
                seqno: entry.seqno,
                deleted: entry.deleted,
            },
        ) {
            guard.footprint -= entry_footprint(&entry.key, &prev.value);
        }
        Ok(())
    }

    fn scan(&self) -> Vec<Entry> {
        let Ok(guard) = self.tree.read() else {
            return Vec::new();
        };
        guard
            .slots
            .iter()
            .map(|(key, slot)| slot.to_entry(key))
            .collect()
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tree.write() {
            guard.slots.clear();
            guard.footprint = 0;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MvccIndex — multiple versions per key
// ------------------------------------------------------------------------------------------------

#[derive(Clone)]
struct Version {
    value: Vec<u8>,
    seqno: u64,
    deleted: bool,
}

/// Multi-version ordered index.
///
/// Each key holds its full mutation history ordered by descending seqno;
/// readers resolve to the highest-seqno version. History lets concurrent
/// scans observe a consistent cut without coupling to the writer.
pub struct MvccIndex {
    name: String,
    tree: RwLock<MvccInner>,
    seqno: AtomicU64,
}

struct MvccInner {
    versions: BTreeMap<Vec<u8>, BTreeMap<Reverse<u64>, Version>>,
    footprint: u64,
}

impl MvccIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tree: RwLock::new(MvccInner {
                versions: BTreeMap::new(),
                footprint: 0,
            }),
            seqno: AtomicU64::new(0),
        }
    }

    fn latest(versions: &BTreeMap<Reverse<u64>, Version>, key: &[u8]) -> Option<Entry> {
        versions.values().next().map(|v| Entry {
            key: key.to_vec(),
            value: v.value.clone(),
            seqno: v.seqno,
            deleted: v.deleted,
        })
    }

    fn push(
        &self,
        key: &[u8],
        value: &[u8],
        deleted: bool,
        guard: &mut MvccInner,
    ) -> (Option<Entry>, u64) {
        let seqno = self.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let versions = guard.versions.entry(key.to_vec()).or_default();
        let old = Self::latest(versions, key);
        versions.insert(
            Reverse(seqno),
            Version {
                value: value.to_vec(),
                seqno,
                deleted,
            },
        );
        guard.footprint += entry_footprint(key, value);
        (old, seqno)
    }
}

impl OrderedIndex for MvccIndex {
    fn id(&self) -> &str {
        &self.name
    }

    fn count(&self) -> u64 {
        self.tree
            .read()
            .map(|g| g.versions.len() as u64)
            .unwrap_or(0)
    }

    fn footprint(&self) -> u64 {
        self.tree.read().map(|g| g.footprint).unwrap_or(0)
    }

    fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::SeqCst)
    }

    fn set_seqno(&self, seqno: u64) {
        self.seqno.store(seqno, Ordering::SeqCst);
    }

    fn get(&self, key: &[u8]) -> Option<Entry> {
        let guard = self.tree.read().ok()?;
        guard
            .versions
            .get(key)
            .and_then(|versions| Self::latest(versions, key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(Option<Entry>, u64), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        let (old, seqno) = self.push(key, value, false, &mut guard);
        trace!(index = %self.name, seqno, "set");
        Ok((old, seqno))
    }

    fn set_cas(&self, key: &[u8], value: &[u8], cas: u64) -> Result<(Option<Entry>, u64), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        let current = guard
            .versions
            .get(key)
            .and_then(|versions| Self::latest(versions, key));
        match current {
            None => Err(MemError::CasUnresolved),
            Some(entry) if entry.deleted => {
                if cas != 0 {
                    return Err(MemError::InvalidCas);
                }
                Ok(self.push(key, value, false, &mut guard))
            }
            Some(entry) => {
                if entry.seqno != cas {
                    return Err(MemError::InvalidCas);
                }
                Ok(self.push(key, value, false, &mut guard))
            }
        }
    }

    fn delete(&self, key: &[u8], lsm: bool) -> Result<(Option<Entry>, u64), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        if lsm {
            let (old, seqno) = self.push(key, &[], true, &mut guard);
            return Ok((old, seqno));
        }
        let seqno = self.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let old = match guard.versions.remove(key) {
            Some(versions) => {
                for v in versions.values() {
                    guard.footprint -= entry_footprint(key, &v.value).min(guard.footprint);
                }
                Self::latest(&versions, key)
            }
            None => None,
        };
        Ok((old, seqno))
    }

    fn load(&self, entry: Entry) -> Result<(), MemError> {
        let mut guard = self.tree.write().map_err(poisoned)?;
        self.seqno.fetch_max(entry.seqno, Ordering::SeqCst);
        guard.footprint += entry_footprint(&entry.key, &entry.value);
        guard.versions.entry(entry.key.clone()).or_default().insert(
            Reverse(entry.seqno),
            Version {
                value: entry.value,
                seqno: entry.seqno,
                deleted: entry.deleted,
            },
        );
        Ok(())
    }

    fn scan(&self) -> Vec<Entry> {
        let Ok(guard) = self.tree.read() else {
            return Vec::new();
        };
        guard
            .versions
            .iter()
            .filter_map(|(key, versions)| Self::latest(versions, key))
            .collect()
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tree.write() {
            guard.versions.clear();
            guard.footprint = 0;
        }
    }
}
