//! # Multi-level storage engine
//!
//! A persistent, ordered key–value engine organized as a log-structured
//! merge tree. The engine coordinates up to three in-memory tiers and up to
//! sixteen immutable on-disk tiers behind one atomically swapped snapshot
//! descriptor:
//!
//! ```text
//!  writes ──► mw ──persist──► mr ──flush──► disks[0] … disks[15]
//!                                            ▲   fuse / purge   ▲
//!                                            └── compaction ────┘
//! ```
//!
//! - Every mutation gets a monotonically increasing **seqno**, which doubles
//!   as its CAS token and decides precedence during merges.
//! - Deletes in LSM mode write **tombstones** that survive until they reach
//!   the last disk level.
//! - Readers take a reference-counted snapshot and observe it unchanged for
//!   as long as they hold it.
//! - Three background workers — flusher, compactor, purger — move data down
//!   the levels and retire what readers no longer need.
//!
//! ## Concurrency model
//!
//! The snapshot pointer is the only shared mutable state on the hot path.
//! Writes hold the read side of a tri-field spin word; snapshot transitions
//! hold the write side ([`spin`]). Concurrent writers serialize on the
//! writable tier's own lock, not on the spin word.
//!
//! ## Durability
//!
//! With `durable` on, every accepted write is appended to a CRC-framed redo
//! log before returning, and the log is reset after each flush publish.
//! With it off, the engine is durable at flush boundaries only.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub(crate) mod compact;
pub(crate) mod flush;
pub mod metadata;
pub(crate) mod purge;
pub(crate) mod read;
pub(crate) mod snapshot;
pub(crate) mod spin;
pub mod txn;

pub use metadata::{StoredSettings, TierMetadata};
pub use read::ScanIter;
pub use snapshot::NLEVELS;
pub use txn::{Txn, View};

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, unbounded};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mem::{ExclusiveIndex, MemError, MvccIndex, NODE_FOOTPRINT, OrderedIndex};
use crate::table::{TableError, TableSnapshot};
use crate::wal::{RedoLog, WalError};

use compact::CompactMsg;
use flush::FlushMsg;
use purge::PurgeMsg;
use read::y_get;
use snapshot::{LevelManager, MemTier, Snapshot};
use spin::SnapSpin;

// ------------------------------------------------------------------------------------------------
// Limits
// ------------------------------------------------------------------------------------------------

/// Smallest accepted key length in bytes.
pub const MIN_KEYLEN: usize = 1;

/// Largest accepted key length in bytes.
pub const MAX_KEYLEN: usize = 4096;

/// Largest accepted value length in bytes.
pub const MAX_VALLEN: usize = 10 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Core data model
// ------------------------------------------------------------------------------------------------

/// One versioned key–value entry. A *tombstone* is an entry with `deleted`
/// set and an empty value; it masks older versions of the key until it
/// reaches the last disk level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Unique, monotonic across all mutations of one engine instance.
    /// Doubles as the entry's CAS token.
    pub seqno: u64,
    pub deleted: bool,
}

/// Redo-log record for one accepted mutation.
#[derive(Debug, bincode::Encode, bincode::Decode)]
pub(crate) enum RedoRecord {
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        seqno: u64,
    },
    Delete {
        key: Vec<u8>,
        seqno: u64,
        lsm: bool,
    },
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the engine. "Not found" is not an error: lookups
/// return `Ok(None)` and CAS treats absence via the zero token.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Compare-and-set token did not match the current entry.
    #[error("invalid CAS")]
    InvalidCas,

    /// Close refused while scans or transactions are outstanding.
    #[error("active iterators outstanding")]
    ActiveIterators,

    /// Stored on-disk settings disagree with the requested configuration.
    #[error("settings mismatch: {0}")]
    SettingsMismatch(String),

    /// The requested configuration is invalid on its own.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The in-memory tier cannot grow further. The engine has already
    /// switched to DGM and scheduled a flush; retry once it drains.
    #[error("in-memory tier is full, flush pending")]
    OutOfSpace,

    /// Key length outside the accepted bounds.
    #[error("key length {0} out of bounds")]
    KeySize(usize),

    /// Value length outside the accepted bounds.
    #[error("value length {0} out of bounds")]
    ValueSize(usize),

    /// The engine is closed.
    #[error("engine is shut down")]
    Shutdown,

    /// In-memory index failure.
    #[error("mem index: {0}")]
    Mem(#[from] MemError),

    /// Disk tier failure.
    #[error("table: {0}")]
    Table(#[from] TableError),

    /// Redo log failure.
    #[error("redo log: {0}")]
    Wal(#[from] WalError),

    /// Tier metadata failure.
    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation; indicates engine state corruption.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Engine settings. Stored inside every disk tier the engine builds; a
/// mismatch between stored and requested values for memstore, diskstore,
/// logpath, diskpaths or block sizes is a fatal open error.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redo-log directory. Defaults to the first diskpath when durable.
    pub logpath: Option<PathBuf>,

    /// In-memory index flavor: `"exclusive"` or `"mvcc"`.
    pub memstore: String,

    /// Disk tier implementation: `"table"`.
    pub diskstore: String,

    /// Append every write to the redo log before acknowledging it.
    pub durable: bool,

    /// Force disk-greater-than-memory mode from the start.
    pub dgm: bool,

    /// Keep a working-set cache (`mc`) of hot keys promoted from disk.
    pub workingset: bool,

    /// Flush fallback threshold: a memory tier smaller than
    /// `flushratio × payload(newest tier)` is written without merging.
    pub flushratio: f64,

    /// Compact an adjacent pair whose payload ratio exceeds this.
    pub compactratio: f64,

    /// Flush cadence. Zero disables periodic flushes; `commit` still works.
    pub autocommit: Duration,

    /// Compaction cadence and tier age bound. Zero disables the periodic
    /// compactor; `tombstone_purge` still works.
    pub compactperiod: Duration,

    /// Memory budget for the mutable tiers, in bytes.
    pub memcapacity: u64,

    /// Roots that hold tier directories.
    pub diskpaths: Vec<PathBuf>,

    /// Index block size handed to the builder.
    pub mblocksize: usize,

    /// Leaf block size handed to the builder.
    pub zblocksize: usize,

    /// Value-log block size; zero keeps values inline.
    pub vblocksize: usize,

    /// Memory-map tier files instead of positioned reads.
    pub mmap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logpath: None,
            memstore: "mvcc".to_string(),
            diskstore: "table".to_string(),
            durable: false,
            dgm: false,
            workingset: false,
            flushratio: 0.25,
            compactratio: 0.5,
            autocommit: Duration::from_secs(30),
            compactperiod: Duration::from_secs(120),
            memcapacity: 64 * 1024 * 1024,
            diskpaths: Vec::new(),
            mblocksize: 4096,
            zblocksize: 4096,
            vblocksize: 0,
            mmap: true,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), EngineError> {
        match self.memstore.as_str() {
            "exclusive" | "mvcc" => {}
            other => {
                return Err(EngineError::Config(format!("invalid memstore {other:?}")));
            }
        }
        if self.diskstore != "table" {
            return Err(EngineError::Config(format!(
                "invalid diskstore {:?}",
                self.diskstore
            )));
        }
        if self.diskpaths.is_empty() {
            return Err(EngineError::Config("no diskpaths configured".into()));
        }
        if self.mblocksize == 0 || self.zblocksize == 0 {
            return Err(EngineError::Config("block sizes must be non-zero".into()));
        }
        if self.flushratio <= 0.0 || self.compactratio <= 0.0 {
            return Err(EngineError::Config("ratios must be positive".into()));
        }
        if self.memcapacity == 0 {
            return Err(EngineError::Config("memcapacity must be non-zero".into()));
        }
        Ok(())
    }

    fn logdir(&self, name: &str) -> Option<PathBuf> {
        if !self.durable {
            return None;
        }
        let root = self
            .logpath
            .clone()
            .or_else(|| self.diskpaths.first().cloned())?;
        Some(root.join(format!("terrace-{name}-logs")))
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Vitals of one tier, as reported by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct TierStats {
    pub id: String,
    /// Disk slot, or `None` for an in-memory tier.
    pub level: Option<usize>,
    pub count: u64,
    pub footprint: u64,
    pub seqno: u64,
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub seqno: u64,
    pub dgm: bool,
    pub mem_tiers: Vec<TierStats>,
    pub disk_tiers: Vec<TierStats>,
    /// Bytes written into disk tiers over the engine's lifetime.
    pub write_amplification: u64,
}

// ------------------------------------------------------------------------------------------------
// Engine internals
// ------------------------------------------------------------------------------------------------

struct Workers {
    flusher: Option<JoinHandle<()>>,
    compactor: Option<JoinHandle<()>>,
    purger: Option<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    pub(crate) name: String,
    pub(crate) cfg: Config,
    pub(crate) epoch: Instant,
    pub(crate) dgm: AtomicBool,
    pub(crate) spin: SnapSpin,
    pub(crate) levels: LevelManager,
    pub(crate) mem_versions: Mutex<[u32; 3]>,
    pub(crate) disk_versions: Mutex<[u64; NLEVELS]>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) redo: Option<RedoLog<RedoRecord>>,
    /// Levels the compactor is currently fusing (sources plus target).
    pub(crate) compacting: Mutex<Vec<usize>>,
    /// Levels the flusher is currently fusing (sources plus target).
    pub(crate) flushing: Mutex<Vec<usize>>,
    pub(crate) wramp: AtomicU64,
    pub(crate) closed: AtomicBool,
    pub(crate) flush_tx: Sender<FlushMsg>,
    pub(crate) compact_tx: Sender<CompactMsg>,
    pub(crate) purge_tx: Sender<PurgeMsg>,
    workers: Mutex<Workers>,
}

impl EngineInner {
    /// Allocate a fresh in-memory tier of the configured flavor, its seqno
    /// counter resumed at `seqno`.
    pub(crate) fn new_mem_index(&self, tier: &str, seqno: u64) -> MemTier {
        let version = {
            let mut versions = self.mem_versions.lock().unwrap_or_else(|e| e.into_inner());
            let at = match tier {
                "mw" => 0,
                "mr" => 1,
                _ => 2,
            };
            versions[at] += 1;
            versions[at]
        };
        let name = format!("{}-{}-{}", self.name, tier, version);
        let index: MemTier = match self.cfg.memstore.as_str() {
            "exclusive" => Arc::new(ExclusiveIndex::new(&name)),
            _ => Arc::new(MvccIndex::new(&name)),
        };
        index.set_seqno(seqno);
        debug!(id = %name, memstore = %self.cfg.memstore, "new mem tier");
        index
    }

    /// A fresh, empty working-set tier — or `None` when disabled.
    pub(crate) fn new_working_set(&self) -> Option<MemTier> {
        if self.cfg.workingset {
            Some(self.new_mem_index("mc", 0))
        } else {
            None
        }
    }

    /// Reserve the next version for `level` and return the directory the
    /// build should write into.
    pub(crate) fn next_tier_dir(&self, level: usize) -> Result<PathBuf, EngineError> {
        let version = {
            let mut versions = self
                .disk_versions
                .lock()
                .map_err(|_| EngineError::Internal("disk version registry poisoned".into()))?;
            versions[level] += 1;
            versions[level]
        };
        let dirname = format!("{}-{}-{}-{}", self.name, level, version, new_uuid());
        let root = &self.cfg.diskpaths[(version as usize) % self.cfg.diskpaths.len()];
        Ok(root.join(dirname))
    }

    pub(crate) fn tier_metadata(&self, disk: &TableSnapshot) -> Result<TierMetadata, EngineError> {
        TierMetadata::decode(disk.metadata())
    }

    /// Has the newest tier (or the engine epoch, when no tier exists) aged
    /// past the autocommit period?
    pub(crate) fn flush_elapsed(&self) -> bool {
        let Some(head) = self.levels.head() else {
            return false;
        };
        match head.latest_level() {
            None => self.epoch.elapsed() > self.cfg.autocommit,
            Some(level) => {
                let disk = head.disks[level].as_ref().expect("occupied level");
                match self.tier_metadata(disk).and_then(|m| m.flushunix()) {
                    Ok(flushed) => {
                        flush::unix_now().saturating_sub(flushed) > self.cfg.autocommit.as_secs()
                    }
                    Err(e) => {
                        warn!(error = %e, "unreadable tier metadata, forcing flush");
                        true
                    }
                }
            }
        }
    }

    pub(crate) fn is_dgm(&self) -> bool {
        self.dgm.load(Ordering::SeqCst)
    }

    /// Write-path insert. Caller holds the snap-spin read side.
    pub(crate) fn write_set(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Option<Entry>, u64), EngineError> {
        check_key(key)?;
        check_value(value)?;
        let snap = self.levels.latest().ok_or(EngineError::Shutdown)?;
        let mw = snap
            .mw
            .clone()
            .ok_or_else(|| EngineError::Internal("no writable tier".into()))?;
        drop(snap);

        if mw.footprint() > self.cfg.memcapacity.saturating_mul(2) {
            self.enter_dgm(&mw);
            return Err(EngineError::OutOfSpace);
        }

        let (old, seqno) = mw.set(key, value)?;
        if let Some(redo) = &self.redo {
            redo.append(&RedoRecord::Set {
                key: key.to_vec(),
                value: value.to_vec(),
                seqno,
            })?;
        }
        self.after_write(&mw);
        Ok((old, seqno))
    }

    /// Write-path delete. Caller holds the snap-spin read side. DGM forces
    /// LSM semantics, and so does any existing disk tier: a physical
    /// removal from `mw` alone would let the key resurface from the tier
    /// it still lives in.
    pub(crate) fn write_delete(
        &self,
        key: &[u8],
        lsm: bool,
    ) -> Result<(Option<Entry>, u64), EngineError> {
        check_key(key)?;
        let snap = self.levels.latest().ok_or(EngineError::Shutdown)?;
        let lsm = lsm || self.is_dgm() || snap.latest_level().is_some();
        let mw = snap
            .mw
            .clone()
            .ok_or_else(|| EngineError::Internal("no writable tier".into()))?;
        drop(snap);

        let (old, seqno) = mw.delete(key, lsm)?;
        if let Some(redo) = &self.redo {
            redo.append(&RedoRecord::Delete {
                key: key.to_vec(),
                seqno,
                lsm,
            })?;
        }
        self.after_write(&mw);
        Ok((old, seqno))
    }

    pub(crate) fn after_write(&self, mw: &MemTier) {
        if mw.footprint() > self.cfg.memcapacity {
            self.enter_dgm(mw);
        }
    }

    fn enter_dgm(&self, mw: &MemTier) {
        if !self.dgm.swap(true, Ordering::SeqCst) {
            info!(
                footprint = mw.footprint(),
                capacity = self.cfg.memcapacity,
                "memory capacity reached, entering DGM mode"
            );
        }
        let _ = self.flush_tx.send(FlushMsg::Nudge);
    }
}

fn check_key(key: &[u8]) -> Result<(), EngineError> {
    if key.len() < MIN_KEYLEN || key.len() > MAX_KEYLEN {
        return Err(EngineError::KeySize(key.len()));
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<(), EngineError> {
    if value.len() > MAX_VALLEN {
        return Err(EngineError::ValueSize(value.len()));
    }
    Ok(())
}

fn new_uuid() -> String {
    format!("{:016x}", rand::random::<u64>())
}

// ------------------------------------------------------------------------------------------------
// Engine handle
// ------------------------------------------------------------------------------------------------

/// The public engine handle. Cloneable; all clones share one instance.
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine {
    /// Open (or create) the engine named `name`.
    ///
    /// Scans the configured diskpaths, keeps the highest tier version per
    /// level and destroys older ones, validates stored settings against the
    /// requested configuration, replays the redo log when durable, and —
    /// when the newest tier fits the memory budget — warms the writable
    /// tier from it. Otherwise the engine starts in DGM mode.
    pub fn open(name: &str, cfg: Config) -> Result<Engine, EngineError> {
        cfg.validate()?;
        if name.is_empty() || name.contains('-') {
            return Err(EngineError::Config(format!("invalid engine name {name:?}")));
        }

        for path in &cfg.diskpaths {
            fs::create_dir_all(path)?;
        }
        if let Some(logdir) = cfg.logdir(name) {
            fs::create_dir_all(&logdir)?;
        }

        info!(name, "opening engine");
        let kept = housekeep(name, &cfg)?;

        // Open the surviving tiers.
        let mut disks = Snapshot::empty_disks();
        let mut scanned_versions = [0u64; NLEVELS];
        for (level, version, path) in &kept {
            match TableSnapshot::open(path, cfg.mmap) {
                Ok(disk) => {
                    scanned_versions[*level] = *version;
                    disks[*level] = Some(Arc::new(disk));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping unreadable tier");
                    let _ = fs::remove_dir_all(path);
                }
            }
        }

        // The newest tier's metadata is authoritative for versions and the
        // resume seqno, and must agree with the requested settings.
        let mut mem_versions = [0u32; 3];
        let mut disk_versions = scanned_versions;
        let mut last_seqno = 0u64;
        if let Some(level) = disks.iter().position(|d| d.is_some()) {
            let newest = disks[level].as_ref().expect("occupied level");
            let meta = TierMetadata::decode(newest.metadata())?;
            meta.validate_against(&cfg)?;
            mem_versions = meta.memversions;
            for (at, stored) in meta.diskversions.iter().enumerate() {
                disk_versions[at] = (*stored).max(scanned_versions[at]);
            }
            last_seqno = meta.seqno()?;
        }

        let occupied = disks.iter().filter(|d| d.is_some()).count();
        let mut dgm = cfg.dgm || occupied > 1;

        let (flush_tx, flush_rx) = unbounded();
        let (compact_tx, compact_rx) = unbounded();
        let (purge_tx, purge_rx) = unbounded();
        let mut inner = Arc::new(EngineInner {
            name: name.to_string(),
            cfg,
            epoch: Instant::now(),
            dgm: AtomicBool::new(false),
            spin: SnapSpin::new(),
            levels: LevelManager::new(),
            mem_versions: Mutex::new(mem_versions),
            disk_versions: Mutex::new(disk_versions),
            commit_lock: Mutex::new(()),
            redo: None,
            compacting: Mutex::new(Vec::new()),
            flushing: Mutex::new(Vec::new()),
            wramp: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            flush_tx,
            compact_tx,
            purge_tx,
            workers: Mutex::new(Workers {
                flusher: None,
                compactor: None,
                purger: None,
            }),
        });

        // Warm the writable tier from the newest disk tier when the
        // projection fits the memory budget.
        let mw = inner.new_mem_index("mw", last_seqno);
        if !dgm {
            if let Some(newest) = disks.iter().flatten().next() {
                let projected = 2 * newest.count() * NODE_FOOTPRINT;
                if projected < inner.cfg.memcapacity {
                    warmup(&mw, newest)?;
                    info!(
                        from = newest.id(),
                        entries = newest.count(),
                        "warmed writable tier from disk"
                    );
                } else {
                    info!(
                        projected,
                        capacity = inner.cfg.memcapacity,
                        "newest tier too large for memory, entering DGM mode"
                    );
                    dgm = true;
                }
            }
        }
        inner.dgm.store(dgm, Ordering::SeqCst);

        // Redo log: records past the newest tier's seqno are replayed.
        if let Some(logdir) = inner.cfg.logdir(name) {
            let redo: RedoLog<RedoRecord> = RedoLog::open(logdir.join("redo.log"))?;
            let mut replayed = 0usize;
            for record in redo.replay()? {
                match record {
                    RedoRecord::Set { key, value, seqno } if seqno > last_seqno => {
                        mw.load(Entry {
                            key,
                            value,
                            seqno,
                            deleted: false,
                        })?;
                        replayed += 1;
                    }
                    RedoRecord::Delete { key, seqno, .. } if seqno > last_seqno => {
                        mw.load(Entry {
                            key,
                            value: Vec::new(),
                            seqno,
                            deleted: true,
                        })?;
                        replayed += 1;
                    }
                    _ => {}
                }
            }
            if replayed > 0 {
                info!(replayed, "replayed redo log into writable tier");
            }
            Arc::get_mut(&mut inner)
                .ok_or_else(|| EngineError::Internal("engine handle leaked during open".into()))?
                .redo = Some(redo);
        }

        let head = Snapshot::new(Some(mw), None, None, disks);
        inner.levels.publish(head);

        // Background workers.
        {
            let mut workers = inner
                .workers
                .lock()
                .map_err(|_| EngineError::Internal("worker registry poisoned".into()))?;
            let p = Arc::clone(&inner);
            workers.purger = Some(std::thread::spawn(move || purge::purger(p, purge_rx)));
            let f = Arc::clone(&inner);
            workers.flusher = Some(std::thread::spawn(move || flush::flusher(f, flush_rx)));
            let c = Arc::clone(&inner);
            workers.compactor = Some(std::thread::spawn(move || compact::compactor(c, compact_rx)));
        }

        info!(name, tiers = occupied, seqno = last_seqno, dgm, "engine open");
        Ok(Engine { inner })
    }

    /// Current mutation seqno.
    pub fn seqno(&self) -> u64 {
        self.inner
            .levels
            .latest()
            .map(|snap| snap.mw_seqno())
            .unwrap_or(0)
    }

    /// Engine name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Is the engine in disk-greater-than-memory mode?
    pub fn is_dgm(&self) -> bool {
        self.inner.is_dgm()
    }

    /// Point lookup across all tiers, newest first. Tombstones are
    /// observable: a deleted key returns an entry with `deleted` set.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, EngineError> {
        let snap = self.inner.levels.latest().ok_or(EngineError::Shutdown)?;
        y_get(&self.inner, &snap, key)
    }

    /// Full-table ordered scan bound to the snapshot in force now.
    /// Tombstones are emitted, not filtered.
    pub fn scan(&self) -> Result<ScanIter, EngineError> {
        let snap = self.inner.levels.latest().ok_or(EngineError::Shutdown)?;
        ScanIter::full(snap)
    }

    /// Insert or overwrite. Returns the previous live value (if any) and
    /// the seqno/CAS of the new entry.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(Option<Vec<u8>>, u64), EngineError> {
        self.inner.spin.rlock();
        let result = self.inner.write_set(key, value);
        self.inner.spin.runlock();
        result.map(|(old, seqno)| (live_value(old), seqno))
    }

    /// Insert only when `cas` matches the entry's current seqno (zero for
    /// an absent or deleted key). Decides on the writable tier when it can;
    /// escalates to a serialized snapshot-view read-modify-write otherwise.
    pub fn set_cas(
        &self,
        key: &[u8],
        value: &[u8],
        cas: u64,
    ) -> Result<(Option<Vec<u8>>, u64), EngineError> {
        check_key(key)?;
        check_value(value)?;

        self.inner.spin.rlock();
        let fast = (|| {
            let snap = self.inner.levels.latest().ok_or(EngineError::Shutdown)?;
            let mw = snap
                .mw
                .clone()
                .ok_or_else(|| EngineError::Internal("no writable tier".into()))?;
            drop(snap);
            match mw.set_cas(key, value, cas) {
                Ok((old, seqno)) => {
                    if let Some(redo) = &self.inner.redo {
                        redo.append(&RedoRecord::Set {
                            key: key.to_vec(),
                            value: value.to_vec(),
                            seqno,
                        })?;
                    }
                    self.inner.after_write(&mw);
                    Ok(Some((old, seqno)))
                }
                Err(MemError::CasUnresolved) => Ok(None),
                Err(MemError::InvalidCas) => Err(EngineError::InvalidCas),
                Err(e) => Err(EngineError::Mem(e)),
            }
        })();
        self.inner.spin.runlock();

        match fast? {
            Some((old, seqno)) => Ok((live_value(old), seqno)),
            None => self.set_cas_across_tiers(key, value, cas),
        }
    }

    /// The escalated CAS: observe the effective entry across all tiers
    /// under a snapshot view, then write. Serialized on the commit lock,
    /// which also covers transaction commits.
    fn set_cas_across_tiers(
        &self,
        key: &[u8],
        value: &[u8],
        cas: u64,
    ) -> Result<(Option<Vec<u8>>, u64), EngineError> {
        // Read side first, then the commit lock — the same order a
        // transaction uses (read side at begin, commit lock at commit).
        self.inner.spin.rlock();
        let _serialize = match self.inner.commit_lock.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.inner.spin.runlock();
                return Err(EngineError::Internal("commit lock poisoned".into()));
            }
        };

        let result = (|| {
            let snap = self.inner.levels.latest().ok_or(EngineError::Shutdown)?;
            let current = y_get(&self.inner, &snap, key)?;
            drop(snap);

            let effective = current.filter(|e| !e.deleted);
            let matches = match &effective {
                Some(entry) => entry.seqno == cas,
                None => cas == 0,
            };
            if !matches {
                return Err(EngineError::InvalidCas);
            }
            let (_, seqno) = self.inner.write_set(key, value)?;
            Ok((effective.map(|e| e.value), seqno))
        })();
        self.inner.spin.runlock();
        result
    }

    /// Delete a key. With `lsm` true (forced in DGM mode) a tombstone is
    /// written; otherwise the entry is removed from the writable tier.
    /// Returns the previous live value and the delete's seqno.
    pub fn delete(&self, key: &[u8], lsm: bool) -> Result<(Option<Vec<u8>>, u64), EngineError> {
        self.inner.spin.rlock();
        let result = self.inner.write_delete(key, lsm);
        self.inner.spin.runlock();
        result.map(|(old, seqno)| (live_value(old), seqno))
    }

    /// Start a read-write transaction bound to the snapshot in force now.
    pub fn begin_txn(&self, id: u64) -> Result<Txn, EngineError> {
        self.inner.spin.rlock();
        match self.inner.levels.latest() {
            Some(snap) => Ok(Txn::new(self.clone(), snap, id)),
            None => {
                self.inner.spin.runlock();
                Err(EngineError::Shutdown)
            }
        }
    }

    /// Start a read-only view bound to the snapshot in force now.
    pub fn view(&self, id: u64) -> Result<View, EngineError> {
        self.inner.spin.rlock();
        match self.inner.levels.latest() {
            Some(snap) => Ok(View::new(self.clone(), snap, id)),
            None => {
                self.inner.spin.runlock();
                Err(EngineError::Shutdown)
            }
        }
    }

    /// Flush now. `appdata` is stored opaquely in the resulting tier's
    /// metadata. Blocks until the flush completes.
    pub fn commit(&self, appdata: Option<Vec<u8>>) -> Result<(), EngineError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let (done, wait) = bounded(1);
        self.inner
            .flush_tx
            .send(FlushMsg::Commit { appdata, done })
            .map_err(|_| EngineError::Shutdown)?;
        wait.recv().map_err(|_| EngineError::Shutdown)?
    }

    /// Compact the last disk level with tombstone removal. Blocks until the
    /// build completes; returns whether one ran.
    pub fn tombstone_purge(&self) -> Result<bool, EngineError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let (done, wait) = bounded(1);
        self.inner
            .compact_tx
            .send(CompactMsg::TombstonePurge { done })
            .map_err(|_| EngineError::Shutdown)?;
        wait.recv().map_err(|_| EngineError::Shutdown)?
    }

    /// Engine vitals.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let snap = self.inner.levels.latest().ok_or(EngineError::Shutdown)?;
        let mut mem_tiers = Vec::new();
        for tier in [&snap.mw, &snap.mr, &snap.mc].into_iter().flatten() {
            mem_tiers.push(TierStats {
                id: tier.id().to_string(),
                level: None,
                count: tier.count(),
                footprint: tier.footprint(),
                seqno: tier.seqno(),
            });
        }
        let mut disk_tiers = Vec::new();
        for (level, disk) in snap.disks.iter().enumerate() {
            if let Some(disk) = disk {
                disk_tiers.push(TierStats {
                    id: disk.id().to_string(),
                    level: Some(level),
                    count: disk.count(),
                    footprint: disk.footprint(),
                    seqno: disk.seqno(),
                });
            }
        }
        Ok(EngineStats {
            seqno: snap.mw_seqno(),
            dgm: self.inner.is_dgm(),
            mem_tiers,
            disk_tiers,
            write_amplification: self.inner.wramp.load(Ordering::Relaxed),
        })
    }

    /// Walk every level asserting seqno monotonicity and per-tier
    /// integrity.
    pub fn validate(&self) -> Result<(), EngineError> {
        let snap = self.inner.levels.latest().ok_or(EngineError::Shutdown)?;
        let mut floor = 0u64;
        for disk in snap.disk_levels().iter().rev() {
            disk.validate()?;
            if disk.seqno() < floor {
                return Err(EngineError::Internal(format!(
                    "tier {} seqno {} below older tier's {}",
                    disk.id(),
                    disk.seqno(),
                    floor
                )));
            }
            floor = disk.seqno();
            info!(id = disk.id(), seqno = disk.seqno(), "validated tier");
        }
        if snap.mw_seqno() < floor {
            return Err(EngineError::Internal(format!(
                "writable tier seqno {} below disk seqno {}",
                snap.mw_seqno(),
                floor
            )));
        }
        Ok(())
    }

    /// Log vitals for every active tier.
    pub fn log_levels(&self) {
        let Some(snap) = self.inner.levels.latest() else {
            return;
        };
        for tier in [&snap.mw, &snap.mr, &snap.mc].into_iter().flatten() {
            info!(
                id = tier.id(),
                count = tier.count(),
                footprint = tier.footprint(),
                "mem tier"
            );
        }
        for disk in snap.disk_levels() {
            info!(
                id = disk.id(),
                count = disk.count(),
                footprint = disk.footprint(),
                payload = disk.payload(),
                "disk tier"
            );
        }
    }

    /// Shut down: final flush if dirty, join workers, release references,
    /// close tiers. Refuses while scans or transactions are outstanding.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // A background flush or compaction holds a transient reference;
        // wait those out, then refuse only on genuinely outstanding
        // scans/transactions.
        let mut drained = false;
        for _ in 0..100 {
            match self.inner.levels.head() {
                Some(head) if head.refcount() > 1 => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => {
                    drained = true;
                    break;
                }
            }
        }
        if !drained {
            self.inner.closed.store(false, Ordering::SeqCst);
            return Err(EngineError::ActiveIterators);
        }
        info!(name = %self.inner.name, "closing engine");

        // Stop the schedulers; the flusher performs the final flush.
        let _ = self.inner.flush_tx.send(FlushMsg::Shutdown);
        let _ = self.inner.compact_tx.send(CompactMsg::Shutdown);
        let (flusher, compactor) = {
            let mut workers = self
                .inner
                .workers
                .lock()
                .map_err(|_| EngineError::Internal("worker registry poisoned".into()))?;
            (workers.flusher.take(), workers.compactor.take())
        };
        for handle in [flusher, compactor].into_iter().flatten() {
            let _ = handle.join();
        }

        // The purger drains everything the final flush retired, then stops.
        let _ = self.inner.purge_tx.send(PurgeMsg::Shutdown);
        let purger = {
            let mut workers = self
                .inner
                .workers
                .lock()
                .map_err(|_| EngineError::Internal("worker registry poisoned".into()))?;
            workers.purger.take()
        };
        if let Some(handle) = purger {
            let _ = handle.join();
        }

        // Release the final descriptor; tiers close as references drop.
        if let Some(head) = self.inner.levels.clear() {
            for tier in [&head.mw, &head.mr, &head.mc].into_iter().flatten() {
                tier.close();
            }
            for disk in head.disks.iter().flatten() {
                debug!(id = disk.id(), "closing disk tier");
            }
        }

        info!(
            name = %self.inner.name,
            written = self.inner.wramp.load(Ordering::Relaxed),
            "engine closed"
        );
        Ok(())
    }

    /// Erase the engine's on-disk directory tree. Only valid after
    /// [`Engine::close`].
    pub fn destroy(self) -> Result<(), EngineError> {
        if !self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("destroy before close".into()));
        }
        purge_index(&self.inner.name, &self.inner.cfg)
    }
}

fn live_value(old: Option<Entry>) -> Option<Vec<u8>> {
    old.filter(|e| !e.deleted).map(|e| e.value)
}

fn warmup(mw: &MemTier, newest: &Arc<TableSnapshot>) -> Result<(), EngineError> {
    for entry in TableSnapshot::scan_entries(newest) {
        mw.load(entry?)?;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Offline maintenance
// ------------------------------------------------------------------------------------------------

/// Parse `{name}-{level}-{version}-{uuid}` directory names belonging to
/// engine `name`.
fn parse_tier_dir(name: &str, dirname: &str) -> Option<(usize, u64)> {
    let mut parts = dirname.rsplitn(4, '-');
    let _uuid = parts.next()?;
    let version: u64 = parts.next()?.parse().ok()?;
    let level: usize = parts.next()?.parse().ok()?;
    let owner = parts.next()?;
    if owner != name || level >= NLEVELS {
        return None;
    }
    Some((level, version))
}

/// Scan every diskpath, keep the highest version per level, destroy older
/// versions. Returns the keepers sorted by level, newest first.
fn housekeep(name: &str, cfg: &Config) -> Result<Vec<(usize, u64, PathBuf)>, EngineError> {
    let mut best: [Option<(u64, PathBuf)>; NLEVELS] = std::array::from_fn(|_| None);

    for root in &cfg.diskpaths {
        if !root.exists() {
            continue;
        }
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dirname = entry.file_name();
            let Some(dirname) = dirname.to_str() else {
                continue;
            };
            let Some((level, version)) = parse_tier_dir(name, dirname) else {
                continue;
            };
            match &best[level] {
                Some((kept, _)) if *kept >= version => {
                    info!(dir = dirname, "removing stale tier version");
                    fs::remove_dir_all(entry.path())?;
                }
                Some((_, old_path)) => {
                    info!(dir = %old_path.display(), "removing stale tier version");
                    fs::remove_dir_all(old_path)?;
                    best[level] = Some((version, entry.path()));
                }
                None => {
                    best[level] = Some((version, entry.path()));
                }
            }
        }
    }

    Ok(best
        .into_iter()
        .enumerate()
        .filter_map(|(level, kept)| kept.map(|(version, path)| (level, version, path)))
        .collect())
}

/// Remove every disk tier and redo log belonging to engine `name`.
pub fn purge_index(name: &str, cfg: &Config) -> Result<(), EngineError> {
    for root in &cfg.diskpaths {
        if !root.exists() {
            continue;
        }
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(dirname) = entry.file_name().to_str() {
                if parse_tier_dir(name, dirname).is_some() {
                    info!(dir = dirname, "purging tier");
                    fs::remove_dir_all(entry.path())?;
                }
            }
        }
    }

    let logdirname = format!("terrace-{name}-logs");
    let mut roots: Vec<PathBuf> = cfg.diskpaths.clone();
    if let Some(logpath) = &cfg.logpath {
        roots.push(logpath.clone());
    }
    for root in roots {
        let logdir = root.join(&logdirname);
        if logdir.is_dir() {
            info!(dir = %logdir.display(), "purging redo logs");
            fs::remove_dir_all(&logdir)?;
        }
    }
    Ok(())
}

/// Retire stale tier versions, and with `merge` set, fuse every level into
/// a single tier in the last slot. Offline maintenance: no engine may be
/// open on the same directories.
pub fn compact_index(name: &str, cfg: &Config, merge: bool) -> Result<(), EngineError> {
    let kept = housekeep(name, cfg)?;
    if !merge || kept.len() <= 1 {
        return Ok(());
    }

    let mut tables = Vec::with_capacity(kept.len());
    for (_, _, path) in &kept {
        tables.push(Arc::new(TableSnapshot::open(path, false)?));
    }

    // The newest tier's metadata seeds the merged tier.
    let newest_meta = TierMetadata::decode(tables[0].metadata())?;
    let mut disk_versions = newest_meta.diskversions;
    for (level, version, _) in &kept {
        disk_versions[*level] = disk_versions[*level].max(*version);
    }
    let level = NLEVELS - 1;
    disk_versions[level] += 1;
    let dirname = format!("{}-{}-{}-{}", name, level, disk_versions[level], new_uuid());
    let dir = cfg.diskpaths[0].join(&dirname);

    info!(
        mode = %flush::BuildMode::OfflineMerge,
        sources = tables.len(),
        target = %dirname,
        "merging all levels"
    );

    let sources = tables
        .iter()
        .map(|t| read::TierSource::Disk(TableSnapshot::scan_entries(t)))
        .collect();
    let mut merged = ScanIter::over(None, sources)?;

    let result = (|| -> Result<(), EngineError> {
        let mut builder =
            crate::table::TableBuilder::new(&dir, cfg.mblocksize, cfg.zblocksize, cfg.vblocksize)?;
        builder.tombstone_purge(true);
        let mut err = None;
        let stats = {
            let mut feed = read::Drain {
                merged: &mut merged,
                err: &mut err,
            };
            builder.build(&mut feed)?
        };
        if let Some(e) = err {
            return Err(e);
        }
        let metadata = TierMetadata::new(
            stats.seqno_max,
            newest_meta.flushunix()?,
            &newest_meta.appdata()?,
            newest_meta.memversions,
            disk_versions,
            cfg,
        )
        .encode()?;
        builder.finish(&metadata)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_dir_all(&dir);
        return result;
    }

    for table in &tables {
        table.destroy()?;
    }
    Ok(())
}
