//! # Terrace
//!
//! An embeddable, persistent, ordered key-value storage engine built as a
//! multi-level **Log-Structured Merge tree**. Designed for key spaces that
//! vastly exceed RAM, with tombstone-aware merging driven by a monotonic
//! sequence number on every write.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Engine                             │
//! │   ┌──────┐   persist   ┌──────┐     flush      ┌────────┐  │
//! │   │  mw  │ ──────────► │  mr  │ ─────────────► │disks[0]│  │
//! │   └──────┘             └──────┘                │  ...   │  │
//! │      ▲                                         │disks[15]  │
//! │   writes      ┌──────┐  promote from disk      └───┬────┘  │
//! │               │  mc  │ ◄───────────────────────────┤       │
//! │               └──────┘        compaction  ─────────┘       │
//! │                                                            │
//! │   snapshot descriptor {mw, mr, mc, disks[0..16]}           │
//! │   flusher · compactor · purger background workers          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | The coordinator — snapshots, schedulers, merged reads |
//! | [`mem`] | In-memory ordered indexes (`exclusive` and `mvcc` flavors) |
//! | [`table`] | Immutable on-disk tiers — builder, reader, iterators |
//! | [`wal`] | CRC-protected redo log for the durable configuration |
//!
//! ## Key properties
//!
//! - **Seqno discipline** — every mutation carries a unique, monotonic
//!   seqno; lower disk levels always hold newer data than higher ones.
//! - **Snapshot reads** — lookups and scans bind to one immutable snapshot
//!   descriptor; concurrent flushes and compactions never move the ground
//!   under a reader.
//! - **Tombstone-aware merging** — deletes survive as tombstones until
//!   they reach the last disk level, where an explicit purge drops them.
//! - **Crash recovery** — tier directories are versioned; open keeps the
//!   highest version per level and discards the rest.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use terrace::{Config, Engine};
//!
//! let cfg = Config {
//!     diskpaths: vec!["/tmp/terrace-db".into()],
//!     ..Config::default()
//! };
//! let engine = Engine::open("quickstart", cfg).unwrap();
//!
//! engine.set(b"hello", b"world").unwrap();
//! let entry = engine.get(b"hello").unwrap().unwrap();
//! assert_eq!(entry.value, b"world");
//!
//! engine.commit(None).unwrap();       // persist to a disk tier
//! engine.delete(b"hello", true).unwrap();
//!
//! engine.close().unwrap();
//! ```

pub mod engine;
pub mod mem;
pub mod table;
pub mod wal;

pub use engine::{
    Config, Engine, EngineError, EngineStats, Entry, ScanIter, TierStats, Txn, View,
    compact_index, purge_index,
};
