//! Build/open roundtrip, lookup, scan, value-log and purge behavior.

use std::sync::Arc;

use tempfile::TempDir;

use crate::engine::Entry;
use crate::table::{TableBuilder, TableSnapshot};

fn entry(key: &str, value: &str, seqno: u64, deleted: bool) -> Entry {
    Entry {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        seqno,
        deleted,
    }
}

/// `n` entries `key-0000..`, seqnos `1..=n`.
fn sample_entries(n: u64) -> Vec<Entry> {
    (1..=n)
        .map(|i| entry(&format!("key-{i:04}"), &format!("val-{i:04}"), i, false))
        .collect()
}

fn build(dir: &std::path::Path, entries: Vec<Entry>, vblock: usize, purge: bool) -> TableSnapshot {
    let mut builder = TableBuilder::new(dir, 4096, 4096, vblock).unwrap();
    builder.tombstone_purge(purge);
    let mut iter = entries.into_iter();
    builder.build(&mut iter).unwrap();
    builder.finish(b"{\"app\":\"test\"}").unwrap();
    TableSnapshot::open(dir, true).unwrap()
}

#[test]
fn build_open_get_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-3-1-abcd");
    let table = build(&dir, sample_entries(500), 0, false);

    assert_eq!(table.id(), "t-3-1-abcd");
    assert_eq!(table.count(), 500);
    assert_eq!(table.seqno(), 500);
    assert_eq!(table.metadata(), b"{\"app\":\"test\"}");
    assert!(table.footprint() > 0);
    assert!(table.payload() > 0);
    assert!(table.valuelogs().is_empty());

    let hit = table.get(b"key-0042").unwrap().unwrap();
    assert_eq!(hit.value, b"val-0042");
    assert_eq!(hit.seqno, 42);
    assert!(!hit.deleted);

    assert!(table.get(b"key-9999").unwrap().is_none());
    assert!(table.get(b"aaaa").unwrap().is_none());
}

#[test]
fn tombstones_are_stored_and_observable() {
    let tmp = TempDir::new().unwrap();
    let entries = vec![
        entry("a", "1", 1, false),
        entry("b", "", 3, true),
        entry("c", "3", 2, false),
    ];
    let table = build(&tmp.path().join("t-0-1-x"), entries, 0, false);

    let dead = table.get(b"b").unwrap().unwrap();
    assert!(dead.deleted);
    assert_eq!(dead.seqno, 3);
    assert_eq!(table.properties().tombstones, 1);
}

#[test]
fn tombstone_purge_drops_deletes_keeps_seqno() {
    let tmp = TempDir::new().unwrap();
    let entries = vec![
        entry("a", "1", 1, false),
        entry("b", "", 5, true), // highest seqno in the stream
        entry("c", "3", 2, false),
    ];
    let table = build(&tmp.path().join("t-15-1-x"), entries, 0, true);

    assert_eq!(table.count(), 2);
    assert!(table.get(b"b").unwrap().is_none());
    // The purged tombstone's seqno is still absorbed into the tier.
    assert_eq!(table.seqno(), 5);
}

#[test]
fn scan_entries_is_ordered_and_complete() {
    let tmp = TempDir::new().unwrap();
    // Enough entries to span several z-blocks.
    let table = Arc::new(build(&tmp.path().join("t-1-1-x"), sample_entries(2000), 0, false));
    assert!(table.properties().n_zblocks > 1);

    let entries: Vec<Entry> = TableSnapshot::scan_entries(&table)
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(entries.len(), 2000);
    for window in entries.windows(2) {
        assert!(window[0].key < window[1].key);
    }
    assert_eq!(entries[0].key, b"key-0001");
    assert_eq!(entries[1999].value, b"val-2000");
}

#[test]
fn value_log_mode_roundtrips() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-2-1-x");
    let table = build(&dir, sample_entries(300), 4096, false);

    assert_eq!(table.valuelogs(), vec![dir.join("value.log")]);
    let hit = table.get(b"key-0123").unwrap().unwrap();
    assert_eq!(hit.value, b"val-0123");

    let table = Arc::new(table);
    let all: Vec<Entry> = TableSnapshot::scan_entries(&table)
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(all.len(), 300);
    assert_eq!(all[42].value, format!("val-{:04}", 43).into_bytes());
}

#[test]
fn non_mmap_read_path_matches() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-4-1-x");
    build(&dir, sample_entries(100), 0, false);

    let table = TableSnapshot::open(&dir, false).unwrap();
    assert_eq!(table.count(), 100);
    assert_eq!(table.get(b"key-0007").unwrap().unwrap().value, b"val-0007");
    table.validate().unwrap();
}

#[test]
fn empty_table_is_legal() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-15-2-x");
    let table = build(&dir, Vec::new(), 0, false);
    assert_eq!(table.count(), 0);
    assert!(table.get(b"anything").unwrap().is_none());
    let table = Arc::new(table);
    assert_eq!(TableSnapshot::scan_entries(&table).count(), 0);
    table.validate().unwrap();
}

#[test]
fn validate_accepts_good_table() {
    let tmp = TempDir::new().unwrap();
    let table = build(&tmp.path().join("t-5-1-x"), sample_entries(1000), 0, false);
    table.validate().unwrap();
}

#[test]
fn destroy_removes_directory() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-6-1-x");
    let table = build(&dir, sample_entries(10), 0, false);
    table.destroy().unwrap();
    assert!(!dir.exists());
}

#[test]
fn abort_removes_partial_build() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-7-1-x");
    let mut builder = TableBuilder::new(&dir, 4096, 4096, 0).unwrap();
    let mut iter = sample_entries(10).into_iter();
    builder.build(&mut iter).unwrap();
    builder.abort().unwrap();
    assert!(!dir.exists());
}

#[test]
fn duplicate_key_versions_newest_wins_on_get() {
    let tmp = TempDir::new().unwrap();
    // Sorted by (key asc, seqno desc), as a merge feed would emit.
    let entries = vec![
        entry("k", "new", 9, false),
        entry("k", "old", 4, false),
    ];
    let table = build(&tmp.path().join("t-8-1-x"), entries, 0, false);
    assert_eq!(table.get(b"k").unwrap().unwrap().value, b"new");
}
