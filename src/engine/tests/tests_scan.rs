//! Merged scans: ordering, cross-tier shadowing, snapshot isolation.

use tempfile::TempDir;

use super::helpers::*;
use crate::engine::Entry;

#[test]
fn scan_merges_mem_and_disk_in_key_order() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "merge");

    fill(&engine, "disk", 30);
    engine.commit(None).unwrap();
    fill(&engine, "mem", 30);

    let entries: Vec<Entry> = engine.scan().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(entries.len(), 60);
    for window in entries.windows(2) {
        assert!(window[0].key < window[1].key, "strictly ascending keys");
    }
    engine.close().unwrap();
}

#[test]
fn newest_version_wins_across_tiers() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "winner");

    engine.set(b"k", b"disk-version").unwrap();
    engine.commit(None).unwrap();
    engine.set(b"k", b"mem-version").unwrap();

    let entries: Vec<Entry> = engine.scan().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, b"mem-version");
    assert_eq!(entries[0].seqno, 2);
    engine.close().unwrap();
}

#[test]
fn scan_is_bound_to_its_snapshot() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "isolated");

    fill(&engine, "k", 10);
    let scan = engine.scan().unwrap();

    // Mutations after the scan started are invisible to it.
    engine.set(b"zzz", b"late").unwrap();
    engine.delete(&key("k", 0), true).unwrap();

    let entries: Vec<Entry> = scan.map(|r| r.unwrap()).collect();
    assert_eq!(entries.len(), 10);
    assert!(entries.iter().all(|e| e.key != b"zzz".to_vec()));
    assert!(entries.iter().all(|e| !e.deleted));
    engine.close().unwrap();
}

#[test]
fn scan_emits_tombstones() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "scantomb");

    fill(&engine, "k", 5);
    engine.delete(&key("k", 2), true).unwrap();

    let entries: Vec<Entry> = engine.scan().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(entries.len(), 5);
    let dead: Vec<_> = entries.iter().filter(|e| e.deleted).collect();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key, key("k", 2));
    engine.close().unwrap();
}

#[test]
fn view_scan_and_get_share_one_snapshot() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "view");

    fill(&engine, "k", 5);
    let view = engine.view(9).unwrap();
    assert_eq!(view.id(), 9);
    assert_eq!(view.get(&key("k", 1)).unwrap().unwrap().value, val("k", 1));

    let entries: Vec<Entry> = view.scan().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(entries.len(), 5);
    view.abort();
    engine.close().unwrap();
}

#[test]
fn scan_across_three_generations() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "gen");

    // Generation 1 on disk.
    for i in 0..20 {
        engine.set(&key("k", i), b"gen1").unwrap();
    }
    engine.commit(None).unwrap();

    // Generation 2 overwrites half, also on disk.
    for i in 0..10 {
        engine.set(&key("k", i), b"gen2").unwrap();
    }
    engine.commit(None).unwrap();

    // Generation 3 overwrites a quarter, memory only.
    for i in 0..5 {
        engine.set(&key("k", i), b"gen3").unwrap();
    }

    let entries: Vec<Entry> = engine.scan().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(entries.len(), 20);
    for (i, entry) in entries.iter().enumerate() {
        let expect: &[u8] = if i < 5 {
            b"gen3"
        } else if i < 10 {
            b"gen2"
        } else {
            b"gen1"
        };
        assert_eq!(entry.value, expect, "key {i}");
    }
    engine.close().unwrap();
}
