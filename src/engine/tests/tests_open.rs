//! Open-time behavior: warmup, version housekeeping, settings validation,
//! offline maintenance.

use std::sync::Arc;

use tempfile::TempDir;

use super::helpers::*;
use crate::engine::metadata::TierMetadata;
use crate::engine::read::{Drain, ScanIter, TierSource};
use crate::engine::{Engine, EngineError, Entry, NLEVELS, compact_index, purge_index};
use crate::table::{TableBuilder, TableSnapshot};

#[test]
fn reopen_warms_writable_tier_from_disk() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "warm");
    for i in 0..10 {
        engine.set(&key("k", i), &val("k", i)).unwrap();
    }
    engine.commit(None).unwrap();
    engine.close().unwrap();

    let engine = open_engine(tmp.path(), "warm");
    assert!(!engine.is_dgm());
    assert_eq!(engine.seqno(), 10);

    // The key written sixth sits at seqno 6, straight from the warm tier.
    let entry = engine.get(&key("k", 5)).unwrap().unwrap();
    assert_eq!(entry.value, val("k", 5));
    assert_eq!(entry.seqno, 6);
    assert!(!entry.deleted);

    // Warmed data lives in the writable tier.
    let stats = engine.stats().unwrap();
    assert_eq!(stats.mem_tiers[0].count, 10);
    engine.close().unwrap();
}

#[test]
fn open_keeps_highest_version_per_level() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());

    // Fabricate two versions of level 3, as a crash between publish and
    // retirement would leave behind.
    for (version, seqno) in [(7u64, 5u64), (8, 9)] {
        let dirname = format!("crash-3-{version}-{:016x}", 0xabcu64 + version);
        let dir = tmp.path().join(dirname);
        let mut builder = TableBuilder::new(&dir, cfg.mblocksize, cfg.zblocksize, 0).unwrap();
        let mut entries = (1..=seqno).map(|i| Entry {
            key: key("k", i as usize),
            value: format!("v{version}-{i}").into_bytes(),
            seqno: i,
            deleted: false,
        });
        builder.build(&mut entries).unwrap();
        let mut diskversions = [0u64; NLEVELS];
        diskversions[3] = version;
        let meta = TierMetadata::new(seqno, 1_700_000_000, b"", [1, 0, 0], diskversions, &cfg);
        builder.finish(&meta.encode().unwrap()).unwrap();
    }

    let engine = Engine::open("crash", cfg).unwrap();
    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers.len(), 1);
    assert!(stats.disk_tiers[0].id.starts_with("crash-3-8-"));
    assert_eq!(stats.disk_tiers[0].seqno, 9);
    assert_eq!(engine.seqno(), 9);

    // The stale version is gone from disk.
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("crash-3-7-"))
        .collect();
    assert!(leftovers.is_empty());
    engine.close().unwrap();
}

#[test]
fn settings_mismatch_refuses_open() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "pinned");
    fill(&engine, "k", 5);
    engine.commit(None).unwrap();
    engine.close().unwrap();

    // Different memstore flavor.
    let mut cfg = test_config(tmp.path());
    cfg.memstore = "exclusive".to_string();
    assert!(matches!(
        Engine::open("pinned", cfg),
        Err(EngineError::SettingsMismatch(_))
    ));

    // Different leaf block size.
    let mut cfg = test_config(tmp.path());
    cfg.zblocksize = 8192;
    assert!(matches!(
        Engine::open("pinned", cfg),
        Err(EngineError::SettingsMismatch(_))
    ));

    // The matching configuration still opens.
    let engine = open_engine(tmp.path(), "pinned");
    engine.close().unwrap();
}

#[test]
fn invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.memstore = "btree".to_string();
    assert!(matches!(
        Engine::open("bad", cfg),
        Err(EngineError::Config(_))
    ));

    let mut cfg = test_config(tmp.path());
    cfg.diskpaths.clear();
    assert!(matches!(
        Engine::open("bad", cfg),
        Err(EngineError::Config(_))
    ));

    let cfg = test_config(tmp.path());
    assert!(matches!(
        Engine::open("bad-name", cfg),
        Err(EngineError::Config(_))
    ));
}

#[test]
fn forced_dgm_makes_deletes_lsm() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.dgm = true;
    let engine = Engine::open("dgm", cfg).unwrap();
    assert!(engine.is_dgm());

    engine.set(b"k", b"v").unwrap();
    // Non-LSM delete is forced into tombstone form.
    engine.delete(b"k", false).unwrap();
    let entry = engine.get(b"k").unwrap().unwrap();
    assert!(entry.deleted);
    engine.close().unwrap();
}

#[test]
fn destroy_erases_everything() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "gone");
    fill(&engine, "k", 10);
    engine.commit(None).unwrap();
    engine.close().unwrap();
    engine.destroy().unwrap();

    let tiers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("gone-"))
        .collect();
    assert!(tiers.is_empty());
}

#[test]
fn purge_index_only_touches_its_engine() {
    let tmp = TempDir::new().unwrap();
    let keep = open_engine(tmp.path(), "keep");
    fill(&keep, "k", 5);
    keep.commit(None).unwrap();
    keep.close().unwrap();

    let gone = open_engine(tmp.path(), "gone");
    fill(&gone, "k", 5);
    gone.commit(None).unwrap();
    gone.close().unwrap();

    purge_index("gone", &test_config(tmp.path())).unwrap();

    let names: Vec<String> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.starts_with("keep-")));
    assert!(!names.iter().any(|n| n.starts_with("gone-")));
}

#[test]
fn offline_merge_collapses_levels() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.flushratio = 1e9; // stack tiers
    let engine = Engine::open("offline", cfg.clone()).unwrap();
    fill(&engine, "a", 20);
    engine.commit(None).unwrap();
    fill(&engine, "b", 20);
    engine.commit(None).unwrap();
    engine.close().unwrap();

    compact_index("offline", &cfg, true).unwrap();

    let engine = Engine::open("offline", cfg).unwrap();
    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers.len(), 1);
    assert_eq!(stats.disk_tiers[0].level, Some(NLEVELS - 1));
    assert_eq!(stats.disk_tiers[0].count, 40);
    assert_eq!(engine.get(&key("a", 3)).unwrap().unwrap().value, val("a", 3));
    assert_eq!(engine.get(&key("b", 7)).unwrap().unwrap().value, val("b", 7));
    engine.close().unwrap();
}

#[test]
fn close_refuses_with_outstanding_scan() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "busy");
    fill(&engine, "k", 5);

    let scan = engine.scan().unwrap();
    assert!(matches!(engine.close(), Err(EngineError::ActiveIterators)));

    drop(scan);
    engine.close().unwrap();
}

#[test]
fn merge_helper_dedups_across_sources() {
    // Sanity check of the k-way merge the schedulers feed builders with.
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());

    let build = |dirname: &str, entries: Vec<Entry>| {
        let dir = tmp.path().join(dirname);
        let mut builder = TableBuilder::new(&dir, cfg.mblocksize, cfg.zblocksize, 0).unwrap();
        let mut iter = entries.into_iter();
        builder.build(&mut iter).unwrap();
        builder.finish(b"{}").unwrap();
        Arc::new(TableSnapshot::open(&dir, true).unwrap())
    };

    let newer = build(
        "m-0-1-aa",
        vec![Entry {
            key: b"k".to_vec(),
            value: b"new".to_vec(),
            seqno: 9,
            deleted: false,
        }],
    );
    let older = build(
        "m-1-1-bb",
        vec![
            Entry {
                key: b"j".to_vec(),
                value: b"j".to_vec(),
                seqno: 3,
                deleted: false,
            },
            Entry {
                key: b"k".to_vec(),
                value: b"old".to_vec(),
                seqno: 4,
                deleted: false,
            },
        ],
    );

    let sources = vec![
        TierSource::Disk(TableSnapshot::scan_entries(&newer)),
        TierSource::Disk(TableSnapshot::scan_entries(&older)),
    ];
    let mut merged = ScanIter::over(None, sources).unwrap();
    let mut err = None;
    let drained: Vec<Entry> = Drain {
        merged: &mut merged,
        err: &mut err,
    }
    .collect();
    assert!(err.is_none());

    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].key, b"j");
    assert_eq!(drained[1].key, b"k");
    assert_eq!(drained[1].value, b"new");
    assert_eq!(drained[1].seqno, 9);
}
