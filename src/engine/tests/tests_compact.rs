//! Compaction behavior: pick policies, ratio merges, tombstone purge.

use tempfile::TempDir;

use super::helpers::*;
use crate::engine::compact::{pick_compact, run_compaction};
use crate::engine::flush::BuildMode;
use crate::engine::{Engine, NLEVELS};

/// Two tiers stacked at the bottom: a small old one at 15, a larger newer
/// one at 14 (forced fallback).
fn stacked_engine(dir: &std::path::Path, small: usize, large: usize) -> Engine {
    let mut cfg = test_config(dir);
    cfg.flushratio = 1e9;
    cfg.compactratio = 2.0;
    let engine = Engine::open("stacked", cfg).unwrap();

    fill(&engine, "old", small);
    engine.commit(None).unwrap();
    fill(&engine, "new", large);
    engine.commit(None).unwrap();

    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers.len(), 2);
    engine
}

#[test]
fn nothing_to_compact_with_one_tier() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "single");
    fill(&engine, "k", 20);
    engine.commit(None).unwrap();

    assert!(!run_compaction(&engine.inner, false).unwrap());
    engine.close().unwrap();
}

#[test]
fn ratio_pick_fuses_adjacent_pair() {
    let tmp = TempDir::new().unwrap();
    // Upper (newer) tier payload is well over twice the lower's.
    let engine = stacked_engine(tmp.path(), 20, 100);

    let before: u64 = engine
        .stats()
        .unwrap()
        .disk_tiers
        .iter()
        .map(|t| t.count)
        .sum();

    let snap = engine.inner.levels.latest().unwrap();
    let (fuse, level, mode) = pick_compact(&engine.inner, &snap, false)
        .unwrap()
        .expect("ratio pick should fire");
    assert_eq!(fuse, vec![NLEVELS - 2, NLEVELS - 1]);
    assert_eq!(level, NLEVELS - 1);
    assert_eq!(mode, BuildMode::CompactRatio);
    drop(snap);

    assert!(run_compaction(&engine.inner, false).unwrap());

    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers.len(), 1);
    assert_eq!(stats.disk_tiers[0].level, Some(NLEVELS - 1));
    let after: u64 = stats.disk_tiers.iter().map(|t| t.count).sum();
    assert_eq!(after, before, "no tombstones purged, counts preserved");

    engine.validate().unwrap();
    engine.close().unwrap();
}

#[test]
fn balanced_pair_is_left_alone() {
    let tmp = TempDir::new().unwrap();
    let engine = stacked_engine(tmp.path(), 50, 50);

    let snap = engine.inner.levels.latest().unwrap();
    let pick = pick_compact(&engine.inner, &snap, false).unwrap();
    assert!(pick.is_none(), "similar payloads must not trigger C4");
    drop(snap);
    engine.close().unwrap();
}

#[test]
fn tombstone_purge_rewrites_last_level() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "purge");

    fill(&engine, "k", 20);
    for i in 0..10 {
        engine.delete(&key("k", i), true).unwrap();
    }
    engine.commit(None).unwrap();

    // The flushed tier carries 10 live entries and 10 tombstones.
    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers[0].count, 20);

    assert!(engine.tombstone_purge().unwrap());

    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers.len(), 1);
    assert_eq!(stats.disk_tiers[0].level, Some(NLEVELS - 1));
    assert_eq!(stats.disk_tiers[0].count, 10, "tombstones dropped");

    // Deleted keys are now simply absent, not masked.
    assert!(engine.get(&key("k", 3)).unwrap().is_none());
    assert_eq!(
        engine.get(&key("k", 15)).unwrap().unwrap().value,
        val("k", 15)
    );
    engine.close().unwrap();
}

#[test]
fn purged_seqno_is_still_absorbed() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "absorb");

    fill(&engine, "k", 5);
    engine.delete(&key("k", 0), true).unwrap(); // seqno 6, the highest
    engine.commit(None).unwrap();
    assert!(engine.tombstone_purge().unwrap());

    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers[0].seqno, 6);
    engine.validate().unwrap();
    engine.close().unwrap();
}

#[test]
fn tombstone_purge_skips_when_no_tier() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "noop");
    assert!(!engine.tombstone_purge().unwrap());
    engine.close().unwrap();
}

#[test]
fn aggressive_pick_spares_first_and_last() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.flushratio = 1e9; // stack tiers upward
    cfg.compactratio = 1e9; // keep C4 quiet
    let engine = Engine::open("agg", cfg).unwrap();

    for round in 0..5 {
        fill(&engine, &format!("r{round}x"), 10);
        engine.commit(None).unwrap();
    }
    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers.len(), 5);

    let snap = engine.inner.levels.latest().unwrap();
    let (fuse, _, mode) = pick_compact(&engine.inner, &snap, false)
        .unwrap()
        .expect("more than three tiers must trigger C3");
    assert_eq!(mode, BuildMode::CompactAggressive);
    let occupied = snap.occupied();
    assert_eq!(fuse, occupied[1..occupied.len() - 1].to_vec());
    drop(snap);

    assert!(run_compaction(&engine.inner, false).unwrap());
    let stats = engine.stats().unwrap();
    assert_eq!(stats.disk_tiers.len(), 3, "middle tiers fused into one");
    engine.validate().unwrap();
    engine.close().unwrap();
}
