//! Durability: clean close/reopen round-trips and redo-log replay.

use tempfile::TempDir;

use super::helpers::*;
use crate::engine::{Engine, RedoRecord};
use crate::wal::RedoLog;

#[test]
fn clean_close_and_reopen_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "dur");
    fill(&engine, "k", 50);
    engine.delete(&key("k", 7), true).unwrap();
    // Close performs the final flush of the dirty writable tier.
    engine.close().unwrap();

    let engine = open_engine(tmp.path(), "dur");
    assert_eq!(engine.seqno(), 51);
    assert_eq!(engine.get(&key("k", 3)).unwrap().unwrap().value, val("k", 3));
    let dead = engine.get(&key("k", 7)).unwrap().unwrap();
    assert!(dead.deleted);
    assert_eq!(dead.seqno, 51);
    engine.close().unwrap();
}

#[test]
fn values_survive_multiple_generations() {
    let tmp = TempDir::new().unwrap();
    for round in 0..3u8 {
        let engine = open_engine(tmp.path(), "gens");
        for i in 0..20 {
            engine
                .set(&key("k", i), format!("round{round}-{i}").as_bytes())
                .unwrap();
        }
        engine.close().unwrap();
    }

    let engine = open_engine(tmp.path(), "gens");
    for i in 0..20 {
        assert_eq!(
            engine.get(&key("k", i)).unwrap().unwrap().value,
            format!("round2-{i}").into_bytes()
        );
    }
    assert_eq!(engine.seqno(), 60);
    engine.validate().unwrap();
    engine.close().unwrap();
}

#[test]
fn durable_engine_replays_unflushed_writes() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.durable = true;

    let engine = Engine::open("redo", cfg.clone()).unwrap();
    fill(&engine, "k", 10);
    engine.commit(None).unwrap(); // covered by a tier; log reset
    engine.set(b"unflushed", b"survives").unwrap();
    engine.delete(&key("k", 2), true).unwrap();

    // Simulate a crash: drop the handle without closing. The workers are
    // parked on long ticks, so nothing else will flush.
    let log_path = tmp.path().join("terrace-redo-logs").join("redo.log");
    assert!(log_path.exists());
    let records: Vec<RedoRecord> = RedoLog::open(&log_path).unwrap().replay().unwrap();
    assert_eq!(records.len(), 2, "only post-flush mutations in the log");
    drop(engine);

    let engine = Engine::open("redo", cfg).unwrap();
    assert_eq!(engine.seqno(), 12);
    assert_eq!(
        engine.get(b"unflushed").unwrap().unwrap().value,
        b"survives"
    );
    assert!(engine.get(&key("k", 2)).unwrap().unwrap().deleted);
    assert_eq!(engine.get(&key("k", 3)).unwrap().unwrap().value, val("k", 3));
    engine.close().unwrap();
}

#[test]
fn non_durable_engine_keeps_no_log() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path(), "nolog");
    fill(&engine, "k", 5);
    engine.commit(None).unwrap();
    assert!(!tmp.path().join("terrace-nolog-logs").exists());
    engine.close().unwrap();
}
