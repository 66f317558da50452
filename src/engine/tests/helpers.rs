//! Shared fixtures for engine tests.
//!
//! Background cadences are pushed out far enough that only explicit
//! `commit` / `tombstone_purge` / direct scheduler calls move data between
//! tiers, keeping every test deterministic.

use std::path::Path;
use std::time::Duration;

use crate::engine::{Config, Engine};

pub fn test_config(dir: &Path) -> Config {
    Config {
        diskpaths: vec![dir.to_path_buf()],
        autocommit: Duration::from_secs(3600),
        compactperiod: Duration::ZERO,
        memcapacity: 8 * 1024 * 1024,
        zblocksize: 1024,
        ..Config::default()
    }
}

pub fn open_engine(dir: &Path, name: &str) -> Engine {
    Engine::open(name, test_config(dir)).unwrap()
}

pub fn key(prefix: &str, i: usize) -> Vec<u8> {
    format!("{prefix}{i:04}").into_bytes()
}

pub fn val(prefix: &str, i: usize) -> Vec<u8> {
    format!("{prefix}value{i:04}").into_bytes()
}

/// Write `n` keys `prefix0000..` with matching values.
pub fn fill(engine: &Engine, prefix: &str, n: usize) {
    for i in 0..n {
        engine.set(&key(prefix, i), &val(prefix, i)).unwrap();
    }
}
