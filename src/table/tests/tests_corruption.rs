//! Integrity checks: flipped bytes, truncation, and damaged framing must
//! surface as errors, never as silently wrong data.

use tempfile::TempDir;

use crate::engine::Entry;
use crate::table::{TABLE_FILE, TableBuilder, TableError, TableSnapshot};

fn build_sample(dir: &std::path::Path, n: u64) {
    let mut builder = TableBuilder::new(dir, 4096, 4096, 0).unwrap();
    let mut iter = (1..=n).map(|i| Entry {
        key: format!("key-{i:04}").into_bytes(),
        value: format!("val-{i:04}").into_bytes(),
        seqno: i,
        deleted: false,
    });
    builder.build(&mut iter).unwrap();
    builder.finish(b"meta").unwrap();
}

#[test]
fn flipped_data_byte_fails_checksum() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-0-1-x");
    build_sample(&dir, 800);

    let path = dir.join(TABLE_FILE);
    let mut bytes = std::fs::read(&path).unwrap();
    // Somewhere inside the first z-block.
    let at = 64;
    bytes[at] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let table = TableSnapshot::open(&dir, true).unwrap();
    let mut saw_error = false;
    for at in 0..table.n_blocks() {
        if table.read_zblock(at).is_err() {
            saw_error = true;
        }
    }
    assert!(saw_error, "corruption must be detected somewhere");
    assert!(table.validate().is_err());
}

#[test]
fn truncated_file_fails_open() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-0-1-y");
    build_sample(&dir, 100);

    let path = dir.join(TABLE_FILE);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    assert!(TableSnapshot::open(&dir, true).is_err());
}

#[test]
fn damaged_footer_fails_open() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-0-1-z");
    build_sample(&dir, 100);

    let path = dir.join(TABLE_FILE);
    let mut bytes = std::fs::read(&path).unwrap();
    let n = bytes.len();
    bytes[n - 10] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let err = TableSnapshot::open(&dir, true).err().expect("open must fail");
    assert!(matches!(
        err,
        TableError::ChecksumMismatch(_) | TableError::Corrupt(_)
    ));
}

#[test]
fn damaged_header_fails_open() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-0-1-w");
    build_sample(&dir, 10);

    let path = dir.join(TABLE_FILE);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] = b'X';
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        TableSnapshot::open(&dir, true),
        Err(TableError::ChecksumMismatch(_))
    ));
}

#[test]
fn missing_table_file_fails_open() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("t-0-1-v");
    std::fs::create_dir_all(&dir).unwrap();
    assert!(matches!(
        TableSnapshot::open(&dir, true),
        Err(TableError::Io(_))
    ));
}
