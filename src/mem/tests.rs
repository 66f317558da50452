//! Ordered-index unit tests, run against both flavors.

use super::*;

fn flavors() -> Vec<Box<dyn OrderedIndex>> {
    vec![
        Box::new(ExclusiveIndex::new("t-mw-1")),
        Box::new(MvccIndex::new("t-mw-1")),
    ]
}

#[test]
fn set_get_roundtrip() {
    for index in flavors() {
        let (old, cas) = index.set(b"alpha", b"one").unwrap();
        assert!(old.is_none());
        assert_eq!(cas, 1);

        let entry = index.get(b"alpha").unwrap();
        assert_eq!(entry.value, b"one");
        assert_eq!(entry.seqno, 1);
        assert!(!entry.deleted);
        assert!(index.get(b"beta").is_none());
    }
}

#[test]
fn overwrite_returns_old_and_bumps_seqno() {
    for index in flavors() {
        index.set(b"k", b"v1").unwrap();
        let (old, cas) = index.set(b"k", b"v2").unwrap();
        assert_eq!(old.unwrap().value, b"v1");
        assert_eq!(cas, 2);
        assert_eq!(index.count(), 1);
        assert_eq!(index.seqno(), 2);
        assert_eq!(index.get(b"k").unwrap().value, b"v2");
    }
}

#[test]
fn lsm_delete_leaves_tombstone() {
    for index in flavors() {
        index.set(b"k", b"v").unwrap();
        let (old, cas) = index.delete(b"k", true).unwrap();
        assert_eq!(old.unwrap().value, b"v");
        assert_eq!(cas, 2);

        let entry = index.get(b"k").unwrap();
        assert!(entry.deleted);
        assert_eq!(entry.seqno, 2);
        assert_eq!(index.count(), 1, "tombstone still occupies the key");
    }
}

#[test]
fn lsm_delete_of_missing_key_inserts_tombstone() {
    for index in flavors() {
        let (old, _) = index.delete(b"ghost", true).unwrap();
        assert!(old.is_none());
        assert!(index.get(b"ghost").unwrap().deleted);
    }
}

#[test]
fn physical_delete_removes_entry() {
    for index in flavors() {
        index.set(b"k", b"v").unwrap();
        let (old, _) = index.delete(b"k", false).unwrap();
        assert_eq!(old.unwrap().value, b"v");
        assert!(index.get(b"k").is_none());
        assert_eq!(index.count(), 0);
    }
}

#[test]
fn cas_discipline() {
    for index in flavors() {
        // Unknown key cannot be decided by this tier.
        assert!(matches!(
            index.set_cas(b"k", b"v", 0),
            Err(MemError::CasUnresolved)
        ));

        let (_, cas) = index.set(b"k", b"v0").unwrap();

        // Wrong token.
        assert!(matches!(
            index.set_cas(b"k", b"v1", cas + 1),
            Err(MemError::InvalidCas)
        ));
        assert_eq!(index.get(b"k").unwrap().value, b"v0");

        // Matching token.
        let (old, _) = index.set_cas(b"k", b"v1", cas).unwrap();
        assert_eq!(old.unwrap().value, b"v0");
        assert_eq!(index.get(b"k").unwrap().value, b"v1");

        // Tombstoned key behaves as absent: cas must be zero.
        index.delete(b"k", true).unwrap();
        assert!(matches!(
            index.set_cas(b"k", b"v2", cas),
            Err(MemError::InvalidCas)
        ));
        index.set_cas(b"k", b"v2", 0).unwrap();
        assert_eq!(index.get(b"k").unwrap().value, b"v2");
    }
}

#[test]
fn scan_is_sorted_latest_per_key() {
    for index in flavors() {
        index.set(b"b", b"2").unwrap();
        index.set(b"a", b"1").unwrap();
        index.set(b"c", b"3").unwrap();
        index.set(b"b", b"2b").unwrap();
        index.delete(b"c", true).unwrap();

        let entries = index.scan();
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);
        assert_eq!(entries[1].value, b"2b");
        assert!(entries[2].deleted);
    }
}

#[test]
fn load_preserves_seqno_and_counter() {
    for index in flavors() {
        index
            .load(Entry {
                key: b"w".to_vec(),
                value: b"warm".to_vec(),
                seqno: 42,
                deleted: false,
            })
            .unwrap();
        assert_eq!(index.seqno(), 42);
        assert_eq!(index.get(b"w").unwrap().seqno, 42);

        // The next mutation continues past the loaded seqno.
        let (_, cas) = index.set(b"x", b"y").unwrap();
        assert_eq!(cas, 43);
    }
}

#[test]
fn set_seqno_resumes_counter() {
    for index in flavors() {
        index.set_seqno(100);
        let (_, cas) = index.set(b"k", b"v").unwrap();
        assert_eq!(cas, 101);
        assert_eq!(index.seqno(), 101);
    }
}

#[test]
fn footprint_tracks_growth() {
    for index in flavors() {
        assert_eq!(index.footprint(), 0);
        index.set(b"key", &[0u8; 100]).unwrap();
        let after_one = index.footprint();
        assert!(after_one >= 100);
        index.set(b"key2", &[0u8; 100]).unwrap();
        assert!(index.footprint() > after_one);
    }
}

#[test]
fn mvcc_keeps_history_newest_wins() {
    let index = MvccIndex::new("t-mw-2");
    index.set(b"k", b"v1").unwrap();
    index.set(b"k", b"v2").unwrap();
    index.delete(b"k", true).unwrap();
    index.set(b"k", b"v3").unwrap();

    let entry = index.get(b"k").unwrap();
    assert_eq!(entry.value, b"v3");
    assert_eq!(entry.seqno, 4);
    assert_eq!(index.count(), 1);
}
