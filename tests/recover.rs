// Crash and reopen behavior: clean round trips, torn-insert repair,
// frozen mid-migration slots, and multi-generation chains.

use std::path::Path;

use durian::{Error, HashMap};

mod common;
use common::{k, v};

const K_INIT: u64 = u64::MAX & !0b111;
const MIGRATION: u64 = 0b110;
const SLOT: usize = 16;

fn table_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("tbl"))
        .collect();
    files.sort();
    files
}

#[test]
fn reopen_preserves_data() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");

    {
        let map = HashMap::open(&path).unwrap();
        for i in 0..100 {
            map.insert(k(i), v(i)).unwrap();
        }
        for i in 0..10 {
            map.remove(k(i)).unwrap();
        }
    }

    let map = HashMap::open(&path).unwrap();
    assert_eq!(map.len(), 90);
    for i in 0..10 {
        assert_eq!(map.get(k(i)).unwrap(), None);
    }
    for i in 10..100 {
        assert_eq!(map.get(k(i)).unwrap(), Some(v(i)));
    }

    // The map keeps working after recovery.
    map.insert(k(1000), v(1000)).unwrap();
    assert_eq!(map.get(k(1000)).unwrap(), Some(v(1000)));
    assert_eq!(map.len(), 91);
}

#[test]
fn reopen_after_growth() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");

    {
        let map = HashMap::builder(&path).capacity(8).build().unwrap();
        for i in 0..2048 {
            map.insert(k(i), v(i)).unwrap();
        }
    }

    let map = HashMap::open(&path).unwrap();
    assert_eq!(map.len(), 2048);
    for i in 0..2048 {
        assert_eq!(map.get(k(i)).unwrap(), Some(v(i)), "key {i}");
    }
}

// A crash between the key CAS and the value CAS leaves a claimed key with
// an initial value; reopening must repair it to a tombstone.
#[test]
fn torn_insert_repaired() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");
    let torn_key: u64 = 0x4000;

    {
        let map = HashMap::open(&path).unwrap();
        for i in 0..20 {
            map.insert(k(i), v(i)).unwrap();
        }
    }

    // Simulate the tear: claim an empty slot's key word on disk without
    // writing its value.
    let file = &table_files(&path)[0];
    let mut bytes = std::fs::read(file).unwrap();
    let slot = bytes
        .chunks(SLOT)
        .position(|slot| u64::from_le_bytes(slot[..8].try_into().unwrap()) & !1 == K_INIT)
        .expect("no empty slot");
    bytes[slot * SLOT..slot * SLOT + 8].copy_from_slice(&torn_key.to_le_bytes());
    std::fs::write(file, &bytes).unwrap();

    let map = HashMap::open(&path).unwrap();
    assert_eq!(map.get(torn_key).unwrap(), None);
    assert_eq!(map.len(), 20);

    // The repaired slot holds a tombstone, so reinsertion works.
    assert_eq!(map.try_insert(torn_key, v(99)).unwrap(), None);
    assert_eq!(map.get(torn_key).unwrap(), Some(v(99)));
}

// A crash mid-migration leaves a frozen slot in the newest generation;
// reopening grows a fresh successor and the value stays reachable.
#[test]
fn frozen_slot_recovers() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");

    {
        let map = HashMap::open(&path).unwrap();
        for i in 0..6 {
            map.insert(k(i), v(i)).unwrap();
        }
    }

    // Freeze one key's value on disk the way an interrupted copy would.
    let file = &table_files(&path)[0];
    let mut bytes = std::fs::read(file).unwrap();
    let slot = bytes
        .chunks(SLOT)
        .position(|slot| u64::from_le_bytes(slot[..8].try_into().unwrap()) & !1 == k(3))
        .expect("key not found on disk");
    let value_at = slot * SLOT + 8;
    let frozen =
        (u64::from_le_bytes(bytes[value_at..value_at + 8].try_into().unwrap()) & !1) | MIGRATION;
    bytes[value_at..value_at + 8].copy_from_slice(&frozen.to_le_bytes());
    std::fs::write(file, &bytes).unwrap();

    let map = HashMap::open(&path).unwrap();
    // Recovery recreated a successor for the interrupted migration.
    assert!(table_files(&path).len() >= 2);

    for i in 0..6 {
        assert_eq!(map.get(k(i)).unwrap(), Some(v(i)), "key {i}");
    }
    map.insert(k(100), v(100)).unwrap();
    assert_eq!(map.get(k(100)).unwrap(), Some(v(100)));
}

// Generation files chain in lexicographic order; a reopened chain keeps
// draining into the newest generation.
#[test]
fn multi_generation_chain() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");

    {
        let map = HashMap::builder(&path).capacity(8).build().unwrap();
        for i in 0..4 {
            map.insert(k(i), v(i)).unwrap();
        }
    }

    // Splice in an empty, larger successor generation.
    let other = dir.path().join("other");
    {
        HashMap::builder(&other).capacity(32).build().unwrap();
    }
    std::fs::copy(
        &table_files(&other)[0],
        path.join("00000001.tbl"),
    )
    .unwrap();

    let map = HashMap::open(&path).unwrap();
    assert_eq!(map.len(), 4);
    for i in 0..4 {
        assert_eq!(map.get(k(i)).unwrap(), Some(v(i)));
    }

    // New writes keep working and eventually drain the old generation.
    for i in 4..64 {
        map.insert(k(i), v(i)).unwrap();
    }
    for i in 0..64 {
        assert_eq!(map.get(k(i)).unwrap(), Some(v(i)));
    }
}

#[test]
fn rejects_corrupt_region() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");
    {
        let map = HashMap::open(&path).unwrap();
        map.insert(k(0), v(0)).unwrap();
    }
    std::fs::write(path.join("00000007.tbl"), [0u8; 24]).unwrap();

    assert!(matches!(
        HashMap::open(&path),
        Err(Error::CorruptRegion { len: 24, .. })
    ));
}

// Partially created regions from an interrupted resize are discarded.
#[test]
fn discards_staging_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");
    {
        let map = HashMap::open(&path).unwrap();
        map.insert(k(0), v(0)).unwrap();
    }
    std::fs::write(path.join("00000001.tmp"), [0u8; 64]).unwrap();

    let map = HashMap::open(&path).unwrap();
    assert_eq!(map.get(k(0)).unwrap(), Some(v(0)));
    assert!(!path.join("00000001.tmp").exists());
}
