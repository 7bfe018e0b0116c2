// Concurrent scenarios: disjoint-range inserts on a minimum-size table,
// contended counter increments, a migration storm with mixed readers,
// writers, and removers, and contended cross-slot exchanges.

use std::sync::Barrier;
use std::thread;

use durian::{BatchEntry, HashMap};

mod common;
use common::threads;

// Four threads fill disjoint key ranges starting from a minimum-size
// table, forcing the table through many generations.
#[test]
fn disjoint_range_inserts() {
    const PER_THREAD: u64 = 512;
    const THREADS: u64 = 4;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("map");
    let map = HashMap::builder(&path).capacity(8).build().unwrap();

    let barrier = Barrier::new(THREADS as usize);
    thread::scope(|s| {
        for t in 0..THREADS {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = (t * PER_THREAD + i + 1) * 8;
                    map.insert(key, key).unwrap();
                }
            });
        }
    });

    assert_eq!(map.len(), (THREADS * PER_THREAD) as usize);
    for key in (1..=THREADS * PER_THREAD).map(|i| i * 8) {
        assert_eq!(map.get(key).unwrap(), Some(key));
    }

    // Growing 8 slots to 2048 keys passes through several generations;
    // the surviving file is named by the newest one.
    drop(map);
    let newest = std::fs::read_dir(&path)
        .unwrap()
        .filter_map(|e| {
            let path = e.unwrap().path();
            path.file_stem()?.to_str()?.parse::<u64>().ok()
        })
        .max()
        .unwrap();
    assert!(newest >= 3, "expected several generations, saw {newest}");
}

// Eight threads increment a single key 10,000 times each.
#[test]
fn contended_increments() {
    const THREADS: u64 = 8;
    const OPS: u64 = 10_000;
    const KEY: u64 = 8;

    let dir = tempfile::TempDir::new().unwrap();
    let map = HashMap::open(dir.path().join("map")).unwrap();

    let barrier = Barrier::new(THREADS as usize);
    thread::scope(|s| {
        for _ in 0..THREADS {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for _ in 0..OPS {
                    map.update(KEY, 1 << 3, durian::ops::add).unwrap();
                }
            });
        }
    });

    assert_eq!(map.get(KEY).unwrap(), Some((THREADS * OPS) << 3));
    assert_eq!(map.len(), 1);
}

// Fill a table halfway, then run inserters and removers while the
// inserts force a resize underneath everyone.
#[test]
fn migration_storm() {
    const PREFILL: u64 = 512;
    const FRESH: u64 = 1024;

    let dir = tempfile::TempDir::new().unwrap();
    let map = HashMap::builder(dir.path().join("map"))
        .capacity(1024)
        .build()
        .unwrap();

    let prefill_key = |i: u64| (i + 1) << 3;
    let fresh_key = |i: u64| (1 << 20) + ((i + 1) << 3);

    for i in 0..PREFILL {
        map.insert(prefill_key(i), prefill_key(i)).unwrap();
    }

    // Two writers insert fresh keys (driving growth), two removers delete
    // disjoint halves of the prefill, and two readers check what they see.
    let barrier = Barrier::new(6);
    thread::scope(|s| {
        for t in 0..2u64 {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in (t..FRESH).step_by(2) {
                    map.insert(fresh_key(i), fresh_key(i)).unwrap();
                }
            });
            s.spawn(move || {
                barrier.wait();
                for i in (t..PREFILL).step_by(2) {
                    assert_eq!(map.remove(prefill_key(i)).unwrap(), Some(prefill_key(i)));
                }
            });
            s.spawn(move || {
                barrier.wait();
                for i in 0..PREFILL {
                    // Readers may see a prefill key before or after its
                    // removal, but never a wrong value.
                    if let Some(value) = map.get(prefill_key(i)).unwrap() {
                        assert_eq!(value, prefill_key(i));
                    }
                }
            });
        }
    });

    // Sequential replay: every prefill key was removed exactly once,
    // every fresh key inserted exactly once.
    for i in 0..PREFILL {
        assert_eq!(map.get(prefill_key(i)).unwrap(), None, "prefill {i}");
    }
    for i in 0..FRESH {
        assert_eq!(map.get(fresh_key(i)).unwrap(), Some(fresh_key(i)), "fresh {i}");
    }
    assert_eq!(map.len(), FRESH as usize);
}

// Concurrent overwrites of a shared key set: the final value for every
// key must be one that some thread actually wrote.
#[test]
fn concurrent_overwrites() {
    const KEYS: u64 = 64;

    let dir = tempfile::TempDir::new().unwrap();
    let map = HashMap::open(dir.path().join("map")).unwrap();

    let n = threads() as u64;
    let barrier = Barrier::new(n as usize);
    thread::scope(|s| {
        for t in 1..=n {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 1..=KEYS {
                    map.insert(i << 3, (t * KEYS + i) << 3).unwrap();
                }
            });
        }
    });

    assert_eq!(map.len(), KEYS as usize);
    for i in 1..=KEYS {
        let value = map.get(i << 3).unwrap().unwrap();
        let wrote_it = (1..=n).any(|t| value == (t * KEYS + i) << 3);
        assert!(wrote_it, "key {i} holds a value nobody wrote: {value:#x}");
    }
}

// A 50/50 read/update mix over a preloaded key space: no read may come
// back absent, and the population never changes.
#[test]
fn read_update_mix() {
    const LOAD: u64 = 10_000;
    const OPS: usize = 20_000;

    let dir = tempfile::TempDir::new().unwrap();
    let map = HashMap::builder(dir.path().join("map"))
        .capacity(1024)
        .build()
        .unwrap();

    for i in 1..=LOAD {
        map.insert(i << 3, i << 3).unwrap();
    }

    let n = threads();
    let barrier = Barrier::new(n);
    thread::scope(|s| {
        for t in 0..n {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                // A cheap deterministic mixer keeps the runs reproducible.
                let mut state = (t as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15);
                barrier.wait();
                for op in 0..OPS {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    let key = (state % LOAD + 1) << 3;
                    if op % 2 == 0 {
                        let value = map.get(key).unwrap();
                        assert!(value.is_some(), "loaded key {key:#x} read absent");
                    } else {
                        map.insert(key, (op as u64 + 1) << 3).unwrap();
                    }
                }
            });
        }
    });

    assert_eq!(map.len(), LOAD as usize);
}

// Count node degrees from a shared edge list, one disjoint chunk per
// thread; the final counts must match a sequential tally.
#[test]
fn degree_counts() {
    const NODES: u64 = 256;
    const EDGES: usize = 40_000;

    let dir = tempfile::TempDir::new().unwrap();
    let map = HashMap::open(dir.path().join("map")).unwrap();

    // Deterministic pseudo-random edge destinations.
    let edges: Vec<u64> = (0..EDGES as u64)
        .map(|i| {
            let mut x = i.wrapping_mul(0x2545f4914f6cdd1d).wrapping_add(0x9e3779b9);
            x ^= x >> 29;
            x % NODES
        })
        .collect();

    let n = 4;
    let chunk = EDGES / n;
    thread::scope(|s| {
        for part in edges.chunks(chunk) {
            let map = &map;
            s.spawn(move || {
                for &dst in part {
                    map.update((dst + 1) << 3, 1 << 3, durian::ops::add).unwrap();
                }
            });
        }
    });

    let mut expected = vec![0u64; NODES as usize];
    for &dst in &edges {
        expected[dst as usize] += 1;
    }
    for (dst, &count) in expected.iter().enumerate() {
        let degree = map.get((dst as u64 + 1) << 3).unwrap();
        if count == 0 {
            assert_eq!(degree, None);
        } else {
            assert_eq!(degree, Some(count << 3), "node {dst}");
        }
    }
}

// Threads batch-increment a band of eight keys through the multi-word
// engine; every batch moves all eight values together.
#[test]
fn batched_exchanges() {
    const BAND: u64 = 8;
    const PER_THREAD: u64 = 200;

    let dir = tempfile::TempDir::new().unwrap();
    let map = HashMap::open(dir.path().join("map")).unwrap();

    let key = |i: u64| (i + 1) << 3;
    for i in 0..BAND {
        map.insert(key(i), 1 << 3).unwrap();
    }

    let n = 4u64;
    let barrier = Barrier::new(n as usize);
    thread::scope(|s| {
        for _ in 0..n {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let mut done = 0;
                while done < PER_THREAD {
                    // Read a candidate set, then try to move the whole
                    // band forward by one.
                    let entries: Vec<BatchEntry> = (0..BAND)
                        .map(|i| {
                            let old = map.get(key(i)).unwrap().unwrap();
                            BatchEntry {
                                key: key(i),
                                old,
                                new: old + (1 << 3),
                            }
                        })
                        .collect();
                    if map.compare_exchange_batch(&entries).unwrap() {
                        done += 1;
                    }
                }
            });
        }
    });

    // Each successful batch advanced every key once.
    let expected = (1 + n * PER_THREAD) << 3;
    for i in 0..BAND {
        assert_eq!(map.get(key(i)).unwrap(), Some(expected), "band key {i}");
    }
}
