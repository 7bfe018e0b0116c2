use durian::HashMap;
use tempfile::TempDir;

// Run the test on different configurations of a `HashMap`. The directory
// is dropped (and the files with it) after each run.
#[allow(dead_code)]
pub fn with_map(test: impl Fn(&HashMap)) {
    // A minimum-sized table, so operations immediately contend with
    // resizing.
    let dir = TempDir::new().unwrap();
    let map = HashMap::builder(dir.path().join("map"))
        .capacity(8)
        .build()
        .unwrap();
    test(&map);

    // A pre-sized table that mostly avoids resizing.
    let dir = TempDir::new().unwrap();
    let map = HashMap::builder(dir.path().join("map"))
        .capacity(1 << 12)
        .build()
        .unwrap();
    test(&map);
}

#[allow(dead_code)]
pub fn threads() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
        .min(8)
}

// Keys and values leave the low three bits clear; tests shift payloads up.
#[allow(dead_code)]
pub fn k(x: u64) -> u64 {
    (x + 1) << 3
}

#[allow(dead_code)]
pub fn v(x: u64) -> u64 {
    (x + 1) << 3
}
