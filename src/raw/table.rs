//! A single table generation and its control block.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use seize::Linked;

use crate::error::Result;
use crate::raw::mark::{is_migrated, K_INIT, V_INIT, V_TOMB, V_TOMBPRIME};
use crate::raw::persist;
use crate::raw::store::Store;

/// The minimum table capacity. Must be a power of two.
pub const MIN_SIZE: usize = 1 << 3;

/// Probes beyond this bound suggest an overfull table.
pub const REPROBE_LIMIT: usize = 10;

/// The per-attempt probe bound for a table of `len` slots.
#[inline]
pub fn reprobe_limit(len: usize) -> usize {
    REPROBE_LIMIT + (len >> 2)
}

/// The table control block.
pub struct Chm {
    /// The number of live key/value pairs. Eventually consistent.
    pub size: AtomicIsize,

    /// The number of key slots ever claimed.
    pub slots: AtomicUsize,

    /// The successor table; installed at most once per generation.
    pub new_table: AtomicPtr<Linked<Table>>,

    /// The next chunk offset a migrating thread may claim.
    pub copy_idx: AtomicUsize,

    /// The number of slots sealed with a migration mark. The table is
    /// fully migrated when this reaches `len`.
    pub copy_done: AtomicUsize,
}

impl Chm {
    fn new() -> Chm {
        Chm {
            size: AtomicIsize::new(0),
            slots: AtomicUsize::new(0),
            new_table: AtomicPtr::new(std::ptr::null_mut()),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
        }
    }

    /// Heuristic estimate of whether the table is overfull: the caller
    /// reprobed past the base bound and more than a quarter of the slots
    /// have been claimed.
    #[inline]
    pub fn table_full(&self, reprobes: usize, len: usize) -> bool {
        reprobes >= REPROBE_LIMIT && self.slots.load(Ordering::Relaxed) >= REPROBE_LIMIT + len / 4
    }
}

/// One generation of the map: a mapped slot region plus its control block.
///
/// Multiple tables exist during a resize; they form a chain through
/// `chm.new_table`, oldest first. Slot counts never shrink along the
/// chain.
pub struct Table {
    store: Store,
    /// The number of slots. Always a power of two.
    pub len: usize,
    /// The generation number; names the backing file.
    pub generation: u64,
    pub chm: Chm,
    /// Set once the table has been promoted away; drop then removes the
    /// backing file.
    pub doomed: AtomicBool,
}

impl Table {
    /// Creates the backing file for generation `generation` in `dir` and
    /// seeds it.
    pub fn create(dir: &Path, generation: u64, len: usize) -> Result<Table> {
        debug_assert!(len >= MIN_SIZE && len.is_power_of_two());
        let store = Store::create(&Table::file_name(dir, generation), len)?;
        Ok(Table {
            len,
            store,
            generation,
            chm: Chm::new(),
            doomed: AtomicBool::new(false),
        })
    }

    /// Maps an existing generation file. Counters start at zero; the
    /// recovery sweep rebuilds them.
    pub fn open(path: &Path, generation: u64) -> Result<Table> {
        let store = Store::open(path)?;
        Ok(Table {
            len: store.len(),
            store,
            generation,
            chm: Chm::new(),
            doomed: AtomicBool::new(false),
        })
    }

    pub fn file_name(dir: &Path, generation: u64) -> PathBuf {
        dir.join(format!("{generation:08}.tbl"))
    }

    /// Reads the key at `idx`, persisting it first if dirty.
    #[inline]
    pub fn key(&self, idx: usize) -> u64 {
        persist::pread(&self.store.slot(idx).key)
    }

    /// The raw value word at `idx`. Value reads go through the engine so
    /// descriptor references are helped; see `MapCore::read_value`.
    #[inline]
    pub fn value_word(&self, idx: usize) -> &AtomicU64 {
        &self.store.slot(idx).value
    }

    /// A persistent CAS on the key at `idx`. On failure `current` is
    /// updated with the key actually present.
    #[inline]
    pub fn cas_key(&self, idx: usize, current: &mut u64, new: u64) -> bool {
        persist::pcas(&self.store.slot(idx).key, current, new)
    }

    /// A persistent CAS on the value at `idx`.
    #[inline]
    pub fn cas_value(&self, idx: usize, current: &mut u64, new: u64) -> bool {
        persist::pcas(&self.store.slot(idx).value, current, new)
    }

    /// The recovery sweep: repairs partial inserts and rebuilds the
    /// size/slots counters. Returns what the chain recovery needs to know.
    pub fn recover(&self) -> RecoveryStats {
        let mut stats = RecoveryStats::default();

        for idx in 0..self.len {
            let key = self.key(idx);
            let mut value = persist::pread(self.value_word(idx));

            // A claimed key with an initial value is a torn insert: the
            // key CAS became durable but the value CAS did not. Close the
            // slot with a tombstone.
            if key != K_INIT && value == V_INIT {
                let mut current = V_INIT;
                if self.cas_value(idx, &mut current, V_TOMB) {
                    persist::pread(self.value_word(idx));
                }
                value = V_TOMB;
                stats.repaired += 1;
            }

            if key != K_INIT {
                stats.slots += 1;
            }
            if value == V_TOMBPRIME {
                stats.sealed += 1;
            } else if is_migrated(value) {
                stats.in_flight += 1;
            } else if value != V_INIT && value != V_TOMB {
                stats.live += 1;
            }
        }

        self.chm.size.store(stats.live as isize, Ordering::Relaxed);
        self.chm.slots.store(stats.slots, Ordering::Relaxed);
        stats
    }

    pub fn delete_file(&self) {
        self.store.delete_file();
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.doomed.load(Ordering::Acquire) {
            self.store.delete_file();
        }
    }
}

/// What a recovery sweep found in one generation.
#[derive(Default)]
pub struct RecoveryStats {
    /// Torn inserts repaired to `V_TOMB`.
    pub repaired: usize,
    /// Claimed key slots.
    pub slots: usize,
    /// Live values counted into `size`.
    pub live: usize,
    /// Slots already sealed with `V_TOMBPRIME`.
    pub sealed: usize,
    /// Slots holding a migration-marked live value: the copy into the
    /// successor may or may not have happened before the crash.
    pub in_flight: usize,
}
