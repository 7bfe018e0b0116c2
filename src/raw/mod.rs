//! The lock-free core: probing, slot transitions, resize, migration, and
//! recovery over a chain of mapped table generations.

pub(crate) mod mark;
pub(crate) mod persist;
pub(crate) mod store;
pub(crate) mod table;

use std::hash::BuildHasher;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use seize::{reclaim, Collector, Guard, Linked};

use crate::error::Result;
use crate::mwcas::{Mwcas, WordEntry};
use mark::{
    is_kcas_ref, is_migrated, is_rdcss_ref, unmark_migrated, K_INIT, K_TOMB, MIGRATION, V_INIT,
    V_MATCH_ANY, V_NOMATCH_OLD, V_TOMB, V_TOMBPRIME,
};
use table::{reprobe_limit, Table, MIN_SIZE};

/// A slot-level CAS function.
///
/// The default is a plain persistent CAS; alternatives may compute the
/// installed value from the current one (see [`crate::ops`]). On success
/// `current` must be left as the witnessed prior value; on failure it must
/// be updated with the word actually observed.
pub type UpdateFn = fn(&AtomicU64, &mut u64, u64) -> bool;

/// One key of a cross-slot atomic exchange.
#[derive(Clone, Copy, Debug)]
pub struct BatchEntry {
    /// The key whose value word participates.
    pub key: u64,
    /// The value the slot is expected to hold.
    pub old: u64,
    /// The replacement value.
    pub new: u64,
}

/// A table generation under guard protection.
struct TableRef<'g> {
    raw: *mut Linked<Table>,
    table: &'g Table,
}

impl<'g> TableRef<'g> {
    /// Safety: `raw` must be a live table protected for `'g`.
    unsafe fn from_raw(raw: *mut Linked<Table>) -> TableRef<'g> {
        debug_assert!(!raw.is_null());
        TableRef {
            raw,
            table: &(*raw).value,
        }
    }
}

impl Copy for TableRef<'_> {}

impl Clone for TableRef<'_> {
    fn clone(&self) -> Self {
        *self
    }
}

/// The raw map: the top-table pointer plus everything shared between
/// operations.
pub(crate) struct MapCore<S> {
    /// The newest fully-promoted generation.
    top: AtomicPtr<Linked<Table>>,

    /// Reclamation of superseded generations.
    collector: Collector,

    /// The multi-word engine; also assists descriptor references found in
    /// value slots.
    mwcas: Mwcas,

    build_hasher: S,

    /// The directory holding the generation files.
    dir: PathBuf,

    /// The next generation number to allocate.
    next_generation: AtomicU64,
}

impl<S: BuildHasher> MapCore<S> {
    /// Opens the map at `dir`, creating generation zero if the directory
    /// holds no table files, or recovering the existing chain otherwise.
    pub fn open(dir: PathBuf, capacity: usize, build_hasher: S) -> Result<MapCore<S>> {
        std::fs::create_dir_all(&dir)?;

        let mut generations = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                // An interrupted resize may leave a partially seeded
                // region behind; it was never linked in, so discard it.
                Some("tmp") => {
                    log::warn!("discarding partially created region {path:?}");
                    std::fs::remove_file(&path)?;
                }
                Some("tbl") => {
                    let generation = path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| stem.parse::<u64>().ok());
                    match generation {
                        Some(generation) => generations.push((generation, path)),
                        None => log::warn!("ignoring unrecognized file {path:?}"),
                    }
                }
                _ => {}
            }
        }
        generations.sort();

        let collector = Collector::new().epoch_frequency(None);

        if generations.is_empty() {
            let len = capacity.next_power_of_two().max(MIN_SIZE);
            let table = Table::create(&dir, 0, len)?;
            let raw = collector.link_boxed(table);
            log::info!("created map at {dir:?} with {len} slots");
            return Ok(MapCore {
                top: AtomicPtr::new(raw),
                collector,
                mwcas: Mwcas::new(),
                build_hasher,
                dir,
                next_generation: AtomicU64::new(1),
            });
        }

        let core = MapCore {
            top: AtomicPtr::new(ptr::null_mut()),
            collector,
            mwcas: Mwcas::new(),
            build_hasher,
            next_generation: AtomicU64::new(generations.last().map(|(g, _)| g + 1).unwrap_or(0)),
            dir,
        };
        core.recover_chain(generations)?;
        Ok(core)
    }

    /// Maps, sweeps, and links an existing generation chain, then
    /// fast-forwards promotion over fully migrated generations.
    ///
    /// Runs before the map is shared, so plain stores are fine.
    fn recover_chain(&self, generations: Vec<(u64, PathBuf)>) -> Result<()> {
        // Open and sweep everything before boxing anything, so an error
        // part-way unwinds cleanly.
        let mut opened = Vec::with_capacity(generations.len());
        let mut stats = Vec::with_capacity(generations.len());

        for (generation, path) in &generations {
            let table = Table::open(path, *generation)?;
            let st = table.recover();
            if st.repaired > 0 {
                log::warn!("repaired {} torn inserts in generation {generation}", st.repaired);
            }
            opened.push(table);
            stats.push(st);
        }

        // A frozen slot in the newest generation means a resize was cut
        // short before its successor survived; grow a fresh one so the
        // migration can drain.
        let needs_successor = {
            let st = &stats[stats.len() - 1];
            st.sealed > 0 || st.in_flight > 0
        };
        if needs_successor {
            let last = &opened[opened.len() - 1];
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let len = last.len * 2;
            log::warn!("generation {} was mid-migration; recreating successor", last.generation);
            opened.push(Table::create(&self.dir, generation, len)?);
            stats.push(Default::default());
        }

        let tables: Vec<*mut Linked<Table>> = opened
            .into_iter()
            .map(|table| self.collector.link_boxed(table))
            .collect();

        // Link the chain oldest-first and initialize the copy accounting
        // from what the sweeps found. Values still awaiting migration are
        // counted into the successor by their placement, so no estimates
        // are carried here.
        for i in 0..tables.len() - 1 {
            let table = unsafe { &(*tables[i]).value };
            table.chm.new_table.store(tables[i + 1], Ordering::Relaxed);
            table.chm.copy_done.store(stats[i].sealed, Ordering::Relaxed);
        }

        // Fast-forward over generations that had finished migrating.
        let mut top = tables[0];
        loop {
            let table = unsafe { &(*top).value };
            let next = table.chm.new_table.load(Ordering::Relaxed);
            if next.is_null() || table.chm.copy_done.load(Ordering::Relaxed) != table.len {
                break;
            }
            table.doomed.store(true, Ordering::Release);
            drop(unsafe { Box::from_raw(top) });
            top = next;
        }

        let table = unsafe { &(*top).value };
        log::info!(
            "recovered map at {:?}: generation {}, {} slots, {} live pairs",
            self.dir,
            table.generation,
            table.len,
            table.chm.size.load(Ordering::Relaxed),
        );
        self.top.store(top, Ordering::Release);
        Ok(())
    }

    #[inline]
    fn hash(&self, key: u64) -> u64 {
        self.build_hasher.hash_one(key)
    }

    #[inline]
    fn top_ref<'g>(&self, guard: &'g Guard<'_>) -> TableRef<'g> {
        let raw = guard.protect(&self.top, Ordering::Acquire);
        // Safety: the top table is never null after `open` and is
        // protected by `guard`.
        unsafe { TableRef::from_raw(raw) }
    }

    /// Reads the value word at `idx` through the engine: descriptor
    /// references are helped to completion and dirty words persisted. The
    /// result is a plain value, a value sentinel, or a migration-marked
    /// value.
    #[inline]
    fn read_value(&self, table: &Table, idx: usize) -> u64 {
        self.mwcas.read(table.value_word(idx))
    }

    /// The eventually consistent live-pair count of the top table.
    pub fn len(&self) -> usize {
        let guard = self.collector.enter();
        let top = self.top_ref(&guard);
        top.table.chm.size.load(Ordering::Relaxed).max(0) as usize
    }

    /// The slot count of the top table.
    pub fn capacity(&self) -> usize {
        let guard = self.collector.enter();
        self.top_ref(&guard).table.len
    }

    /// Starts an iteration pass.
    ///
    /// Any in-progress migration is completed first, so a single table
    /// holds every live pair when the pass begins. A resize that starts
    /// mid-pass is chased through `get`, pair by pair.
    pub fn iter(&self) -> Result<RawIter<'_, S>> {
        let guard = self.collector.enter();
        loop {
            let top = self.top_ref(&guard);
            let next = guard.protect(&top.table.chm.new_table, Ordering::Acquire);
            if next.is_null() {
                let table = top.raw;
                return Ok(RawIter {
                    core: self,
                    _guard: guard,
                    table,
                    idx: 0,
                });
            }
            self.help_copy(&guard)?;
        }
    }

    /// Looks up `key`, returning `V_INIT` when absent.
    pub fn get(&self, key: u64) -> Result<u64> {
        let hash = self.hash(key);
        let guard = self.collector.enter();
        let top = self.top_ref(&guard);
        let value = self.get_impl(top, key, hash, &guard)?;
        debug_assert!(!is_migrated(value) && !mark::is_dirty(value));
        Ok(value)
    }

    fn get_impl<'g>(
        &self,
        t: TableRef<'g>,
        key: u64,
        hash: u64,
        guard: &'g Guard<'_>,
    ) -> Result<u64> {
        let len = t.table.len;
        let mut idx = (hash as usize) & (len - 1);
        let mut reprobes = 0;

        loop {
            let k = t.table.key(idx);
            let v = self.read_value(t.table, idx);

            // An unclaimed key slot means the key was never here.
            if k == K_INIT {
                return Ok(V_INIT);
            }

            let new_table = guard.protect(&t.table.chm.new_table, Ordering::Acquire);

            if k == key {
                if !is_migrated(v) {
                    return Ok(if v == V_TOMB { V_INIT } else { v });
                }
                // The slot is frozen; finish its copy and look again in
                // the successor.
                let next = self.copy_slot_and_check(t, idx, false, guard)?;
                return self.get_impl(next, key, hash, guard);
            }

            reprobes += 1;
            if reprobes >= reprobe_limit(len) || k == K_TOMB {
                if new_table.is_null() {
                    return Ok(V_INIT);
                }
                self.help_copy(guard)?;
                // Safety: reachable from a protected table.
                let next = unsafe { TableRef::from_raw(new_table) };
                return self.get_impl(next, key, hash, guard);
            }

            idx = (idx + 1) & (len - 1);
        }
    }

    /// The generic write: covers put, put-if-absent, remove, replace, and
    /// caller-supplied updates, per the conditional policy on `expected`.
    ///
    /// Returns the witnessed prior value, mapping `V_TOMB` to `V_INIT` for
    /// the caller.
    pub fn put_if_match(&self, key: u64, new_val: u64, expected: u64, cas: UpdateFn) -> Result<u64> {
        let guard = self.collector.enter();
        let top = self.top_ref(&guard);
        let witness = self.put_impl(top, key, new_val, expected, cas, &guard)?;
        debug_assert!(!is_migrated(witness));
        Ok(if witness == V_TOMB { V_INIT } else { witness })
    }

    fn put_impl<'g>(
        &self,
        t: TableRef<'g>,
        key: u64,
        new_val: u64,
        expected: u64,
        cas: UpdateFn,
        guard: &'g Guard<'_>,
    ) -> Result<u64> {
        debug_assert!(new_val != V_INIT);
        debug_assert!(!is_migrated(new_val) && !is_migrated(expected));

        let len = t.table.len;
        let mut idx = (self.hash(key) as usize) & (len - 1);
        let mut reprobes = 0;
        let mut new_table = ptr::null_mut();
        let mut k;
        let mut v;

        // Phase A: claim a key slot.
        loop {
            k = t.table.key(idx);
            v = self.read_value(t.table, idx);

            if k == K_INIT {
                // Removing a key that was never present is a no-op.
                if new_val == V_TOMB {
                    return Ok(new_val);
                }
                let mut current = K_INIT;
                if t.table.cas_key(idx, &mut current, key) {
                    t.table.chm.slots.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                // Lost the slot; see who got it.
                k = current;
            }

            new_table = guard.protect(&t.table.chm.new_table, Ordering::Acquire);

            if k == key {
                break;
            }

            reprobes += 1;
            if reprobes >= reprobe_limit(len) || k == K_TOMB {
                // Out of probe budget in this generation.
                let next = self.resize(t, guard)?;
                if expected != V_INIT {
                    self.help_copy(guard)?;
                }
                // Safety: reachable from a protected table.
                let next = unsafe { TableRef::from_raw(next) };
                return self.put_impl(next, key, new_val, expected, cas, guard);
            }
            idx = (idx + 1) & (len - 1);
        }

        // The slot already holds what we want to write.
        if new_val == v {
            return Ok(v);
        }

        // A fresh insert into a near-full table, or a frozen value, forces
        // the resize to start before we install anything.
        if new_table.is_null()
            && ((v == V_INIT && t.table.chm.table_full(reprobes, len)) || is_migrated(v))
        {
            new_table = self.resize(t, guard)?;
        }
        if !new_table.is_null() {
            let next = self.copy_slot_and_check(t, idx, expected == V_INIT, guard)?;
            return self.put_impl(next, key, new_val, expected, cas, guard);
        }

        // Phase B: replace the value.
        loop {
            debug_assert!(!is_migrated(v));

            // The conditional policy on the expected value.
            if expected != V_NOMATCH_OLD
                && v != expected
                && (expected != V_MATCH_ANY || v == V_TOMB || v == V_INIT)
                && (v != V_INIT || expected != V_TOMB)
            {
                return Ok(v);
            }

            if cas(t.table.value_word(idx), &mut v, new_val) {
                // Every live value is counted in the table it lands in,
                // migration placements included, so a promoted table's
                // count is exact without inheriting estimates.
                if (v == V_INIT || v == V_TOMB) && new_val != V_TOMB {
                    t.table.chm.size.fetch_add(1, Ordering::Relaxed);
                } else if !(v == V_INIT || v == V_TOMB) && new_val == V_TOMB {
                    t.table.chm.size.fetch_sub(1, Ordering::Relaxed);
                }
                // A caller expecting a real prior value gets the tombstone
                // sentinel when the slot was never written.
                return Ok(if v == V_INIT && expected != V_INIT { V_TOMB } else { v });
            }

            // The CAS witnessed something else. A descriptor reference is
            // helped and re-read; a migration mark moves us to the
            // successor; otherwise re-evaluate the policy with the new
            // value.
            if is_kcas_ref(v) || is_rdcss_ref(v) {
                v = self.read_value(t.table, idx);
            }
            if is_migrated(v) {
                let next = self.copy_slot_and_check(t, idx, expected == V_INIT, guard)?;
                return self.put_impl(next, key, new_val, expected, cas, guard);
            }
        }
    }

    /// Ensures `t` has a successor, installing a freshly allocated one if
    /// the CAS race is won, and returns it.
    fn resize<'g>(&self, t: TableRef<'g>, guard: &'g Guard<'_>) -> Result<*mut Linked<Table>> {
        let existing = guard.protect(&t.table.chm.new_table, Ordering::Acquire);
        if !existing.is_null() {
            return Ok(existing);
        }

        let old_len = t.table.len;
        let size = t.table.chm.size.load(Ordering::Relaxed).max(0) as usize;

        // Grow by the population heuristic, never shrinking and always by
        // at least one doubling.
        let mut new_len = old_len;
        if size >= old_len / 4 {
            new_len = old_len << 1;
        }
        if size >= old_len / 2 {
            new_len = old_len << 2;
        }
        if new_len <= old_len {
            new_len = old_len << 1;
        }

        // Check once more before paying for the allocation.
        let existing = guard.protect(&t.table.chm.new_table, Ordering::Acquire);
        if !existing.is_null() {
            return Ok(existing);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let table = Table::create(&self.dir, generation, new_len)?;
        let raw = self.collector.link_boxed(table);

        match t.table.chm.new_table.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::debug!(
                    "resizing generation {} ({old_len} slots) into generation {generation} ({new_len} slots)",
                    t.table.generation,
                );
                Ok(raw)
            }
            Err(winner) => {
                // Lost the install; discard the speculative generation.
                let speculative = unsafe { Box::from_raw(raw) };
                speculative.value.doomed.store(true, Ordering::Release);
                drop(speculative);
                Ok(winner)
            }
        }
    }

    /// Copies one slot, credits the migration if this call sealed it, and
    /// returns the successor for the caller to retry in.
    fn copy_slot_and_check<'g>(
        &self,
        t: TableRef<'g>,
        idx: usize,
        no_help: bool,
        guard: &'g Guard<'_>,
    ) -> Result<TableRef<'g>> {
        let new_raw = guard.protect(&t.table.chm.new_table, Ordering::Acquire);
        debug_assert!(!new_raw.is_null());
        // Safety: reachable from a protected table.
        let next = unsafe { TableRef::from_raw(new_raw) };

        if self.copy_slot(t, next, idx, guard)? {
            self.copy_check_and_promote(t, 1);
        }
        if !no_help {
            self.help_copy(guard)?;
        }
        Ok(next)
    }

    /// Migrates the slot at `idx` into `next`.
    ///
    /// Returns whether this call sealed the slot with `V_TOMBPRIME`; the
    /// seals sum to `len` across all threads and process restarts, which
    /// is what drives promotion.
    fn copy_slot(&self, t: TableRef<'_>, next: TableRef<'_>, idx: usize, guard: &Guard<'_>) -> Result<bool> {
        // Close an unclaimed key slot so no inserter can land here.
        loop {
            let k = t.table.key(idx);
            if k != K_INIT {
                break;
            }
            let mut current = K_INIT;
            t.table.cas_key(idx, &mut current, K_TOMB);
        }

        // Freeze the value. Descriptor references are helped to
        // completion by `read_value` before the mark goes down, which is
        // what makes the shared migration encoding sound.
        let mut old_val = self.read_value(t.table, idx);
        loop {
            if is_migrated(old_val) {
                break;
            }
            let mark = if old_val == V_INIT || old_val == V_TOMB {
                V_TOMBPRIME
            } else {
                old_val | MIGRATION
            };
            let mut current = old_val;
            if t.table.cas_value(idx, &mut current, mark) {
                if mark == V_TOMBPRIME {
                    // Nothing to carry over; the seal is ours.
                    return Ok(true);
                }
                old_val = mark;
                break;
            }
            old_val = self.read_value(t.table, idx);
        }

        if old_val == V_TOMBPRIME {
            return Ok(false);
        }

        // Place the frozen value into the successor. A write that
        // happened after ours wins: the placement only succeeds against a
        // never-written slot.
        let key = t.table.key(idx);
        let unmarked = unmark_migrated(old_val);
        debug_assert!(unmarked != V_TOMB);
        self.put_impl(next, key, unmarked, V_INIT, persist::pcas, guard)?;

        // Seal the old slot; exactly one caller wins the credit.
        let mut current = old_val;
        loop {
            if current == V_TOMBPRIME {
                return Ok(false);
            }
            if t.table.cas_value(idx, &mut current, V_TOMBPRIME) {
                return Ok(true);
            }
        }
    }

    /// Records sealed slots and promotes the successor once every slot of
    /// `t` is sealed.
    fn copy_check_and_promote(&self, t: TableRef<'_>, work: usize) {
        let len = t.table.len;
        let done = if work > 0 {
            t.table.chm.copy_done.fetch_add(work, Ordering::AcqRel) + work
        } else {
            t.table.chm.copy_done.load(Ordering::Acquire)
        };
        debug_assert!(done <= len);

        if done == len {
            let new_raw = t.table.chm.new_table.load(Ordering::Acquire);
            if !new_raw.is_null()
                && self
                    .top
                    .compare_exchange(t.raw, new_raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                log::debug!(
                    "promoted generation {}",
                    unsafe { &(*new_raw).value }.generation
                );
                t.table.doomed.store(true, Ordering::Release);
                // Safety: the table is no longer reachable from `top`, and
                // in-flight readers are protected by their guards.
                unsafe { self.collector.retire(t.raw, reclaim::boxed::<Linked<Table>>) };
            }
        }
    }

    /// Helps the top table's migration along, if one is running.
    fn help_copy(&self, guard: &Guard<'_>) -> Result<()> {
        let top = self.top_ref(guard);
        let new_raw = guard.protect(&top.table.chm.new_table, Ordering::Acquire);
        if new_raw.is_null() {
            return Ok(());
        }
        self.help_copy_impl(top, guard)
    }

    /// Chunked cooperative copy of the whole table.
    fn help_copy_impl<'g>(&self, t: TableRef<'g>, guard: &'g Guard<'_>) -> Result<()> {
        let new_raw = guard.protect(&t.table.chm.new_table, Ordering::Acquire);
        debug_assert!(!new_raw.is_null());
        // Safety: reachable from a protected table.
        let next = unsafe { TableRef::from_raw(new_raw) };

        let len = t.table.len;
        let chunk = len.min(1024);
        let mut panicked = false;
        let mut claim = 0;

        while t.table.chm.copy_done.load(Ordering::Acquire) < len {
            if !panicked {
                claim = t.table.chm.copy_idx.load(Ordering::Relaxed);
                loop {
                    if claim >= len * 2 {
                        // Two full passes have been claimed yet the copy
                        // is unfinished: keep copying without claiming so
                        // a stalled peer cannot block completion.
                        log::debug!(
                            "migration of generation {} entered panic mode",
                            t.table.generation
                        );
                        panicked = true;
                        break;
                    }
                    match t.table.chm.copy_idx.compare_exchange(
                        claim,
                        claim + chunk,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => claim = actual,
                    }
                }
            }

            let mut work = 0;
            for i in 0..chunk {
                if self.copy_slot(t, next, (claim + i) & (len - 1), guard)? {
                    work += 1;
                }
            }
            if work > 0 {
                self.copy_check_and_promote(t, work);
            }
            claim += chunk;
        }

        // One extra check in case the promoting thread stalled.
        self.copy_check_and_promote(t, 0);
        Ok(())
    }

    /// Atomically replaces the values of several keys, or none.
    ///
    /// Key slots are acquired up front the same way a write acquires them;
    /// the value words then transition through a single multi-word
    /// operation.
    pub fn compare_exchange_batch(&self, updates: &[BatchEntry]) -> Result<bool> {
        let guard = self.collector.enter();

        loop {
            let mut entries: Vec<WordEntry<'_>> = Vec::with_capacity(updates.len());
            for update in updates {
                let word = self.acquire_value_word(update.key, &guard)?;
                entries.push(WordEntry::new(word, update.old, update.new));
            }

            let mut thread = self.mwcas.thread()?;
            if thread.compare_exchange(&mut entries)? {
                return Ok(true);
            }
            drop(thread);

            // The failure may have come from a migration freezing one of
            // the slots rather than a value mismatch. Only report failure
            // once every slot is live and genuinely different.
            let mut mismatch = false;
            for update in updates {
                let word = self.acquire_value_word(update.key, &guard)?;
                if self.mwcas.read(word) != update.old {
                    mismatch = true;
                    break;
                }
            }
            if mismatch {
                return Ok(false);
            }
        }
    }

    /// Claims or finds the key slot for `key` in the newest generation
    /// that can still accept writes, and returns its value word.
    fn acquire_value_word<'g>(&self, key: u64, guard: &'g Guard<'_>) -> Result<&'g AtomicU64> {
        let hash = self.hash(key);
        let mut t = self.top_ref(guard);

        'table: loop {
            let len = t.table.len;
            let mut idx = (hash as usize) & (len - 1);
            let mut reprobes = 0;

            loop {
                let mut k = t.table.key(idx);
                if k == K_INIT {
                    let mut current = K_INIT;
                    if t.table.cas_key(idx, &mut current, key) {
                        t.table.chm.slots.fetch_add(1, Ordering::Relaxed);
                        k = key;
                    } else {
                        k = current;
                    }
                }

                if k == key {
                    let v = self.read_value(t.table, idx);
                    if is_migrated(v) {
                        t = self.copy_slot_and_check(t, idx, false, guard)?;
                        continue 'table;
                    }
                    return Ok(t.table.value_word(idx));
                }

                reprobes += 1;
                if reprobes >= reprobe_limit(len) || k == K_TOMB {
                    let next = self.resize(t, guard)?;
                    self.help_copy(guard)?;
                    // Safety: reachable from a protected table.
                    t = unsafe { TableRef::from_raw(next) };
                    continue 'table;
                }
                idx = (idx + 1) & (len - 1);
            }
        }
    }
}

/// One pass over the pairs of the table.
///
/// The pass pins the table it started on; pairs whose slots are frozen by
/// a resize that begins mid-pass are chased into the successor through an
/// ordinary lookup.
pub(crate) struct RawIter<'m, S> {
    core: &'m MapCore<S>,
    /// Keeps the pinned table alive for the duration of the pass.
    _guard: Guard<'m>,
    table: *mut Linked<Table>,
    idx: usize,
}

impl<S: BuildHasher> Iterator for RawIter<'_, S> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        // Safety: the table is protected by the pass's guard.
        let table = unsafe { &(*self.table).value };

        while self.idx < table.len {
            let idx = self.idx;
            self.idx += 1;

            let key = table.key(idx);
            if key == K_INIT || key == K_TOMB {
                continue;
            }
            let value = self.core.read_value(table, idx);
            if value == V_INIT || value == V_TOMB {
                continue;
            }
            if !is_migrated(value) {
                return Some(Ok((key, value)));
            }
            // Frozen under us; the pair now lives in a successor.
            match self.core.get(key) {
                Ok(v) if v == V_INIT => continue,
                Ok(v) => return Some(Ok((key, v))),
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

impl<S> Drop for MapCore<S> {
    fn drop(&mut self) {
        // Walk the live chain; retired generations are reclaimed by the
        // collector.
        let mut raw = *self.top.get_mut();
        while !raw.is_null() {
            // Safety: drop has exclusive access and each table in the
            // chain was allocated by `link_boxed`.
            let linked = unsafe { Box::from_raw(raw) };
            raw = linked.value.chm.new_table.load(Ordering::Relaxed);
        }
    }
}
