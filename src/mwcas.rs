//! A persistent multi-word compare-and-swap engine.
//!
//! The engine modifies up to [`MAX_ENTRIES`] atomic words as a single
//! atomic, durable operation. It is built from two layers of reusable
//! per-thread descriptors:
//!
//! - an **RDCSS descriptor** makes a single-word CAS conditional on the
//!   owning operation still being undecided, and
//! - a **KCAS descriptor** records the full set of words with their
//!   expected and replacement values plus a status word that decides the
//!   whole operation at a single linearization point.
//!
//! Descriptors are never allocated per operation. Each thread owns one of
//! each kind, identified by `(tid, seq)`; the sequence number is bumped
//! twice around construction so helpers holding a stale reference are
//! invalidated atomically. In the slot array a descriptor is represented
//! by a packed [`DescRef`] word carrying the thread id, the sequence
//! number, and the low tag bits naming the descriptor kind.
//!
//! Any thread that loads a descriptor reference helps the referenced
//! operation to completion before retrying its own read or write, so no
//! operation can stall behind another thread. Words are always processed
//! in ascending address order, which rules out circular helping.

use std::mem;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::raw::mark::{self, DIRTY, KCAS, PAYLOAD, RDCSS};
use crate::raw::persist;

/// The maximum number of words a single operation may modify (`K`).
pub const MAX_ENTRIES: usize = 8;

/// The number of thread slots the engine hands out (`P`).
pub const MAX_THREADS: usize = 128;

const TID_BITS: u32 = MAX_THREADS.trailing_zeros(); // 7
const SEQ_BITS: u32 = 64 - 3 - TID_BITS; // 54
const SEQ_MASK: u64 = (1u64 << SEQ_BITS) - 1;

#[inline]
fn next_seq(seq: u64) -> u64 {
    (seq + 1) & SEQ_MASK
}

/// The packed wire form of a descriptor handle.
///
/// Layout, low to high: three tag bits, `seq` (54 bits), `tid` (7 bits).
/// The tag bits are not part of the reference itself; they are OR'd in
/// when the reference is planted in a word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct DescRef(u64);

impl DescRef {
    #[inline]
    fn new(tid: usize, seq: u64) -> DescRef {
        DescRef(((tid as u64) << (3 + SEQ_BITS)) | ((seq & SEQ_MASK) << 3))
    }

    /// Recovers a reference from a tagged word, dropping the tag bits.
    #[inline]
    pub(crate) fn from_word(word: u64) -> DescRef {
        DescRef(word & PAYLOAD)
    }

    #[inline]
    fn tid(self) -> usize {
        (self.0 >> (3 + SEQ_BITS)) as usize & (MAX_THREADS - 1)
    }

    #[inline]
    fn seq(self) -> u64 {
        (self.0 >> 3) & SEQ_MASK
    }

    #[inline]
    fn as_kcas_word(self) -> u64 {
        self.0 | KCAS
    }

    #[inline]
    fn as_rdcss_word(self) -> u64 {
        self.0 | RDCSS
    }
}

/// The decision state of a multi-word operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Status {
    Undecided = 0,
    Succeeded = 1,
    Failed = 2,
}

// The KCAS `mutable` word packs `{dirty:1, status:2, seq}`.

#[inline]
fn pack_kcas_mutable(seq: u64, status: Status, dirty: bool) -> u64 {
    (seq << 3) | ((status as u64) << 1) | dirty as u64
}

#[inline]
fn kcas_mutable_seq(mutable: u64) -> u64 {
    (mutable >> 3) & SEQ_MASK
}

#[inline]
fn kcas_mutable_status(mutable: u64) -> Status {
    match (mutable >> 1) & 0b11 {
        0 => Status::Undecided,
        1 => Status::Succeeded,
        _ => Status::Failed,
    }
}

// The RDCSS `mutable` word packs `{dirty:1, seq}`.

#[inline]
fn pack_rdcss_mutable(seq: u64, dirty: bool) -> u64 {
    (seq << 1) | dirty as u64
}

#[inline]
fn rdcss_mutable_seq(mutable: u64) -> u64 {
    (mutable >> 1) & SEQ_MASK
}

/// One word of a multi-word operation: the target and its expected and
/// replacement values. Both values must leave the three low bits clear.
pub struct WordEntry<'a> {
    target: &'a AtomicU64,
    old: u64,
    new: u64,
}

impl<'a> WordEntry<'a> {
    /// Describes the replacement of `old` with `new` at `target`.
    pub fn new(target: &'a AtomicU64, old: u64, new: u64) -> WordEntry<'a> {
        WordEntry { target, old, new }
    }
}

// A reusable slot for one word of the owner's current operation. Helpers
// read these fields and re-validate the owner's sequence number afterwards.
struct WordSlot {
    addr: AtomicPtr<AtomicU64>,
    old: AtomicU64,
    new: AtomicU64,
}

impl WordSlot {
    fn empty() -> WordSlot {
        WordSlot {
            addr: AtomicPtr::new(std::ptr::null_mut()),
            old: AtomicU64::new(0),
            new: AtomicU64::new(0),
        }
    }
}

#[repr(C)]
struct KcasDesc {
    mutable: AtomicU64,
    count: AtomicUsize,
    words: [WordSlot; MAX_ENTRIES],
}

#[repr(C)]
struct RdcssDesc {
    mutable: AtomicU64,
    addr: AtomicPtr<AtomicU64>,
    old: AtomicU64,
    new: AtomicU64,
    /// The owning KCAS operation, as a packed (untagged) `DescRef`.
    parent: AtomicU64,
}

/// The multi-word engine: both descriptor pools plus the free list of
/// thread slots.
pub struct Mwcas {
    kcas: Box<[KcasDesc]>,
    rdcss: Box<[RdcssDesc]>,
    free: Mutex<Vec<u16>>,
}

impl Default for Mwcas {
    fn default() -> Mwcas {
        Mwcas::new()
    }
}

impl Mwcas {
    /// Creates an engine with all [`MAX_THREADS`] thread slots free.
    pub fn new() -> Mwcas {
        let kcas = (0..MAX_THREADS)
            .map(|_| KcasDesc {
                mutable: AtomicU64::new(0),
                count: AtomicUsize::new(0),
                words: std::array::from_fn(|_| WordSlot::empty()),
            })
            .collect();

        let rdcss = (0..MAX_THREADS)
            .map(|_| RdcssDesc {
                mutable: AtomicU64::new(0),
                addr: AtomicPtr::new(std::ptr::null_mut()),
                old: AtomicU64::new(0),
                new: AtomicU64::new(0),
                parent: AtomicU64::new(0),
            })
            .collect();

        Mwcas {
            kcas,
            rdcss,
            free: Mutex::new((0..MAX_THREADS as u16).rev().collect()),
        }
    }

    /// Reserves a thread slot for performing multi-word operations.
    ///
    /// The slot is returned to the pool when the handle is dropped. Fails
    /// with [`Error::ThreadLimit`] when all slots are taken.
    pub fn thread(&self) -> Result<MwcasThread<'_>> {
        match self.reserve_tid() {
            Some(tid) => Ok(MwcasThread { engine: self, tid }),
            None => Err(Error::ThreadLimit(MAX_THREADS)),
        }
    }

    /// Reads `target` through any in-flight descriptors.
    ///
    /// While the loaded word carries a descriptor tag, the referenced
    /// operation is helped to completion; a dirty word is persisted. The
    /// returned word therefore never carries the dirty bit and never
    /// references a descriptor. A migration mark (both descriptor bits) is
    /// returned as-is for the caller to interpret.
    pub fn read(&self, target: &AtomicU64) -> u64 {
        loop {
            let word = persist::pread(target);
            if mark::is_rdcss_ref(word) {
                self.complete_rdcss(DescRef::from_word(word));
                continue;
            }
            if mark::is_kcas_ref(word) {
                self.help(DescRef::from_word(word));
                continue;
            }
            return word;
        }
    }

    /// Helps a foreign operation from a context that holds no thread slot,
    /// e.g. a map reader that stumbled over a descriptor reference.
    pub(crate) fn help(&self, desc: DescRef) {
        // Installing on behalf of the foreign operation requires an RDCSS
        // descriptor of our own. If every slot is busy the owner (or one of
        // up to P-1 other helpers) is live and will finish the operation.
        if let Some(tid) = self.reserve_tid() {
            self.run(desc, tid as usize);
            self.release_tid(tid);
        } else {
            std::hint::spin_loop();
        }
    }

    fn reserve_tid(&self) -> Option<u16> {
        self.free.lock().unwrap().pop()
    }

    fn release_tid(&self, tid: u16) {
        self.free.lock().unwrap().push(tid);
    }

    /// The owner-side construction protocol: invalidate, fill, flush,
    /// revalidate.
    fn create(&self, tid: usize, entries: &[WordEntry<'_>]) -> DescRef {
        let desc = &self.kcas[tid];
        let seq0 = kcas_mutable_seq(desc.mutable.load(Ordering::Relaxed));

        // First bump: helpers that captured `seq0` are now invalid.
        desc.mutable
            .store(pack_kcas_mutable(next_seq(seq0), Status::Undecided, true), Ordering::Release);

        desc.count.store(entries.len(), Ordering::Relaxed);
        for (slot, entry) in desc.words.iter().zip(entries) {
            slot.addr.store(
                entry.target as *const AtomicU64 as *mut AtomicU64,
                Ordering::Relaxed,
            );
            slot.old.store(entry.old, Ordering::Relaxed);
            slot.new.store(entry.new, Ordering::Relaxed);
        }
        for slot in desc.words.iter().skip(entries.len()) {
            slot.addr.store(std::ptr::null_mut(), Ordering::Relaxed);
        }

        persist::persist_range(desc as *const KcasDesc as *const u8, mem::size_of::<KcasDesc>());

        // Second bump: the descriptor becomes visible under its final
        // sequence number, still undecided and dirty.
        let seq = next_seq(next_seq(seq0));
        desc.mutable
            .store(pack_kcas_mutable(seq, Status::Undecided, true), Ordering::Release);

        DescRef::new(tid, seq)
    }

    #[inline]
    fn kcas_seq(&self, tid: usize) -> u64 {
        kcas_mutable_seq(self.kcas[tid].mutable.load(Ordering::Acquire))
    }

    /// Reads word `i` of `tid`'s descriptor, re-validating the sequence
    /// number after the reads. `None` means the operation concluded.
    fn entry(&self, tid: usize, seq: u64, i: usize) -> Option<(&AtomicU64, u64, u64)> {
        let slot = &self.kcas[tid].words[i];
        let addr = slot.addr.load(Ordering::Acquire);
        let old = slot.old.load(Ordering::Acquire);
        let new = slot.new.load(Ordering::Acquire);
        if self.kcas_seq(tid) != seq || addr.is_null() {
            return None;
        }
        // Safety: the owner published `addr` under `seq` and the sequence
        // still matches, so the operation that named this target is still
        // in flight and the target must outlive it (the caller's
        // contract on `WordEntry`).
        Some((unsafe { &*addr }, old, new))
    }

    /// Reads the status of `parent`, persisting it first per the
    /// persist-on-read rule. `None` means the descriptor was reused.
    fn status_of(&self, parent: DescRef) -> Option<Status> {
        let desc = &self.kcas[parent.tid()];
        let mutable = persist::pread(&desc.mutable);
        if kcas_mutable_seq(mutable) != parent.seq() {
            return None;
        }
        Some(kcas_mutable_status(mutable))
    }

    /// Drives the operation referenced by `desc` to completion. `helper`
    /// is the thread slot used for RDCSS installs; it may belong to the
    /// owner or to any helping thread.
    fn run(&self, desc: DescRef, helper: usize) -> bool {
        let tid = desc.tid();
        let seq = desc.seq();
        let kcas = &self.kcas[tid];

        let count = kcas.count.load(Ordering::Acquire);
        if self.kcas_seq(tid) != seq {
            return false;
        }

        let mut status = Status::Succeeded;

        'install: for i in 0..count {
            loop {
                let Some((addr, old, _)) = self.entry(tid, seq, i) else {
                    break 'install;
                };
                let Some(witness) = self.rdcss(helper, addr, old, desc) else {
                    // The operation concluded while we were installing.
                    break 'install;
                };
                if witness == old {
                    // Installed at this word.
                    continue 'install;
                }
                if mark::is_kcas_ref(witness) {
                    if mark::is_dirty(witness) {
                        persist::persist(addr, witness);
                    }
                    if DescRef::from_word(witness) == desc {
                        // Another helper already put our reference here.
                        continue 'install;
                    }
                    // A foreign operation holds the word. Remove the
                    // obstruction by helping it, then try again.
                    self.run(DescRef::from_word(witness), helper);
                    continue;
                }
                // The word no longer holds the expected value.
                status = Status::Failed;
                break 'install;
            }
        }

        // Make sure every installed reference is durable before the status
        // word can decide the operation.
        if status == Status::Succeeded {
            let installed = desc.as_kcas_word() | DIRTY;
            for i in 0..count {
                let Some((addr, _, _)) = self.entry(tid, seq, i) else {
                    break;
                };
                if addr.load(Ordering::Acquire) == installed {
                    persist::persist(addr, installed);
                }
            }
        }

        // Decide. The construction left the mutable word dirty; persist it
        // so the expected value below can match.
        let _ = persist::pread(&kcas.mutable);
        let undecided = pack_kcas_mutable(seq, Status::Undecided, false);
        let _ = kcas.mutable.compare_exchange(
            undecided,
            pack_kcas_mutable(seq, status, true),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let mutable = persist::pread(&kcas.mutable);
        if kcas_mutable_seq(mutable) != seq {
            return false;
        }
        let decided = kcas_mutable_status(mutable);

        // Install the final values: the replacements on success, the
        // original values on failure. Each word moves from the descriptor
        // reference (dirty or already persisted) to its value, dirty, and
        // is persisted before we move on.
        for i in 0..count {
            let Some((addr, old, new)) = self.entry(tid, seq, i) else {
                break;
            };
            let value = if decided == Status::Succeeded { new } else { old };
            let dirty_ref = desc.as_kcas_word() | DIRTY;
            if addr
                .compare_exchange(dirty_ref, value | DIRTY, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                let _ = addr.compare_exchange(
                    desc.as_kcas_word(),
                    value | DIRTY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            persist::persist(addr, value | DIRTY);
        }

        decided == Status::Succeeded
    }

    /// Replaces `old` at `addr` with a reference to `parent`, conditional
    /// on `parent` still being undecided.
    ///
    /// Returns the witnessed word: `old` means the install happened (or
    /// had already happened and been resolved), anything else is the
    /// conflicting word. `None` means `parent` concluded.
    fn rdcss(&self, helper: usize, addr: &AtomicU64, old: u64, parent: DescRef) -> Option<u64> {
        let desc = &self.rdcss[helper];
        let seq0 = rdcss_mutable_seq(desc.mutable.load(Ordering::Relaxed));

        desc.mutable
            .store(pack_rdcss_mutable(next_seq(seq0), true), Ordering::Release);
        desc.addr.store(
            addr as *const AtomicU64 as *mut AtomicU64,
            Ordering::Relaxed,
        );
        desc.old.store(old, Ordering::Relaxed);
        desc.new.store(parent.as_kcas_word() | DIRTY, Ordering::Relaxed);
        desc.parent.store(parent.0, Ordering::Relaxed);
        persist::persist_range(desc as *const RdcssDesc as *const u8, mem::size_of::<RdcssDesc>());

        let seq = next_seq(next_seq(seq0));
        desc.mutable
            .store(pack_rdcss_mutable(seq, true), Ordering::Release);
        let me = DescRef::new(helper, seq);

        loop {
            if self.kcas_seq(parent.tid()) != parent.seq() {
                return None;
            }
            let current = persist::pread(addr);
            if mark::is_rdcss_ref(current) {
                // Someone else's install is pending here; resolve it first.
                self.complete_rdcss(DescRef::from_word(current));
                continue;
            }
            if current != old {
                return Some(current);
            }
            match addr.compare_exchange(
                old,
                me.as_rdcss_word(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.complete_rdcss(me);
                    return Some(old);
                }
                Err(_) => continue,
            }
        }
    }

    /// The second step of RDCSS: swing the planted reference to the parent
    /// KCAS reference if the parent is still undecided, or back to the
    /// original value otherwise.
    fn complete_rdcss(&self, re: DescRef) {
        let desc = &self.rdcss[re.tid()];

        let addr = desc.addr.load(Ordering::Acquire);
        let old = desc.old.load(Ordering::Acquire);
        let new = desc.new.load(Ordering::Acquire);
        let parent = DescRef(desc.parent.load(Ordering::Acquire));

        // The fields above are only meaningful if the descriptor still
        // carries the sequence number we followed.
        if rdcss_mutable_seq(desc.mutable.load(Ordering::Acquire)) != re.seq() || addr.is_null() {
            return;
        }
        // Safety: sequence validated after the reads; see `entry`.
        let addr = unsafe { &*addr };

        // A reused parent means the operation concluded, in which case the
        // reference must not be installed.
        let undecided = matches!(self.status_of(parent), Some(Status::Undecided));
        let replacement = if undecided { new } else { old };
        let installed = addr
            .compare_exchange(
                re.as_rdcss_word(),
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        // The parent may have concluded between the status read and the
        // install. Its value pass can no longer be relied on to visit this
        // word, so a reference installed past the decision is taken back
        // out here; if the pass did visit, this exchange loses harmlessly.
        if installed
            && undecided
            && !matches!(self.status_of(parent), Some(Status::Undecided))
        {
            let _ = addr.compare_exchange(new, old, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}

/// A reserved engine thread slot.
///
/// Handles are cheap to hold but bounded: at most [`MAX_THREADS`] may
/// exist at a time. Dropping the handle frees the slot.
pub struct MwcasThread<'e> {
    engine: &'e Mwcas,
    tid: u16,
}

impl MwcasThread<'_> {
    /// Atomically replaces every entry's expected value with its new
    /// value, or none of them.
    ///
    /// Entries are sorted by target address internally; the caller only
    /// has to make sure concurrent operations over overlapping targets
    /// are consistent about which `AtomicU64`s they name. Returns whether
    /// the operation succeeded.
    pub fn compare_exchange(&mut self, entries: &mut [WordEntry<'_>]) -> Result<bool> {
        if entries.is_empty() || entries.len() > MAX_ENTRIES {
            return Err(Error::InvalidEntries("expected between 1 and K words"));
        }
        for entry in entries.iter() {
            if (entry.old | entry.new) & !PAYLOAD != 0 {
                return Err(Error::InvalidEntries("word values must leave the tag bits clear"));
            }
        }

        entries.sort_by_key(|entry| entry.target as *const AtomicU64 as usize);
        for pair in entries.windows(2) {
            if std::ptr::eq(pair[0].target, pair[1].target) {
                return Err(Error::InvalidEntries("duplicate target word"));
            }
        }

        let desc = self.engine.create(self.tid as usize, entries);
        Ok(self.engine.run(desc, self.tid as usize))
    }

    /// Reads `target` through any in-flight descriptors.
    pub fn read(&self, target: &AtomicU64) -> u64 {
        self.engine.read(target)
    }
}

impl Drop for MwcasThread<'_> {
    fn drop(&mut self) {
        self.engine.release_tid(self.tid);
    }
}

impl std::fmt::Debug for Mwcas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mwcas")
            .field("threads", &MAX_THREADS)
            .field("free", &self.free.lock().unwrap().len())
            .finish()
    }
}
