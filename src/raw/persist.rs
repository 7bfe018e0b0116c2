//! The dirty-bit flush protocol.
//!
//! Every store into the mapped slot region installs its word with the
//! [`DIRTY`](super::mark::DIRTY) bit set. The bit is cleared only after the
//! cache line holding the word has been written back and fenced, so a clear
//! word is always durable. Readers participate: [`pread`] flushes on the
//! caller's behalf before returning, which means no thread can act on a
//! value that could vanish in a crash.

use std::sync::atomic::{AtomicU64, Ordering};

use super::mark::{self, DIRTY};

const CACHE_LINE: usize = 64;

/// Writes back the cache line containing `addr`.
///
/// The exact instruction is selected at build time: `clflush` by default,
/// or `clflushopt`/`clwb` via the cargo features of the same name. All
/// three guarantee the line reaches the persistence domain once the
/// following store fence completes.
#[inline]
pub fn flush_line(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        #[cfg(feature = "clwb")]
        std::arch::x86_64::_mm_clwb(addr as *const _);

        #[cfg(all(feature = "clflushopt", not(feature = "clwb")))]
        std::arch::x86_64::_mm_clflushopt(addr as *const _);

        #[cfg(not(any(feature = "clflushopt", feature = "clwb")))]
        std::arch::x86_64::_mm_clflush(addr);
    }

    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

/// Issues a store fence ordering preceding flushes.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// Flushes every cache line covering `[addr, addr + len)` and fences once.
pub fn persist_range(addr: *const u8, len: usize) {
    let start = addr as usize & !(CACHE_LINE - 1);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        flush_line(line as *const u8);
        line += CACHE_LINE;
    }
    fence();
}

/// Flushes the line holding `word`, fences, then atomically clears the
/// dirty bit from the observed `value`.
///
/// The CAS may lose to a concurrent writer or to another persister; both
/// are fine, because whoever replaced the word is responsible for its new
/// dirty bit.
#[inline]
pub fn persist(word: &AtomicU64, value: u64) -> u64 {
    flush_line(word as *const AtomicU64 as *const u8);
    fence();
    let _ = word.compare_exchange(
        value,
        value & !DIRTY,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    value & !DIRTY
}

/// Loads `word`, persisting it first if the dirty bit is set.
///
/// The returned word never carries the dirty bit; descriptor or migration
/// tags are preserved for the caller to interpret.
#[inline]
pub fn pread(word: &AtomicU64) -> u64 {
    let value = word.load(Ordering::Acquire);
    if mark::is_dirty(value) {
        return persist(word, value);
    }
    value
}

/// A persistent compare-and-swap.
///
/// Reads through the dirty bit, then attempts to replace `*current` with
/// `new | DIRTY`. On failure, `*current` is updated with the word actually
/// observed (dirty bit cleared) so the caller can re-evaluate and retry.
#[inline]
pub fn pcas(word: &AtomicU64, current: &mut u64, new: u64) -> bool {
    debug_assert!(!mark::is_dirty(*current));
    // Make sure the prior write is durable before we replace it.
    pread(word);
    match word.compare_exchange(*current, new | DIRTY, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => true,
        Err(actual) => {
            *current = if mark::is_dirty(actual) {
                persist(word, actual)
            } else {
                actual
            };
            false
        }
    }
}
