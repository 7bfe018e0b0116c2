//! Tag bits and reserved sentinels.
//!
//! Every word in the slot region reserves its three low bits. `DIRTY` marks
//! a store that has not yet been flushed to the backing file; `KCAS` and
//! `RDCSS` mark descriptor references planted by the multi-word engine.
//! The two descriptor bits together encode a fourth state, `MIGRATION`.
//! That encoding is only sound because descriptors are helped to completion
//! before a slot is migration-marked, so a marked word can never be
//! mistaken for a live descriptor reference.

/// The store at this word has not been flushed to the backing file yet.
pub const DIRTY: u64 = 0b001;

/// The word holds a reference to an in-flight multi-word descriptor.
pub const KCAS: u64 = 0b010;

/// The word holds a reference to an in-flight RDCSS descriptor.
pub const RDCSS: u64 = 0b100;

/// The word belongs to a slot frozen by table migration.
pub const MIGRATION: u64 = KCAS | RDCSS;

/// Mask selecting the payload above the reserved bits.
pub const PAYLOAD: u64 = !(DIRTY | KCAS | RDCSS);

// Sentinels sit at the top of the address space, above any payload a caller
// can legitimately store, with the three low bits clear.

/// A key slot that has never been claimed.
pub const K_INIT: u64 = u64::MAX & PAYLOAD;

/// A value slot that has never been written.
pub const V_INIT: u64 = K_INIT;

/// A key slot closed by resize priming; probing stops here.
pub const K_TOMB: u64 = K_INIT - 8;

/// A logically deleted value; the key slot stays reserved.
pub const V_TOMB: u64 = K_TOMB;

/// A tombstone carrying the migration mark; the slot is frozen forever.
pub const V_TOMBPRIME: u64 = V_TOMB | MIGRATION;

/// Conditional-update wildcard: match any live value.
pub const V_MATCH_ANY: u64 = V_TOMB - 8;

/// Conditional-update wildcard: disable the expected-old check.
pub const V_NOMATCH_OLD: u64 = V_MATCH_ANY - 8;

#[inline]
pub fn is_dirty(word: u64) -> bool {
    word & DIRTY != 0
}

// The descriptor predicates are exclusive: a word with both bits set is a
// migration mark, not a reference.

#[inline]
pub fn is_kcas_ref(word: u64) -> bool {
    word & MIGRATION == KCAS
}

#[inline]
pub fn is_rdcss_ref(word: u64) -> bool {
    word & MIGRATION == RDCSS
}

#[inline]
pub fn is_migrated(word: u64) -> bool {
    word & MIGRATION == MIGRATION
}

/// Strips the migration mark from a value.
#[inline]
pub fn unmark_migrated(word: u64) -> u64 {
    debug_assert!(is_migrated(word));
    word & !MIGRATION
}

/// Whether `key` collides with reserved key state or carries tag bits.
#[inline]
pub fn is_key_reserved(key: u64) -> bool {
    key & !PAYLOAD != 0 || key == K_INIT || key == K_TOMB
}

/// Whether `value` collides with a reserved sentinel or carries tag bits.
#[inline]
pub fn is_value_reserved(value: u64) -> bool {
    value & !PAYLOAD != 0
        || value == V_INIT
        || value == V_TOMB
        || value == V_MATCH_ANY
        || value == V_NOMATCH_OLD
}
