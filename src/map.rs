use std::hash::BuildHasher;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::hash::DefaultHashBuilder;
use crate::raw::mark::{self, V_INIT, V_MATCH_ANY, V_NOMATCH_OLD, V_TOMB};
use crate::raw::{BatchEntry, MapCore, UpdateFn};

/// A concurrent, persistent hash map for 64-bit keys and values.
///
/// The map lives in a directory of memory-mapped generation files and
/// survives process restarts, including unclean ones: every write becomes
/// durable before any thread can act on it, and reopening a map after a
/// crash repairs the one legal kind of tear (a key claimed without its
/// value).
///
/// Keys and values are plain `u64`s whose three low bits must be zero;
/// those bits are reserved for the flush and descriptor protocol. A
/// convenient convention is to store `x << 3`.
///
/// All operations take `&self` and may be called from any number of
/// threads. Single-slot operations are lock-free; resizing is cooperative
/// and wait-free, with every thread that touches a resizing table helping
/// the migration along.
///
/// # Examples
///
/// ```no_run
/// # fn main() -> durian::Result<()> {
/// let map = durian::HashMap::open("/tmp/example-map")?;
/// map.insert(8, 800)?;
/// assert_eq!(map.get(8)?, Some(800));
/// map.remove(8)?;
/// assert_eq!(map.get(8)?, None);
/// # Ok(())
/// # }
/// ```
pub struct HashMap<S = DefaultHashBuilder> {
    raw: MapCore<S>,
}

/// A builder for a [`HashMap`].
///
/// # Examples
///
/// ```no_run
/// # fn main() -> durian::Result<()> {
/// let map: durian::HashMap = durian::HashMap::builder("/tmp/example-map")
///     // Set the initial capacity.
///     .capacity(2048)
///     // Open or create the map.
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct HashMapBuilder<S = DefaultHashBuilder> {
    path: PathBuf,
    capacity: usize,
    hasher: S,
}

impl HashMapBuilder {
    /// Set the hash builder used to place keys.
    ///
    /// The hasher must be deterministic across process restarts, or keys
    /// written by a previous run will not be found after reopening. The
    /// default xxhash-style hasher satisfies this; randomly seeded hashers
    /// do not.
    pub fn hasher<S>(self, hasher: S) -> HashMapBuilder<S> {
        HashMapBuilder {
            path: self.path,
            capacity: self.capacity,
            hasher,
        }
    }
}

impl<S> HashMapBuilder<S> {
    /// Set the initial capacity of the map, in slots.
    ///
    /// Rounded up to a power of two, with a floor of eight. Ignored when
    /// the directory already holds table files, in which case capacity is
    /// inferred from their lengths.
    pub fn capacity(self, capacity: usize) -> HashMapBuilder<S> {
        HashMapBuilder { capacity, ..self }
    }

    /// Open or create the map with the configured options.
    pub fn build(self) -> Result<HashMap<S>>
    where
        S: BuildHasher,
    {
        Ok(HashMap {
            raw: MapCore::open(self.path, self.capacity, self.hasher)?,
        })
    }
}

impl HashMap {
    /// Opens the map stored in the directory at `path`, creating it with
    /// the default capacity if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<HashMap> {
        HashMap::builder(path).build()
    }

    /// Returns a builder for a map stored at `path`.
    pub fn builder(path: impl AsRef<Path>) -> HashMapBuilder {
        HashMapBuilder {
            path: path.as_ref().to_owned(),
            capacity: 0,
            hasher: DefaultHashBuilder::default(),
        }
    }
}

impl<S: BuildHasher> HashMap<S> {
    /// Returns the value associated with `key`, or `None`.
    ///
    /// The returned value never carries tag bits, and any unflushed write
    /// it observed was made durable before returning.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// map.insert(8, 80)?;
    /// assert_eq!(map.get(8)?, Some(80));
    /// assert_eq!(map.get(16)?, None);
    /// # Ok(())
    /// # }
    /// ```
    pub fn get(&self, key: u64) -> Result<Option<u64>> {
        check_key(key)?;
        Ok(present(self.raw.get(key)?))
    }

    /// Whether `key` currently has a live value.
    pub fn contains_key(&self, key: u64) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts or overwrites, returning the prior value if any.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// assert_eq!(map.insert(8, 80)?, None);
    /// assert_eq!(map.insert(8, 88)?, Some(80));
    /// # Ok(())
    /// # }
    /// ```
    pub fn insert(&self, key: u64, value: u64) -> Result<Option<u64>> {
        check_key(key)?;
        check_value(value)?;
        Ok(present(self.raw.put_if_match(key, value, V_NOMATCH_OLD, ops::store)?))
    }

    /// Inserts only if `key` has no live value. Returns the value that is
    /// now current: `None` means the insert happened.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// assert_eq!(map.try_insert(8, 80)?, None);
    /// // The slot is taken; the existing value is reported.
    /// assert_eq!(map.try_insert(8, 88)?, Some(80));
    /// # Ok(())
    /// # }
    /// ```
    pub fn try_insert(&self, key: u64, value: u64) -> Result<Option<u64>> {
        check_key(key)?;
        check_value(value)?;
        Ok(present(self.raw.put_if_match(key, value, V_TOMB, ops::store)?))
    }

    /// Replaces the value of `key` only if a live value exists. Returns
    /// the prior value if the replacement happened.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// // Nothing to replace yet.
    /// assert_eq!(map.replace(8, 80)?, None);
    /// map.insert(8, 80)?;
    /// assert_eq!(map.replace(8, 88)?, Some(80));
    /// # Ok(())
    /// # }
    /// ```
    pub fn replace(&self, key: u64, value: u64) -> Result<Option<u64>> {
        check_key(key)?;
        check_value(value)?;
        Ok(present(self.raw.put_if_match(key, value, V_MATCH_ANY, ops::store)?))
    }

    /// Replaces `old` with `new` at `key` only if the current value is
    /// exactly `old`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// map.insert(8, 80)?;
    /// assert!(map.compare_exchange(8, 80, 88)?);
    /// assert!(!map.compare_exchange(8, 80, 96)?);
    /// # Ok(())
    /// # }
    /// ```
    pub fn compare_exchange(&self, key: u64, old: u64, new: u64) -> Result<bool> {
        check_key(key)?;
        check_value(old)?;
        check_value(new)?;
        Ok(self.raw.put_if_match(key, new, old, ops::store)? == old)
    }

    /// Logically deletes `key`, returning the prior value if any. The key
    /// slot stays reserved for reinsertion.
    pub fn remove(&self, key: u64) -> Result<Option<u64>> {
        check_key(key)?;
        Ok(present(self.raw.put_if_match(key, V_TOMB, V_NOMATCH_OLD, ops::store)?))
    }

    /// Deletes `key` only if its current value is exactly `value`.
    pub fn remove_if(&self, key: u64, value: u64) -> Result<bool> {
        check_key(key)?;
        check_value(value)?;
        Ok(self.raw.put_if_match(key, V_TOMB, value, ops::store)? == value)
    }

    /// Installs `f(current, value)` at `key`, retrying the slot-level CAS
    /// until it lands. See [`ops`] for the provided update functions, and
    /// [`UpdateFn`] for the contract a custom one must follow.
    ///
    /// Returns the prior value, the way [`insert`](HashMap::insert) does.
    ///
    /// # Examples
    ///
    /// A durable concurrent counter:
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// map.update(8, 1 << 3, durian::ops::add)?;
    /// map.update(8, 1 << 3, durian::ops::add)?;
    /// assert_eq!(map.get(8)?, Some(2 << 3));
    /// # Ok(())
    /// # }
    /// ```
    pub fn update(&self, key: u64, value: u64, f: UpdateFn) -> Result<Option<u64>> {
        check_key(key)?;
        check_value(value)?;
        Ok(present(self.raw.put_if_match(key, value, V_NOMATCH_OLD, f)?))
    }

    /// Atomically replaces the values of up to [`MAX_ENTRIES`] keys, or
    /// none of them.
    ///
    /// Each entry names a key, the value its slot must currently hold,
    /// and the replacement. The exchange takes effect as a single atomic,
    /// durable transition driven by the multi-word engine; no observer can
    /// see a mix of old and new values.
    ///
    /// # Examples
    ///
    /// Move a unit between two durable balances:
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// use durian::BatchEntry;
    ///
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// map.insert(8, 10 << 3)?;
    /// map.insert(16, 0)?;
    ///
    /// let moved = map.compare_exchange_batch(&[
    ///     BatchEntry { key: 8, old: 10 << 3, new: 9 << 3 },
    ///     BatchEntry { key: 16, old: 0, new: 1 << 3 },
    /// ])?;
    /// assert!(moved);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// [`MAX_ENTRIES`]: crate::mwcas::MAX_ENTRIES
    pub fn compare_exchange_batch(&self, entries: &[BatchEntry]) -> Result<bool> {
        for entry in entries {
            check_key(entry.key)?;
            check_value(entry.old)?;
            check_value(entry.new)?;
        }
        self.raw.compare_exchange_batch(entries)
    }

    /// An iterator over the live pairs of the map.
    ///
    /// Starting a pass completes any in-progress resize, so a single
    /// table holds every pair when the pass begins. The pass is weakly
    /// consistent: concurrent writes may or may not be observed, but
    /// every pair yielded was live at some point during the pass, and no
    /// key is yielded twice.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> durian::Result<()> {
    /// let map = durian::HashMap::open("/tmp/doc-map")?;
    /// map.insert(8, 80)?;
    /// map.insert(16, 160)?;
    ///
    /// let mut total = 0;
    /// for pair in map.iter()? {
    ///     let (_key, value) = pair?;
    ///     total += value;
    /// }
    /// assert_eq!(total, 240);
    /// # Ok(())
    /// # }
    /// ```
    pub fn iter(&self) -> Result<Iter<'_, S>> {
        Ok(Iter {
            raw: self.raw.iter()?,
        })
    }

    /// The eventually consistent count of live pairs.
    ///
    /// Exact when no other thread is writing.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the map holds no live pairs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The slot count of the current table. Grows across resizes and
    /// reflects the backing file size.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }
}

/// An iterator over the live pairs of a [`HashMap`].
///
/// Created by [`HashMap::iter`]. Yields `Result` items because chasing a
/// pair displaced by a concurrent resize can touch the backing file.
pub struct Iter<'a, S = DefaultHashBuilder> {
    raw: crate::raw::RawIter<'a, S>,
}

impl<S: BuildHasher> Iterator for Iter<'_, S> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next()
    }
}

impl<S> std::fmt::Debug for HashMap<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashMap").finish_non_exhaustive()
    }
}

#[inline]
fn present(raw: u64) -> Option<u64> {
    // The raw layer reports "no prior live value" as the initial sentinel.
    (raw != V_INIT && raw != V_TOMB).then_some(raw)
}

#[inline]
fn check_key(key: u64) -> Result<()> {
    if mark::is_key_reserved(key) {
        return Err(Error::ReservedKey(key));
    }
    Ok(())
}

#[inline]
fn check_value(value: u64) -> Result<()> {
    if mark::is_value_reserved(value) {
        return Err(Error::ReservedValue(value));
    }
    Ok(())
}

/// Slot-level update functions for [`HashMap::update`].
pub mod ops {
    use std::sync::atomic::AtomicU64;

    use crate::raw::mark::{V_INIT, V_TOMB};
    use crate::raw::persist;

    /// The default update: a plain persistent CAS installing the proposed
    /// value.
    pub fn store(word: &AtomicU64, current: &mut u64, new: u64) -> bool {
        persist::pcas(word, current, new)
    }

    /// Adds `delta` to the current value, treating a missing or deleted
    /// value as zero.
    ///
    /// Payloads live above the three reserved bits, so the arithmetic
    /// happens on the shifted representation: `add` of `1 << 3` increments
    /// the logical value by one.
    pub fn add(word: &AtomicU64, current: &mut u64, delta: u64) -> bool {
        let base = if *current == V_INIT || *current == V_TOMB {
            0
        } else {
            *current
        };
        // CAS rather than fetch-add: the current value may be a sentinel,
        // and the slot may be frozen by a migration at any moment.
        let new = ((base >> 3).wrapping_add(delta >> 3)) << 3;
        persist::pcas(word, current, new)
    }
}
