//! The memory-mapped slot region backing one table generation.
//!
//! A region is a flat sequence of 16-byte slots: 8 bytes of atomic key
//! word followed by 8 bytes of atomic value word, little-endian. There is
//! no header; the slot count is inferred from the file length on reopen.

use std::fs::{File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::raw::mark::{DIRTY, K_INIT, V_INIT};

/// A key/value pair at a single index of a table.
#[repr(C)]
pub struct Slot {
    pub key: AtomicU64,
    pub value: AtomicU64,
}

pub const SLOT_SIZE: usize = mem::size_of::<Slot>();

/// A mapped slot region. Unmapping happens on drop; the backing file is
/// removed as well if the region was doomed (superseded by a resize).
pub struct Store {
    map: MmapMut,
    path: PathBuf,
    len: usize,
}

impl Store {
    /// Creates a fresh region of `len` slots at `path`, seeds every slot
    /// with `(K_INIT | DIRTY, V_INIT | DIRTY)`, and flushes the whole
    /// region before returning.
    ///
    /// The region is seeded under a `.tmp` name and renamed into place
    /// only once fully durable, so a crash mid-creation can never leave a
    /// half-seeded file that recovery would mistake for table data.
    pub fn create(path: &Path, len: usize) -> Result<Store> {
        debug_assert!(len.is_power_of_two());
        let staging = path.with_extension("tmp");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&staging)?;
        file.set_len((len * SLOT_SIZE) as u64)?;

        let map = map_file(&file, len)?;
        let store = Store {
            map,
            path: path.to_owned(),
            len,
        };

        for slot in store.slots() {
            slot.key.store(K_INIT | DIRTY, std::sync::atomic::Ordering::Relaxed);
            slot.value.store(V_INIT | DIRTY, std::sync::atomic::Ordering::Relaxed);
        }
        // One sweep over the region is cheaper than a line flush per slot.
        store.map.flush()?;
        file.sync_all()?;
        std::fs::rename(&staging, path)?;

        log::debug!("created slot region {:?} ({} slots)", path, len);
        Ok(store)
    }

    /// Maps an existing region, inferring the slot count from the file
    /// length. Fails if the length is zero or not a multiple of the slot
    /// size.
    pub fn open(path: &Path) -> Result<Store> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let bytes = file.metadata()?.len();

        if bytes == 0 || bytes % SLOT_SIZE as u64 != 0 {
            return Err(Error::CorruptRegion {
                path: path.to_owned(),
                len: bytes,
            });
        }
        let len = (bytes / SLOT_SIZE as u64) as usize;
        if !len.is_power_of_two() {
            return Err(Error::CorruptRegion {
                path: path.to_owned(),
                len: bytes,
            });
        }

        let map = map_file(&file, len)?;
        log::debug!("mapped existing slot region {:?} ({} slots)", path, len);
        Ok(Store {
            map,
            path: path.to_owned(),
            len,
        })
    }

    /// The number of slots in the region.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn slots(&self) -> &[Slot] {
        // Safety: the mapping is at least `len * SLOT_SIZE` bytes, `Slot`
        // is two naturally-aligned atomic words with no padding, and the
        // page-aligned base satisfies `Slot`'s alignment. The mapping
        // lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const Slot, self.len) }
    }

    #[inline]
    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots()[idx]
    }

    /// Removes the backing file. Called for doomed generations after the
    /// region is no longer reachable.
    pub fn delete_file(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::warn!("failed to remove superseded region {:?}: {err}", self.path);
        }
    }
}

fn map_file(file: &File, len: usize) -> Result<MmapMut> {
    // Safety: the file was just opened read-write and sized; the map is
    // shared, which is exactly what a persistent slot region requires.
    let map = unsafe { memmap2::MmapOptions::new().len(len * SLOT_SIZE).map_mut(file)? };
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn create_seeds_initial_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000.tbl");
        let store = Store::create(&path, 8).unwrap();
        assert_eq!(store.len(), 8);
        for slot in store.slots() {
            // The region flush happened, but the in-memory word keeps its
            // dirty bit until a reader persists through it.
            assert_eq!(slot.key.load(Ordering::Relaxed) & !DIRTY, K_INIT);
            assert_eq!(slot.value.load(Ordering::Relaxed) & !DIRTY, V_INIT);
        }
    }

    #[test]
    fn reopen_preserves_words() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000.tbl");
        {
            let store = Store::create(&path, 8).unwrap();
            store.slot(3).key.store(64, Ordering::Relaxed);
            store.slot(3).value.store(128, Ordering::Relaxed);
            store.map.flush().unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.len(), 8);
        assert_eq!(store.slot(3).key.load(Ordering::Relaxed), 64);
        assert_eq!(store.slot(3).value.load(Ordering::Relaxed), 128);
    }

    #[test]
    fn open_rejects_torn_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tbl");
        std::fs::write(&path, [0u8; 24]).unwrap();
        assert!(matches!(
            Store::open(&path),
            Err(Error::CorruptRegion { len: 24, .. })
        ));
    }
}
