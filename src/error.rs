use std::path::PathBuf;

/// The error type for map and engine operations.
///
/// Transient concurrency outcomes (CAS failures, probe exhaustion, sequence
/// mismatches while helping) are never surfaced here; they are retried
/// internally. An `Error` means the operation could not be performed at all.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O failure while creating, mapping, or flushing a generation
    /// file. The affected generation is unrecoverable; the map should be
    /// reopened.
    #[error("i/o failure on the mapped slot region")]
    Io(#[from] std::io::Error),

    /// The caller passed a key that collides with a reserved sentinel or
    /// carries one of the three reserved low bits.
    #[error("key {0:#x} is reserved or carries tag bits")]
    ReservedKey(u64),

    /// The caller passed a value that collides with a reserved sentinel or
    /// carries one of the three reserved low bits.
    #[error("value {0:#x} is reserved or carries tag bits")]
    ReservedValue(u64),

    /// An existing generation file has a length that is not a non-zero
    /// multiple of the slot size, so its capacity cannot be inferred.
    #[error("generation file {path:?} has corrupt length {len}")]
    CorruptRegion {
        /// The offending file.
        path: PathBuf,
        /// Its length in bytes.
        len: u64,
    },

    /// All engine thread slots are in use.
    #[error("the engine thread limit ({0}) was reached")]
    ThreadLimit(usize),

    /// A multi-word operation was given more entries than the engine
    /// supports, no entries at all, or entries naming the same word twice.
    #[error("invalid multi-word entry set: {0}")]
    InvalidEntries(&'static str),
}

/// A specialized `Result` type for map and engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
