//! A concurrent, persistent, open-addressed hash map for 64-bit keys and
//! values, plus the persistent multi-word compare-and-swap engine its
//! cross-slot operations are built on.
//!
//! # Usage
//!
//! A [`HashMap`] lives in a directory of memory-mapped files and is shared
//! by reference across threads:
//!
//! ```no_run
//! # fn main() -> durian::Result<()> {
//! let map = durian::HashMap::open("/var/lib/myapp/counters")?;
//!
//! std::thread::scope(|s| {
//!     for _ in 0..4 {
//!         let map = &map;
//!         s.spawn(move || {
//!             for i in 0..100u64 {
//!                 map.update(i << 3, 1 << 3, durian::ops::add).unwrap();
//!             }
//!         });
//!     }
//! });
//! # Ok(())
//! # }
//! ```
//!
//! Keys and values must leave their three low bits zero; shifting payloads
//! left by three is the usual convention. The bits are reserved for the
//! crash-consistency protocol: every write lands with a dirty bit that is
//! cleared only once the cache line is flushed, and every reader flushes
//! on the writer's behalf before acting on a value. Reopening a directory
//! after a crash recovers the map, repairing any insert that was torn
//! between its key and value writes.
//!
//! The [`mwcas`] module exposes the engine directly for atomically
//! updating up to [`mwcas::MAX_ENTRIES`] arbitrary `AtomicU64` words.

mod error;
mod hash;
mod map;
mod raw;

pub mod mwcas;

pub use error::{Error, Result};
pub use hash::{DefaultHashBuilder, IdentityHasher, XxHash64};
pub use map::{ops, HashMap, HashMapBuilder, Iter};
pub use raw::mark::{V_INIT, V_TOMB};
pub use raw::{BatchEntry, UpdateFn};
