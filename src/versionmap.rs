//! Version position map: durable version counters addressed by hash.
//!
//! Callers stamp changes to the entries that hash into a bucket by
//! incrementing the bucket's counter, and detect changes by comparing
//! counters. Counters live in pages of one file per map; every increment is a
//! page change inside the calling thread's atomic operation.

pub mod error;
pub mod v0;

pub use error::{VersionMapError, VersionMapResult};
pub use v0::VersionPositionMapV0;

use crate::transaction::AtomicOperation;

/// Extension of version position map files.
pub const DEF_EXTENSION: &str = ".vpm";

/// Number of counters a new map allocates pages for up front. Hashes beyond
/// it grow the map.
pub const DEFAULT_VERSION_ARRAY_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct VersionMapConfig {
    /// Initial capacity hint, in counters.
    pub version_array_size: usize,
}

impl Default for VersionMapConfig {
    fn default() -> Self {
        Self {
            version_array_size: DEFAULT_VERSION_ARRAY_SIZE,
        }
    }
}

/// Operations every on-disk format of the map supports.
///
/// Mutating calls (`create`, `delete`, `update_version`) run inside an active
/// atomic operation; their effects become durable when it commits and vanish
/// when it rolls back.
pub trait VersionPositionMap: Send + Sync {
    fn name(&self) -> &str;

    /// Creates the backing file and its initial pages inside `op`, leaving
    /// the map open.
    fn create(&self, op: &AtomicOperation) -> VersionMapResult<()>;

    /// Attaches to the backing file.
    fn open(&self) -> VersionMapResult<()>;

    /// Writes back cached pages and detaches. Closing a closed map is a no-op.
    fn close(&self) -> VersionMapResult<()>;

    /// Removes the backing file when `op` commits.
    fn delete(&self, op: &AtomicOperation) -> VersionMapResult<()>;

    /// Forces committed pages to disk.
    fn flush(&self) -> VersionMapResult<()>;

    /// Counter of `hash`'s bucket; 0 for buckets never incremented.
    fn get_version(&self, hash: u64) -> VersionMapResult<u32>;

    /// Adds one to the counter of `hash`'s bucket and returns the new value.
    /// Counters wrap around: incrementing `u32::MAX` yields 0.
    fn update_version(&self, hash: u64) -> VersionMapResult<u32>;
}
