//! Storage layer of vpmstore.
//!
//! Components store their data in fixed-size pages of named files inside one
//! data directory:
//!
//! - **PageManager**: reads and writes the pages of one file
//! - **FileNamespace**: maps file names to open page managers
//! - **BufferPool**: in-memory page cache with LRU eviction; page latches
//! - **WAL**: write-ahead log of committed atomic operations
//! - **LockManager**: page, file and growth locks held until an operation ends
//! - **PaginatedStorage**: the API components use; every change goes through
//!   an atomic operation and reaches the WAL before the page cache

pub mod buffer;
pub mod disk;
pub mod error;
pub mod lock;
pub mod page;
pub mod paginated;
pub mod wal;

pub use buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
pub use disk::{FileNamespace, PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use lock::{LockId, LockManager};
pub use page::{FileId, Page, PageId, PageKey, VersionBucket, VersionBucketMut};
pub use paginated::{PaginatedStorage, StorageConfig};
