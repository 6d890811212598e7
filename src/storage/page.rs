pub mod version_bucket;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime handle of a file registered in the storage's namespace.
///
/// File ids are not durable: the WAL refers to files by name and ids are
/// handed out again after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of a page in the page cache: which file, which page of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_id: PageId,
}

impl PageKey {
    pub fn new(file_id: FileId, page_id: PageId) -> Self {
        Self { file_id, page_id }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_id)
    }
}

pub trait Page {
    fn page_id(&self) -> PageId;
    fn data(&self) -> &[u8; PAGE_SIZE];
    fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE];
}

pub use version_bucket::{VersionBucket, VersionBucketMut};
