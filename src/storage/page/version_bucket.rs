use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageId, PageKey};
use crate::storage::PAGE_SIZE;

/// Format marker stamped at the start of every version bucket page.
pub const VERSION_PAGE_MAGIC: &[u8; 4] = b"VPM0";
pub const VERSION_PAGE_FORMAT: u16 = 0;

// Header structure (16 bytes)
pub const HEADER_SIZE: usize = 16;
const MAGIC_OFFSET: usize = 0;
const FORMAT_OFFSET: usize = 4;
const PAGE_INDEX_OFFSET: usize = 8;
const SLOT_COUNT_OFFSET: usize = 12;

/// One version counter (u32, little-endian).
pub const SLOT_SIZE: usize = 4;

/// Number of version counters held by a single page.
pub const SLOTS_PER_PAGE: usize = (PAGE_SIZE - HEADER_SIZE) / SLOT_SIZE;

fn slot_offset(slot: usize) -> usize {
    debug_assert!(slot < SLOTS_PER_PAGE);
    HEADER_SIZE + slot * SLOT_SIZE
}

/// Read-only view of a version bucket page.
pub struct VersionBucket<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> VersionBucket<'a> {
    pub fn from_data(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    /// Checks the header written by [`VersionBucketMut::init`].
    pub fn validate(&self, key: PageKey) -> StorageResult<()> {
        let corrupted = |reason: String| StorageError::CorruptedPage { key, reason };

        if &self.data[MAGIC_OFFSET..MAGIC_OFFSET + 4] != VERSION_PAGE_MAGIC {
            return Err(corrupted("missing version bucket marker".to_string()));
        }
        let format = self.format_version();
        if format != VERSION_PAGE_FORMAT {
            return Err(corrupted(format!("unsupported format version {}", format)));
        }
        if self.page_index() != key.page_id {
            return Err(corrupted(format!(
                "page index in header is {}",
                self.page_index()
            )));
        }
        if self.slot_count() as usize != SLOTS_PER_PAGE {
            return Err(corrupted(format!("slot count is {}", self.slot_count())));
        }
        Ok(())
    }

    pub fn version(&self, slot: usize) -> u32 {
        let offset = slot_offset(slot);
        LittleEndian::read_u32(&self.data[offset..offset + SLOT_SIZE])
    }

    pub fn format_version(&self) -> u16 {
        LittleEndian::read_u16(&self.data[FORMAT_OFFSET..FORMAT_OFFSET + 2])
    }

    pub fn page_index(&self) -> PageId {
        PageId(LittleEndian::read_u32(
            &self.data[PAGE_INDEX_OFFSET..PAGE_INDEX_OFFSET + 4],
        ))
    }

    pub fn slot_count(&self) -> u16 {
        LittleEndian::read_u16(&self.data[SLOT_COUNT_OFFSET..SLOT_COUNT_OFFSET + 2])
    }
}

/// Mutable view of a version bucket page.
pub struct VersionBucketMut<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> VersionBucketMut<'a> {
    /// Formats `data` as an empty bucket: header written, every counter zero.
    pub fn init(data: &'a mut [u8; PAGE_SIZE], page_id: PageId) -> Self {
        data.fill(0);
        data[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(VERSION_PAGE_MAGIC);
        LittleEndian::write_u16(
            &mut data[FORMAT_OFFSET..FORMAT_OFFSET + 2],
            VERSION_PAGE_FORMAT,
        );
        LittleEndian::write_u32(&mut data[PAGE_INDEX_OFFSET..PAGE_INDEX_OFFSET + 4], page_id.0);
        LittleEndian::write_u16(
            &mut data[SLOT_COUNT_OFFSET..SLOT_COUNT_OFFSET + 2],
            SLOTS_PER_PAGE as u16,
        );

        Self { data }
    }

    pub fn from_data(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn as_bucket(&self) -> VersionBucket<'_> {
        VersionBucket::from_data(self.data)
    }

    /// Adds one to the counter in `slot` and returns the new value.
    ///
    /// Counters wrap around: incrementing `u32::MAX` yields 0.
    pub fn increment(&mut self, slot: usize) -> u32 {
        let offset = slot_offset(slot);
        let next = LittleEndian::read_u32(&self.data[offset..offset + SLOT_SIZE]).wrapping_add(1);
        LittleEndian::write_u32(&mut self.data[offset..offset + SLOT_SIZE], next);
        next
    }

    pub fn set_version(&mut self, slot: usize, version: u32) {
        let offset = slot_offset(slot);
        LittleEndian::write_u32(&mut self.data[offset..offset + SLOT_SIZE], version);
    }
}

impl<'a> Page for VersionBucketMut<'a> {
    fn page_id(&self) -> PageId {
        self.as_bucket().page_index()
    }

    fn data(&self) -> &[u8; PAGE_SIZE] {
        self.data
    }

    fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.data
    }
}
