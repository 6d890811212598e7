use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// Page-granular I/O on a single file.
pub struct PageManager {
    file: File,
    num_pages: u32,
}

impl PageManager {
    /// Creates a new, empty file. Fails if the file already exists.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    StorageError::FileAlreadyExists(path.display().to_string())
                }
                _ => StorageError::Io(e),
            })?;

        Ok(Self { file, num_pages: 0 })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StorageError::FileNotFound(path.display().to_string()),
                _ => StorageError::Io(e),
            })?;
        let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;

        Ok(Self { file, num_pages })
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        Self::check_buffer(buf.len())?;

        if page_id.0 >= self.num_pages {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("page {} does not exist", page_id),
            )));
        }

        self.file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        Self::check_buffer(data.len())?;

        // Extend file if necessary
        if page_id.0 >= self.num_pages {
            self.file
                .set_len(Self::page_offset(page_id) + PAGE_SIZE as u64)?;
            self.num_pages = page_id.0 + 1;
        }

        self.file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        self.file.write_all(data)?;

        Ok(())
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Extends the file by one zeroed page and returns its id.
    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        let new_page_id = PageId(self.num_pages);

        self.file
            .set_len(Self::page_offset(new_page_id) + PAGE_SIZE as u64)?;
        self.num_pages += 1;

        Ok(new_page_id)
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn check_buffer(len: usize) -> StorageResult<()> {
        if len != PAGE_SIZE {
            return Err(StorageError::InvalidBufferSize {
                expected: PAGE_SIZE,
                actual: len,
            });
        }
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}
