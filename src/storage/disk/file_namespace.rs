//! File namespace of a storage: one directory, one file per durable component.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use super::page_manager::PageManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageId, PageKey};

struct OpenFile {
    name: String,
    pager: Arc<Mutex<PageManager>>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<FileId, OpenFile>,
    by_name: HashMap<String, FileId>,
}

/// Maps file names inside the data directory to open [`PageManager`]s.
pub struct FileNamespace {
    dir: PathBuf,
    registry: RwLock<Registry>,
    next_file_id: AtomicU32,
}

impl FileNamespace {
    pub fn new(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            registry: RwLock::new(Registry::default()),
            next_file_id: AtomicU32::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Reserves an id for a file that will be created later.
    pub fn book_file_id(&self) -> FileId {
        FileId(self.next_file_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.read().by_name.contains_key(name) || self.path_of(name).exists()
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.registry.read().by_name.get(name).copied()
    }

    pub fn file_name(&self, file_id: FileId) -> StorageResult<String> {
        self.registry
            .read()
            .by_id
            .get(&file_id)
            .map(|file| file.name.clone())
            .ok_or(StorageError::UnknownFile(file_id))
    }

    /// Creates `name` on disk and registers it under a previously booked id.
    pub fn create_file(&self, file_id: FileId, name: &str) -> StorageResult<()> {
        Self::check_name(name)?;

        let mut registry = self.registry.write();
        if registry.by_name.contains_key(name) {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }
        let pager = PageManager::create(&self.path_of(name))?;
        registry.by_id.insert(
            file_id,
            OpenFile {
                name: name.to_string(),
                pager: Arc::new(Mutex::new(pager)),
            },
        );
        registry.by_name.insert(name.to_string(), file_id);
        debug!("created file {} as {}", name, file_id);

        Ok(())
    }

    /// Opens an existing file, or returns its id if it is already open.
    pub fn open_file(&self, name: &str) -> StorageResult<FileId> {
        Self::check_name(name)?;

        let mut registry = self.registry.write();
        if let Some(file_id) = registry.by_name.get(name) {
            return Ok(*file_id);
        }
        let pager = PageManager::open(&self.path_of(name))?;
        let file_id = self.book_file_id();
        registry.by_id.insert(
            file_id,
            OpenFile {
                name: name.to_string(),
                pager: Arc::new(Mutex::new(pager)),
            },
        );
        registry.by_name.insert(name.to_string(), file_id);
        debug!("opened file {} as {}", name, file_id);

        Ok(file_id)
    }

    /// Syncs and unregisters the file. Closing an unknown id is a no-op.
    pub fn close_file(&self, file_id: FileId) -> StorageResult<()> {
        let removed = {
            let mut registry = self.registry.write();
            let removed = registry.by_id.remove(&file_id);
            if let Some(file) = &removed {
                registry.by_name.remove(&file.name);
            }
            removed
        };

        if let Some(file) = removed {
            file.pager.lock().sync()?;
            debug!("closed file {} ({})", file.name, file_id);
        }
        Ok(())
    }

    pub fn delete_file(&self, file_id: FileId) -> StorageResult<()> {
        let file = {
            let mut registry = self.registry.write();
            let file = registry
                .by_id
                .remove(&file_id)
                .ok_or(StorageError::UnknownFile(file_id))?;
            registry.by_name.remove(&file.name);
            file
        };

        // Wait for in-flight I/O on the handle before unlinking.
        drop(file.pager.lock());
        std::fs::remove_file(self.path_of(&file.name))?;
        debug!("deleted file {} ({})", file.name, file_id);

        Ok(())
    }

    pub fn num_pages(&self, file_id: FileId) -> StorageResult<u32> {
        Ok(self.pager(file_id)?.lock().num_pages())
    }

    pub fn read_page(&self, key: PageKey, buf: &mut [u8]) -> StorageResult<()> {
        let pager = self.pager(key.file_id)?;
        let mut pager = pager.lock();
        if key.page_id.0 >= pager.num_pages() {
            return Err(StorageError::PageNotFound(key));
        }
        pager.read_page(key.page_id, buf)
    }

    pub fn write_page(&self, key: PageKey, data: &[u8]) -> StorageResult<()> {
        self.pager(key.file_id)?.lock().write_page(key.page_id, data)
    }

    pub fn allocate_page(&self, file_id: FileId) -> StorageResult<PageId> {
        self.pager(file_id)?.lock().allocate_page()
    }

    pub fn sync_file(&self, file_id: FileId) -> StorageResult<()> {
        self.pager(file_id)?.lock().sync()
    }

    pub fn sync_all(&self) -> StorageResult<()> {
        let pagers: Vec<_> = self
            .registry
            .read()
            .by_id
            .values()
            .map(|file| file.pager.clone())
            .collect();
        for pager in pagers {
            pager.lock().sync()?;
        }
        Ok(())
    }

    fn pager(&self, file_id: FileId) -> StorageResult<Arc<Mutex<PageManager>>> {
        self.registry
            .read()
            .by_id
            .get(&file_id)
            .map(|file| file.pager.clone())
            .ok_or(StorageError::UnknownFile(file_id))
    }

    pub(crate) fn check_name(name: &str) -> StorageResult<()> {
        if name.is_empty() || name.contains(|c| c == '/' || c == '\\') || name == "." || name == ".." {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name {:?}", name),
            )));
        }
        Ok(())
    }
}
