use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::RwLock;

use super::error::{VersionMapError, VersionMapResult};
use super::{VersionMapConfig, VersionPositionMap};
use crate::storage::page::version_bucket::SLOTS_PER_PAGE;
use crate::storage::{
    FileId, PageId, PageKey, PaginatedStorage, StorageError, StorageResult, VersionBucket,
    VersionBucketMut,
};
use crate::transaction::{AtomicOperation, AtomicOperationsManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Closed,
    Open(FileId),
    Deleted,
}

/// Version position map, on-disk format 0.
///
/// The counter of `hash` is slot `hash % SLOTS_PER_PAGE` of page
/// `hash / SLOTS_PER_PAGE`. Pages are appended one at a time, in order, the
/// first time a hash addresses a page past the end of the file.
pub struct VersionPositionMapV0 {
    storage: Arc<PaginatedStorage>,
    operations: Arc<AtomicOperationsManager>,
    name: String,
    file_name: String,
    config: VersionMapConfig,
    state: RwLock<MapState>,
}

impl VersionPositionMapV0 {
    pub fn new(
        storage: Arc<PaginatedStorage>,
        operations: Arc<AtomicOperationsManager>,
        name: &str,
        extension: &str,
    ) -> Self {
        Self::with_config(storage, operations, name, extension, VersionMapConfig::default())
    }

    pub fn with_config(
        storage: Arc<PaginatedStorage>,
        operations: Arc<AtomicOperationsManager>,
        name: &str,
        extension: &str,
        config: VersionMapConfig,
    ) -> Self {
        Self {
            storage,
            operations,
            name: name.to_string(),
            file_name: format!("{}{}", name, extension),
            config,
            state: RwLock::new(MapState::Closed),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.read(), MapState::Open(_))
    }

    /// Pages of the map as seen by the calling thread's operation.
    pub fn number_of_pages(&self) -> VersionMapResult<u32> {
        let file_id = self.file_id()?;
        let op = self.operations.current_operation();
        Ok(self.storage.filled_up_to(active(op.as_deref()), file_id)?)
    }

    fn file_id(&self) -> VersionMapResult<FileId> {
        match *self.state.read() {
            MapState::Open(file_id) => Ok(file_id),
            MapState::Closed | MapState::Deleted => Err(self.not_open()),
        }
    }

    fn not_open(&self) -> VersionMapError {
        VersionMapError::NotOpen {
            name: self.name.clone(),
        }
    }

    fn missing_operation(&self) -> VersionMapError {
        VersionMapError::MissingOperation {
            name: self.name.clone(),
        }
    }

    /// Appends one initialized bucket page to the map inside `op`.
    fn append_page(&self, op: &AtomicOperation, file_id: FileId) -> StorageResult<PageId> {
        let page_id = self.storage.add_page(op, file_id)?;
        self.storage
            .with_page_mut(op, PageKey::new(file_id, page_id), |data| {
                VersionBucketMut::init(data, page_id);
            })?;
        Ok(page_id)
    }

    /// Appends pages until `page_id` exists for `op`. Another operation may
    /// have grown the map while `op` waited for the growth lock.
    fn grow_to(&self, op: &AtomicOperation, file_id: FileId, page_id: PageId) -> StorageResult<()> {
        self.storage.lock_growth(op, file_id)?;

        let from = self.storage.filled_up_to(Some(op), file_id)?;
        let mut filled = from;
        while filled <= page_id.0 {
            filled = self.append_page(op, file_id)?.0 + 1;
        }
        if filled > from {
            debug!(
                "{} grew from {} to {} page(s) in {}",
                self.name,
                from,
                filled,
                op.id()
            );
        }
        Ok(())
    }
}

/// Page and slot holding the counter of `hash`.
fn locate(hash: u64) -> VersionMapResult<(PageId, usize)> {
    let slots = SLOTS_PER_PAGE as u64;
    // The page count after growing to the page must fit in a u32 too
    let page_index = u32::try_from(hash / slots)
        .ok()
        .filter(|index| *index < u32::MAX)
        .ok_or(VersionMapError::InvalidHash { hash })?;
    Ok((PageId(page_index), (hash % slots) as usize))
}

fn initial_pages(version_array_size: usize) -> usize {
    version_array_size.div_ceil(SLOTS_PER_PAGE).max(1)
}

fn active(op: Option<&AtomicOperation>) -> Option<&AtomicOperation> {
    op.filter(|op| op.is_active())
}

impl VersionPositionMap for VersionPositionMapV0 {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, op: &AtomicOperation) -> VersionMapResult<()> {
        if !op.is_active() {
            return Err(self.missing_operation());
        }
        if self.storage.exists(Some(op), &self.file_name) {
            return Err(VersionMapError::AlreadyExists {
                file_name: self.file_name.clone(),
            });
        }

        let file_id = match self.storage.add_file(op, &self.file_name) {
            Ok(file_id) => file_id,
            Err(StorageError::FileAlreadyExists(file_name)) => {
                return Err(VersionMapError::AlreadyExists { file_name })
            }
            Err(e) => return Err(e.into()),
        };
        for _ in 0..initial_pages(self.config.version_array_size) {
            self.append_page(op, file_id)?;
        }

        // Set only now: add_file may wait for another operation on the name
        *self.state.write() = MapState::Open(file_id);
        info!(
            "created version position map {} ({}) in {}",
            self.name,
            self.file_name,
            op.id()
        );
        Ok(())
    }

    fn open(&self) -> VersionMapResult<()> {
        let mut state = self.state.write();
        if let MapState::Open(_) = *state {
            return Ok(());
        }

        let op = self.operations.current_operation();
        let file_id = match self.storage.open_file(active(op.as_deref()), &self.file_name) {
            Ok(file_id) => file_id,
            Err(StorageError::FileNotFound(_)) => {
                return Err(VersionMapError::NotFound {
                    file_name: self.file_name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        *state = MapState::Open(file_id);
        info!("opened version position map {}", self.name);
        Ok(())
    }

    fn close(&self) -> VersionMapResult<()> {
        let mut state = self.state.write();
        if let MapState::Open(file_id) = *state {
            self.storage.close_file(file_id)?;
            *state = MapState::Closed;
            info!("closed version position map {}", self.name);
        }
        Ok(())
    }

    fn delete(&self, op: &AtomicOperation) -> VersionMapResult<()> {
        if !op.is_active() {
            return Err(self.missing_operation());
        }
        let file_id = self.file_id()?;

        self.storage.delete_file(op, file_id)?;
        *self.state.write() = MapState::Deleted;
        info!("deleted version position map {} in {}", self.name, op.id());
        Ok(())
    }

    fn flush(&self) -> VersionMapResult<()> {
        let file_id = self.file_id()?;
        self.storage.flush_file(file_id)?;
        Ok(())
    }

    fn get_version(&self, hash: u64) -> VersionMapResult<u32> {
        let file_id = self.file_id()?;
        let (page_id, slot) = locate(hash)?;

        let current = self.operations.current_operation();
        let op = active(current.as_deref());
        if page_id.0 >= self.storage.filled_up_to(op, file_id)? {
            return Ok(0);
        }

        let key = PageKey::new(file_id, page_id);
        let version = self.storage.with_page(op, key, |data| {
            let bucket = VersionBucket::from_data(data);
            bucket.validate(key).map(|_| bucket.version(slot))
        })??;
        Ok(version)
    }

    fn update_version(&self, hash: u64) -> VersionMapResult<u32> {
        let file_id = self.file_id()?;
        let (page_id, slot) = locate(hash)?;
        let op = self
            .operations
            .current_operation()
            .filter(|op| op.is_active())
            .ok_or_else(|| self.missing_operation())?;

        if page_id.0 >= self.storage.filled_up_to(Some(&*op), file_id)? {
            self.grow_to(&op, file_id, page_id)?;
        }

        let key = PageKey::new(file_id, page_id);
        let version = self.storage.with_page_mut(&op, key, |data| {
            VersionBucket::from_data(data).validate(key)?;
            Ok::<_, StorageError>(VersionBucketMut::from_data(data).increment(slot))
        })??;
        trace!("{} hash {} -> version {} in {}", self.name, hash, version, op.id());

        Ok(version)
    }
}
