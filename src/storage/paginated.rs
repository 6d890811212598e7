//! Paginated storage: the API durable components are written against.
//!
//! Every mutation is staged inside an [`AtomicOperation`]; reads made under an
//! operation see its staged pages, reads made without one see committed data
//! only. Committing logs the operation to the WAL, fsyncs it, and only then
//! applies it to the shared page cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::recovery::WalReplay;
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::FileNamespace;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::lock::{LockId, LockManager, DEFAULT_LOCK_TIMEOUT};
use crate::storage::page::{FileId, PageId, PageKey};
use crate::storage::wal::{
    FileCreatedRecord, FileDeletedRecord, OperationEndRecord, OperationStartRecord, PageChange,
    PageDeltaRecord, WalConfig, WalManager, WalRecordPayload, LSN,
};
use crate::storage::PAGE_SIZE;
use crate::transaction::operation::{OperationChanges, StagedPage};
use crate::transaction::{AtomicOperation, OperationState};

const DEFAULT_BUFFER_POOL_FRAMES: usize = 64;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding every component file.
    pub data_dir: PathBuf,
    /// Frames in the page cache.
    pub buffer_pool_frames: usize,
    /// How long an operation waits for a page, file or growth lock.
    pub lock_timeout: Duration,
    pub wal: WalConfig,
}

impl StorageConfig {
    /// Defaults for a storage in `data_dir`: 64 cached pages, 10 second lock
    /// timeout, WAL in `<data_dir>/wal`, fsync on every commit.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let wal = WalConfig {
            wal_dir: data_dir.join("wal"),
            ..WalConfig::default()
        };
        Self {
            data_dir,
            buffer_pool_frames: DEFAULT_BUFFER_POOL_FRAMES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            wal,
        }
    }
}

pub struct PaginatedStorage {
    config: StorageConfig,
    buffer_pool: BufferPoolManager,
    wal: WalManager,
    /// Page, file and growth locks of running operations.
    locks: LockManager,
    /// Held shared by commits, exclusively by checkpoints.
    checkpoint_lock: RwLock<()>,
}

impl PaginatedStorage {
    /// Opens the storage in `config.data_dir`, replaying committed operations
    /// found in the WAL, then checkpointing.
    pub fn open(config: StorageConfig) -> StorageResult<Arc<Self>> {
        let namespace = Arc::new(FileNamespace::new(&config.data_dir)?);
        let replacer = Box::new(LruReplacer::new(config.buffer_pool_frames));
        let buffer_pool = BufferPoolManager::new(namespace, replacer, config.buffer_pool_frames);
        let wal = WalManager::open(config.wal.clone())?;

        let stats = WalReplay::new(&wal, &buffer_pool).recover()?;

        let storage = Self {
            locks: LockManager::new(config.lock_timeout),
            config,
            buffer_pool,
            wal,
            checkpoint_lock: RwLock::new(()),
        };
        storage.checkpoint()?;
        info!(
            "storage opened in {}: {}",
            storage.config.data_dir.display(),
            stats
        );

        Ok(Arc::new(storage))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn buffer_pool(&self) -> &BufferPoolManager {
        &self.buffer_pool
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn namespace(&self) -> &FileNamespace {
        self.buffer_pool.namespace()
    }

    /// Whether `name` exists as seen by `op`, or as committed without one.
    pub fn exists(&self, op: Option<&AtomicOperation>, name: &str) -> bool {
        if let Some(op) = op {
            let changes = op.changes();
            if changes.new_file_named(name).is_some() {
                return true;
            }
            if changes.deletes_file_named(name) {
                return false;
            }
        }
        self.namespace().exists(name)
    }

    /// Registers a new, empty file. It is created on disk when `op` commits.
    ///
    /// The name stays locked by `op` until it finishes; a concurrent add of
    /// the same name waits, then sees the file.
    pub fn add_file(&self, op: &AtomicOperation, name: &str) -> StorageResult<FileId> {
        op.ensure_active()?;
        FileNamespace::check_name(name)?;
        self.locks.acquire(op.id(), LockId::File(name.to_string()))?;
        if self.exists(Some(op), name) {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }

        let file_id = self.namespace().book_file_id();
        let mut changes = op.changes();
        changes.new_files.insert(file_id, name.to_string());
        changes.filled_up_to.insert(file_id, 0);
        debug!("{} adds file {} as {}", op.id(), name, file_id);

        Ok(file_id)
    }

    /// Opens a committed file, or resolves one `op` added.
    pub fn open_file(&self, op: Option<&AtomicOperation>, name: &str) -> StorageResult<FileId> {
        if let Some(op) = op {
            let changes = op.changes();
            if let Some(file_id) = changes.new_file_named(name) {
                return Ok(file_id);
            }
            if changes.deletes_file_named(name) {
                return Err(StorageError::FileNotFound(name.to_string()));
            }
        }
        self.namespace().open_file(name)
    }

    /// Deletes the file when `op` commits. Pages the operation staged for it
    /// are dropped right away.
    pub fn delete_file(&self, op: &AtomicOperation, file_id: FileId) -> StorageResult<()> {
        op.ensure_active()?;
        if op.changes().new_files.remove(&file_id).is_some() {
            op.changes().forget_file(file_id);
            return Ok(());
        }

        let name = self.namespace().file_name(file_id)?;
        self.locks.acquire(op.id(), LockId::File(name.clone()))?;
        let mut changes = op.changes();
        changes.forget_file(file_id);
        changes.deleted_files.insert(file_id, name);

        Ok(())
    }

    /// Writes back the file's cached pages and unregisters it. Closing a file
    /// that is not open is a no-op.
    pub fn close_file(&self, file_id: FileId) -> StorageResult<()> {
        if self.namespace().file_name(file_id).is_err() {
            return Ok(());
        }
        self.buffer_pool.flush_file(file_id)?;
        self.buffer_pool.discard_file(file_id);
        self.namespace().close_file(file_id)
    }

    /// Forces the committed pages of the file to disk. A file no commit has
    /// created yet has nothing to flush.
    pub fn flush_file(&self, file_id: FileId) -> StorageResult<()> {
        if self.namespace().file_name(file_id).is_err() {
            return Ok(());
        }
        self.buffer_pool.flush_file(file_id)
    }

    /// Number of pages of the file, including pages `op` appended.
    pub fn filled_up_to(&self, op: Option<&AtomicOperation>, file_id: FileId) -> StorageResult<u32> {
        if let Some(op) = op {
            let changes = op.changes();
            if changes.new_files.contains_key(&file_id) {
                return Ok(changes.filled_up_to.get(&file_id).copied().unwrap_or(0));
            }
            if let Some(filled) = changes.filled_up_to.get(&file_id).copied() {
                drop(changes);
                // Other operations may have grown the file since
                return Ok(filled.max(self.namespace().num_pages(file_id)?));
            }
        }
        self.namespace().num_pages(file_id)
    }

    /// Appends a zeroed page to the file inside `op` and returns its id.
    ///
    /// Takes the growth lock of the file first; see [`Self::lock_growth`].
    pub fn add_page(&self, op: &AtomicOperation, file_id: FileId) -> StorageResult<PageId> {
        op.ensure_active()?;
        self.lock_growth(op, file_id)?;
        let page_id = PageId(self.filled_up_to(Some(op), file_id)?);

        let mut changes = op.changes();
        changes
            .pages
            .insert(PageKey::new(file_id, page_id), StagedPage::zeroed());
        changes
            .filled_up_to
            .insert(file_id, page_id.0.saturating_add(1));

        Ok(page_id)
    }

    /// Runs `f` on the page: `op`'s staged copy if it has one, otherwise the
    /// committed page under a shared latch.
    pub fn with_page<R>(
        &self,
        op: Option<&AtomicOperation>,
        key: PageKey,
        f: impl FnOnce(&[u8; PAGE_SIZE]) -> R,
    ) -> StorageResult<R> {
        if let Some(op) = op {
            let changes = op.changes();
            if let Some(staged) = changes.pages.get(&key) {
                return Ok(f(&*staged.current));
            }
        }
        let guard = self.buffer_pool.fetch_page(key)?;
        Ok(f(&*guard))
    }

    /// Runs `f` on `op`'s copy of the page, staging the copy on first use.
    ///
    /// Staging locks the page for `op` until it commits or rolls back, so the
    /// copy is taken from the latest committed page and no other operation
    /// changes the page in between.
    pub fn with_page_mut<R>(
        &self,
        op: &AtomicOperation,
        key: PageKey,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> StorageResult<R> {
        op.ensure_active()?;
        let staged = {
            let changes = op.changes();
            if changes.deleted_files.contains_key(&key.file_id) {
                return Err(StorageError::UnknownFile(key.file_id));
            }
            changes.pages.contains_key(&key)
        };
        if !staged {
            self.locks.acquire(op.id(), LockId::Page(key))?;
        }

        let mut changes = op.changes();
        let _latch = if staged {
            None
        } else {
            let guard = self.buffer_pool.fetch_page_write(key)?;
            changes.pages.insert(key, StagedPage::copy_of(&guard));
            Some(guard)
        };

        let staged = changes
            .pages
            .get_mut(&key)
            .ok_or(StorageError::PageNotFound(key))?;
        Ok(f(&mut *staged.current))
    }

    /// Makes `op` the only operation that may append pages to the file until
    /// it commits or rolls back. Once this returns, `filled_up_to` for `op`
    /// includes every page other operations committed.
    pub fn lock_growth(&self, op: &AtomicOperation, file_id: FileId) -> StorageResult<()> {
        op.ensure_active()?;
        self.locks.acquire(op.id(), LockId::Growth(file_id))
    }

    /// Writes every cached page back and truncates the WAL.
    pub fn checkpoint(&self) -> StorageResult<LSN> {
        let _checkpoint = self.checkpoint_lock.write();
        self.buffer_pool.flush_all()?;
        let lsn = self.wal.truncate()?;
        info!("checkpoint at {}", lsn);
        Ok(lsn)
    }

    /// Logs and applies the operation's changes, leaving it committed, then
    /// releases its locks.
    ///
    /// Failing before the WAL write rolls the operation back. Once the WAL
    /// holds the operation it counts as committed: a failure while applying
    /// is returned, and the next open replays the operation.
    pub(crate) fn commit_operation(&self, op: &AtomicOperation) -> StorageResult<()> {
        op.ensure_active()?;
        let result = self.apply_operation(op);
        self.locks.release_all(op.id());
        result
    }

    /// Discards the operation's changes and releases its locks.
    pub(crate) fn rollback_operation(&self, op: &AtomicOperation) -> StorageResult<()> {
        op.finish(OperationState::RolledBack)?;
        let changes = op.take_changes();
        self.locks.release_all(op.id());
        debug!(
            "{} rolled back, {} staged page(s) discarded",
            op.id(),
            changes.pages.len()
        );
        Ok(())
    }

    fn apply_operation(&self, op: &AtomicOperation) -> StorageResult<()> {
        let _checkpoint = self.checkpoint_lock.read();
        let changes = op.take_changes();

        if changes.is_empty() {
            op.finish(OperationState::Committed)?;
            debug!("{} committed with no changes", op.id());
            return Ok(());
        }

        let logged = self
            .log_payloads(op, &changes)
            .and_then(|(payloads, deltas)| {
                self.wal.log_operation(op.id().value(), payloads)?;
                Ok(deltas)
            });
        let deltas = match logged {
            Ok(deltas) => deltas,
            Err(e) => {
                op.finish(OperationState::RolledBack)?;
                return Err(e);
            }
        };
        op.finish(OperationState::Committed)?;

        for name in changes.deleted_files.values() {
            remove_file_named(&self.buffer_pool, name)?;
        }
        for (file_id, name) in &changes.new_files {
            self.namespace().create_file(*file_id, name)?;
        }
        for (key, page_changes) in &deltas {
            apply_page_delta(&self.buffer_pool, *key, page_changes)?;
        }

        debug!(
            "{} committed: {} page delta(s), {} new file(s), {} deleted file(s)",
            op.id(),
            deltas.len(),
            changes.new_files.len(),
            changes.deleted_files.len()
        );
        Ok(())
    }

    /// WAL unit of the operation, and the page deltas to apply after it.
    #[allow(clippy::type_complexity)]
    fn log_payloads(
        &self,
        op: &AtomicOperation,
        changes: &OperationChanges,
    ) -> StorageResult<(Vec<WalRecordPayload>, Vec<(PageKey, Vec<PageChange>)>)> {
        let operation_id = op.id().value();
        let mut payloads = vec![WalRecordPayload::OperationStart(OperationStartRecord {
            operation_id,
        })];

        // Deletions first: a name may be deleted and added again in one operation
        for name in changes.deleted_files.values() {
            payloads.push(WalRecordPayload::FileDeleted(FileDeletedRecord {
                file_name: name.clone(),
            }));
        }
        for name in changes.new_files.values() {
            payloads.push(WalRecordPayload::FileCreated(FileCreatedRecord {
                file_name: name.clone(),
            }));
        }

        let mut deltas = Vec::new();
        for (key, staged) in &changes.pages {
            let page_changes = PageChange::diff(&staged.base, &staged.current);
            if page_changes.is_empty() && !staged.appended {
                continue;
            }
            let file_name = match changes.new_files.get(&key.file_id) {
                Some(name) => name.clone(),
                None => self.namespace().file_name(key.file_id)?,
            };
            payloads.push(WalRecordPayload::PageDelta(PageDeltaRecord {
                file_name,
                page_id: key.page_id,
                changes: page_changes.clone(),
            }));
            deltas.push((*key, page_changes));
        }

        payloads.push(WalRecordPayload::OperationEnd(OperationEndRecord {
            operation_id,
        }));
        Ok((payloads, deltas))
    }
}

impl Drop for PaginatedStorage {
    fn drop(&mut self) {
        if let Err(e) = self.checkpoint() {
            warn!(
                "checkpoint on close of {} failed: {}",
                self.config.data_dir.display(),
                e
            );
        }
    }
}

/// Applies `changes` to the page, appending pages until it exists.
///
/// Appended pages are written under the exclusive latch `new_page` hands out,
/// so no reader sees them before the changes land.
pub(crate) fn apply_page_delta(
    buffer_pool: &BufferPoolManager,
    key: PageKey,
    changes: &[PageChange],
) -> StorageResult<()> {
    if let Some(change) = changes.iter().find(|change| !change.is_in_bounds()) {
        return Err(StorageError::CorruptedPage {
            key,
            reason: format!(
                "change of {} byte(s) at offset {} overflows the page",
                change.bytes.len(),
                change.offset
            ),
        });
    }

    while buffer_pool.namespace().num_pages(key.file_id)? <= key.page_id.0 {
        let (page_id, mut guard) = buffer_pool.new_page(key.file_id)?;
        if page_id == key.page_id {
            for change in changes {
                change.apply(&mut guard);
            }
            return Ok(());
        }
    }

    let mut guard = buffer_pool.fetch_page_write(key)?;
    for change in changes {
        change.apply(&mut guard);
    }
    Ok(())
}

/// Deletes `name` from the data directory, dropping its cached pages if it is
/// open. A missing file is not an error.
pub(crate) fn remove_file_named(buffer_pool: &BufferPoolManager, name: &str) -> StorageResult<()> {
    let namespace = buffer_pool.namespace();
    match namespace.file_id(name) {
        Some(file_id) => {
            buffer_pool.discard_file(file_id);
            namespace.delete_file(file_id)
        }
        None => {
            let path = namespace.path_of(name);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::OperationId;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    fn open_storage() -> Result<(Arc<PaginatedStorage>, TempDir)> {
        let dir = tempdir()?;
        let storage = PaginatedStorage::open(StorageConfig::new(dir.path()))?;
        Ok((storage, dir))
    }

    fn commit(storage: &PaginatedStorage, op: &AtomicOperation) -> Result<()> {
        storage.commit_operation(op)?;
        Ok(())
    }

    #[test]
    fn test_added_file_is_visible_to_its_operation_only() -> Result<()> {
        let (storage, dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));

        let file_id = storage.add_file(&op, "a.vpm")?;
        assert!(storage.exists(Some(&op), "a.vpm"));
        assert!(!storage.exists(None, "a.vpm"));
        assert_eq!(storage.open_file(Some(&op), "a.vpm")?, file_id);
        assert!(matches!(
            storage.add_file(&op, "a.vpm"),
            Err(StorageError::FileAlreadyExists(_))
        ));

        commit(&storage, &op)?;
        assert!(storage.exists(None, "a.vpm"));
        assert!(dir.path().join("a.vpm").exists());
        assert_eq!(storage.filled_up_to(None, file_id)?, 0);

        Ok(())
    }

    #[test]
    fn test_staged_pages_are_private_until_commit() -> Result<()> {
        let (storage, _dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&op, "a.vpm")?;
        let page_id = storage.add_page(&op, file_id)?;
        let key = PageKey::new(file_id, page_id);
        storage.with_page_mut(&op, key, |data| data[100] = 7)?;
        commit(&storage, &op)?;

        let op = AtomicOperation::new(OperationId::new(2));
        storage.with_page_mut(&op, key, |data| data[100] = 8)?;
        assert_eq!(storage.with_page(Some(&op), key, |data| data[100])?, 8);
        assert_eq!(storage.with_page(None, key, |data| data[100])?, 7);

        commit(&storage, &op)?;
        assert_eq!(storage.with_page(None, key, |data| data[100])?, 8);

        Ok(())
    }

    #[test]
    fn test_add_page_grows_view_of_operation() -> Result<()> {
        let (storage, _dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&op, "a.vpm")?;

        assert_eq!(storage.add_page(&op, file_id)?, PageId(0));
        assert_eq!(storage.add_page(&op, file_id)?, PageId(1));
        assert_eq!(storage.filled_up_to(Some(&op), file_id)?, 2);
        assert!(matches!(
            storage.with_page(None, PageKey::new(file_id, PageId(0)), |_| ()),
            Err(StorageError::UnknownFile(_))
        ));

        commit(&storage, &op)?;
        assert_eq!(storage.filled_up_to(None, file_id)?, 2);

        Ok(())
    }

    fn open_storage_with_lock_timeout(
        timeout: Duration,
    ) -> Result<(Arc<PaginatedStorage>, TempDir)> {
        let dir = tempdir()?;
        let mut config = StorageConfig::new(dir.path());
        config.lock_timeout = timeout;
        Ok((PaginatedStorage::open(config)?, dir))
    }

    #[test]
    fn test_growth_is_serialized() -> Result<()> {
        let (storage, _dir) = open_storage_with_lock_timeout(Duration::from_millis(50))?;
        let setup = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&setup, "a.vpm")?;
        commit(&storage, &setup)?;

        let first = AtomicOperation::new(OperationId::new(2));
        let second = AtomicOperation::new(OperationId::new(3));
        assert_eq!(storage.add_page(&first, file_id)?, PageId(0));
        assert!(matches!(
            storage.add_page(&second, file_id),
            Err(StorageError::LockTimeout { lock: LockId::Growth(id), .. }) if id == file_id
        ));

        commit(&storage, &first)?;
        assert_eq!(storage.add_page(&second, file_id)?, PageId(1));
        commit(&storage, &second)?;
        assert_eq!(storage.filled_up_to(None, file_id)?, 2);

        Ok(())
    }

    #[test]
    fn test_changed_page_stays_locked_until_commit() -> Result<()> {
        let (storage, _dir) = open_storage_with_lock_timeout(Duration::from_millis(50))?;
        let setup = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&setup, "a.vpm")?;
        let key = PageKey::new(file_id, storage.add_page(&setup, file_id)?);
        commit(&storage, &setup)?;

        let first = AtomicOperation::new(OperationId::new(2));
        let second = AtomicOperation::new(OperationId::new(3));
        storage.with_page_mut(&first, key, |data| data[20] += 1)?;
        assert!(storage.locks().is_locked(&LockId::Page(key)));
        assert!(matches!(
            storage.with_page_mut(&second, key, |data| data[20] += 1),
            Err(StorageError::LockTimeout { .. })
        ));
        // Readers are not blocked
        assert_eq!(storage.with_page(None, key, |data| data[20])?, 0);

        commit(&storage, &first)?;
        assert!(!storage.locks().is_locked(&LockId::Page(key)));
        let value = storage.with_page_mut(&second, key, |data| {
            data[20] += 1;
            data[20]
        })?;
        assert_eq!(value, 2);
        commit(&storage, &second)?;
        assert_eq!(storage.with_page(None, key, |data| data[20])?, 2);

        Ok(())
    }

    #[test]
    fn test_concurrent_changes_to_one_page_all_land() -> Result<()> {
        let (storage, _dir) = open_storage()?;
        let setup = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&setup, "a.vpm")?;
        let key = PageKey::new(file_id, storage.add_page(&setup, file_id)?);
        commit(&storage, &setup)?;

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let storage = Arc::clone(&storage);
                std::thread::spawn(move || -> Result<()> {
                    for round in 0..25u64 {
                        let op = AtomicOperation::new(OperationId::new(100 + t * 100 + round));
                        storage.with_page_mut(&op, key, |data| data[64] += 1)?;
                        storage.commit_operation(&op)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked")?;
        }

        assert_eq!(storage.with_page(None, key, |data| data[64])?, 100);
        Ok(())
    }

    #[test]
    fn test_rollback_releases_locks() -> Result<()> {
        let (storage, _dir) = open_storage_with_lock_timeout(Duration::from_millis(50))?;
        let first = AtomicOperation::new(OperationId::new(1));
        storage.add_file(&first, "a.vpm")?;
        storage.rollback_operation(&first)?;
        assert!(storage.locks().held_by(first.id()).is_empty());

        let second = AtomicOperation::new(OperationId::new(2));
        storage.add_file(&second, "a.vpm")?;
        commit(&storage, &second)?;
        assert!(storage.exists(None, "a.vpm"));

        Ok(())
    }

    #[test]
    fn test_add_of_name_being_added_waits_then_fails() -> Result<()> {
        let (storage, _dir) = open_storage()?;
        let first = AtomicOperation::new(OperationId::new(1));
        storage.add_file(&first, "a.vpm")?;

        let waiter = {
            let storage = Arc::clone(&storage);
            std::thread::spawn(move || {
                let second = AtomicOperation::new(OperationId::new(2));
                let result = storage.add_file(&second, "a.vpm").map(|_| ());
                storage.rollback_operation(&second).map(|_| result)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        commit(&storage, &first)?;

        let result = waiter.join().expect("waiter panicked")?;
        assert!(matches!(result, Err(StorageError::FileAlreadyExists(_))));
        Ok(())
    }

    #[test]
    fn test_delete_file_on_commit() -> Result<()> {
        let (storage, dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&op, "a.vpm")?;
        storage.add_page(&op, file_id)?;
        commit(&storage, &op)?;

        let op = AtomicOperation::new(OperationId::new(2));
        storage.delete_file(&op, file_id)?;
        assert!(!storage.exists(Some(&op), "a.vpm"));
        assert!(storage.exists(None, "a.vpm"));
        assert!(matches!(
            storage.open_file(Some(&op), "a.vpm"),
            Err(StorageError::FileNotFound(_))
        ));

        commit(&storage, &op)?;
        assert!(!storage.exists(None, "a.vpm"));
        assert!(!dir.path().join("a.vpm").exists());

        Ok(())
    }

    #[test]
    fn test_add_then_delete_in_one_operation_leaves_nothing() -> Result<()> {
        let (storage, dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&op, "a.vpm")?;
        storage.add_page(&op, file_id)?;
        storage.delete_file(&op, file_id)?;
        assert_eq!(op.staged_pages(), 0);

        commit(&storage, &op)?;
        assert!(!dir.path().join("a.vpm").exists());

        Ok(())
    }

    #[test]
    fn test_finished_operation_is_rejected() -> Result<()> {
        let (storage, _dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));
        commit(&storage, &op)?;

        assert!(matches!(
            storage.add_file(&op, "a.vpm"),
            Err(StorageError::OperationNotActive { .. })
        ));
        assert!(matches!(
            storage.commit_operation(&op),
            Err(StorageError::OperationNotActive { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_close_and_reopen_file() -> Result<()> {
        let (storage, _dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&op, "a.vpm")?;
        let page_id = storage.add_page(&op, file_id)?;
        storage.with_page_mut(&op, PageKey::new(file_id, page_id), |data| data[9] = 3)?;
        commit(&storage, &op)?;

        storage.close_file(file_id)?;
        storage.close_file(file_id)?;

        let reopened = storage.open_file(None, "a.vpm")?;
        assert_eq!(storage.filled_up_to(None, reopened)?, 1);
        assert_eq!(
            storage.with_page(None, PageKey::new(reopened, page_id), |data| data[9])?,
            3
        );

        Ok(())
    }

    #[test]
    fn test_committed_changes_survive_crash() -> Result<()> {
        let dir = tempdir()?;
        {
            let storage = PaginatedStorage::open(StorageConfig::new(dir.path()))?;
            let op = AtomicOperation::new(OperationId::new(1));
            let file_id = storage.add_file(&op, "a.vpm")?;
            let page_id = storage.add_page(&op, file_id)?;
            storage.with_page_mut(&op, PageKey::new(file_id, page_id), |data| data[64] = 5)?;
            commit(&storage, &op)?;

            // Staged but never committed
            let op = AtomicOperation::new(OperationId::new(2));
            storage.with_page_mut(&op, PageKey::new(file_id, page_id), |data| data[64] = 6)?;

            // Skip the checkpoint Drop would take
            std::mem::forget(storage);
        }

        let storage = PaginatedStorage::open(StorageConfig::new(dir.path()))?;
        let file_id = storage.open_file(None, "a.vpm")?;
        assert_eq!(storage.filled_up_to(None, file_id)?, 1);
        assert_eq!(
            storage.with_page(None, PageKey::new(file_id, PageId(0)), |data| data[64])?,
            5
        );

        Ok(())
    }

    #[test]
    fn test_checkpoint_truncates_wal() -> Result<()> {
        let (storage, _dir) = open_storage()?;
        let op = AtomicOperation::new(OperationId::new(1));
        let file_id = storage.add_file(&op, "a.vpm")?;
        storage.add_page(&op, file_id)?;
        commit(&storage, &op)?;
        assert!(storage.wal().read_all_records()?.len() > 1);

        storage.checkpoint()?;
        assert_eq!(storage.wal().read_all_records()?.len(), 1);

        Ok(())
    }
}
