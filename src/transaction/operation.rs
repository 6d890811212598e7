//! Atomic operation: the unit in which storage changes are staged, logged and
//! applied.
//!
//! Nothing an operation changes is visible outside it until commit. Pages are
//! staged as private copies; commit logs the byte ranges that differ from the
//! copy's base and only then applies them to the shared page cache.

use std::collections::{BTreeMap, HashMap};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::id::OperationId;
use super::state::{OperationInfo, OperationState};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{FileId, PageKey, PAGE_SIZE};

pub(crate) type PageBuf = Box<[u8; PAGE_SIZE]>;

/// Private copy of a page inside an operation.
pub(crate) struct StagedPage {
    /// Page contents when first staged; all zeroes for pages the operation
    /// appended itself.
    pub base: PageBuf,
    pub current: PageBuf,
    /// The operation appended this page to its file.
    pub appended: bool,
}

impl StagedPage {
    pub fn copy_of(data: &[u8; PAGE_SIZE]) -> Self {
        Self {
            base: Box::new(*data),
            current: Box::new(*data),
            appended: false,
        }
    }

    pub fn zeroed() -> Self {
        Self {
            base: Box::new([0u8; PAGE_SIZE]),
            current: Box::new([0u8; PAGE_SIZE]),
            appended: true,
        }
    }
}

#[derive(Default)]
pub(crate) struct OperationChanges {
    pub pages: BTreeMap<PageKey, StagedPage>,
    /// Page count of every file the operation grew, as it sees it.
    pub filled_up_to: HashMap<FileId, u32>,
    pub new_files: BTreeMap<FileId, String>,
    pub deleted_files: BTreeMap<FileId, String>,
}

impl OperationChanges {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.new_files.is_empty() && self.deleted_files.is_empty()
    }

    /// Drops every staged change to `file_id`.
    pub fn forget_file(&mut self, file_id: FileId) {
        self.pages.retain(|key, _| key.file_id != file_id);
        self.filled_up_to.remove(&file_id);
    }

    pub fn new_file_named(&self, name: &str) -> Option<FileId> {
        self.new_files
            .iter()
            .find(|(_, file_name)| file_name.as_str() == name)
            .map(|(file_id, _)| *file_id)
    }

    pub fn deletes_file_named(&self, name: &str) -> bool {
        self.deleted_files.values().any(|file_name| file_name == name)
    }
}

/// An atomic operation, owned by the thread that started it.
pub struct AtomicOperation {
    info: Mutex<OperationInfo>,
    owner: ThreadId,
    changes: Mutex<OperationChanges>,
}

impl AtomicOperation {
    pub(crate) fn new(id: OperationId) -> Self {
        Self {
            info: Mutex::new(OperationInfo::new(id)),
            owner: thread::current().id(),
            changes: Mutex::new(OperationChanges::default()),
        }
    }

    pub fn id(&self) -> OperationId {
        self.info.lock().id
    }

    pub fn state(&self) -> OperationState {
        self.info.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn duration(&self) -> Duration {
        self.info.lock().duration()
    }

    pub fn info(&self) -> OperationInfo {
        self.info.lock().clone()
    }

    /// Number of pages the operation has staged so far.
    pub fn staged_pages(&self) -> usize {
        self.changes.lock().pages.len()
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn ensure_active(&self) -> StorageResult<()> {
        let info = self.info.lock();
        if info.state.is_active() {
            Ok(())
        } else {
            Err(StorageError::OperationNotActive {
                id: info.id,
                state: info.state,
            })
        }
    }

    pub(crate) fn changes(&self) -> MutexGuard<'_, OperationChanges> {
        self.changes.lock()
    }

    /// Moves the staged changes out, leaving the operation empty.
    pub(crate) fn take_changes(&self) -> OperationChanges {
        std::mem::take(&mut *self.changes.lock())
    }

    pub(crate) fn finish(&self, state: OperationState) -> StorageResult<()> {
        let mut info = self.info.lock();
        if info.finish(state) {
            Ok(())
        } else {
            Err(StorageError::OperationNotActive {
                id: info.id,
                state: info.state,
            })
        }
    }
}

impl std::fmt::Debug for AtomicOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.lock();
        f.debug_struct("AtomicOperation")
            .field("id", &info.id)
            .field("state", &info.state)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageId;

    #[test]
    fn test_new_operation_is_active() {
        let op = AtomicOperation::new(OperationId::new(5));
        assert_eq!(op.id(), OperationId::new(5));
        assert!(op.is_active());
        assert!(op.ensure_active().is_ok());
        assert_eq!(op.owner(), thread::current().id());
        assert_eq!(op.staged_pages(), 0);
    }

    #[test]
    fn test_finish_rejects_second_transition() {
        let op = AtomicOperation::new(OperationId::new(1));
        op.finish(OperationState::RolledBack).unwrap();

        assert_eq!(op.state(), OperationState::RolledBack);
        assert!(matches!(
            op.finish(OperationState::Committed),
            Err(StorageError::OperationNotActive {
                state: OperationState::RolledBack,
                ..
            })
        ));
        assert!(op.ensure_active().is_err());
    }

    #[test]
    fn test_forget_file_drops_its_pages() {
        let op = AtomicOperation::new(OperationId::new(1));
        {
            let mut changes = op.changes();
            for file in [FileId(1), FileId(2)] {
                changes
                    .pages
                    .insert(PageKey::new(file, PageId(0)), StagedPage::zeroed());
                changes.filled_up_to.insert(file, 1);
            }
            changes.forget_file(FileId(1));
        }

        let changes = op.take_changes();
        assert_eq!(changes.pages.len(), 1);
        assert!(changes.filled_up_to.get(&FileId(1)).is_none());
        assert!(op.changes().is_empty());
    }

    #[test]
    fn test_file_lookups_by_name() {
        let op = AtomicOperation::new(OperationId::new(1));
        let mut changes = op.changes();
        changes.new_files.insert(FileId(3), "a.vpm".to_string());
        changes.deleted_files.insert(FileId(4), "b.vpm".to_string());

        assert_eq!(changes.new_file_named("a.vpm"), Some(FileId(3)));
        assert_eq!(changes.new_file_named("b.vpm"), None);
        assert!(changes.deletes_file_named("b.vpm"));
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_staged_copy_keeps_base() {
        let mut data = [0u8; PAGE_SIZE];
        data[10] = 4;
        let mut staged = StagedPage::copy_of(&data);
        staged.current[10] = 5;

        assert_eq!(staged.base[10], 4);
        assert_eq!(staged.current[10], 5);
    }
}
