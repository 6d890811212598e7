//! Atomic operations manager: starts operations, binds them to the calling
//! thread and drives their commit or rollback.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use log::{debug, warn};

use super::id::OperationIdGenerator;
use super::operation::AtomicOperation;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::PaginatedStorage;

/// The manager handles the lifecycle of atomic operations. A thread has at
/// most one operation at a time.
pub struct AtomicOperationsManager {
    storage: Arc<PaginatedStorage>,
    id_generator: OperationIdGenerator,
    /// Operation bound to each thread.
    current: DashMap<ThreadId, Arc<AtomicOperation>>,
}

impl AtomicOperationsManager {
    pub fn new(storage: Arc<PaginatedStorage>) -> Self {
        Self {
            storage,
            id_generator: OperationIdGenerator::new(),
            current: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<PaginatedStorage> {
        &self.storage
    }

    /// Starts an operation and makes it current for the calling thread.
    pub fn start_atomic_operation(&self) -> StorageResult<Arc<AtomicOperation>> {
        let thread_id = thread::current().id();
        if let Some(existing) = self.current.get(&thread_id) {
            return Err(StorageError::OperationInProgress(existing.id()));
        }

        let op = Arc::new(AtomicOperation::new(self.id_generator.next()));
        self.current.insert(thread_id, Arc::clone(&op));
        debug!("{} started", op.id());

        Ok(op)
    }

    /// The calling thread's operation, if it has one.
    pub fn current_operation(&self) -> Option<Arc<AtomicOperation>> {
        self.current
            .get(&thread::current().id())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Commits the operation and unbinds it from its thread.
    ///
    /// On error the operation is no longer current either; it is rolled back
    /// unless its changes already reached the WAL.
    pub fn commit(&self, op: &AtomicOperation) -> StorageResult<()> {
        let result = self.storage.commit_operation(op);
        self.release(op);
        result
    }

    /// Discards every change of the operation and unbinds it.
    pub fn rollback(&self, op: &AtomicOperation) -> StorageResult<()> {
        let result = self.storage.rollback_operation(op);
        if result.is_ok() {
            self.release(op);
        }
        result
    }

    /// Runs `f` in a new operation; commits if it returns `Ok`, rolls back
    /// otherwise.
    pub fn execute<T, E>(&self, f: impl FnOnce(&AtomicOperation) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let op = self.start_atomic_operation()?;
        match f(op.as_ref()) {
            Ok(value) => {
                self.commit(&op)?;
                Ok(value)
            }
            Err(e) => {
                if op.is_active() {
                    if let Err(rollback_error) = self.rollback(&op) {
                        warn!("rollback of {} failed: {}", op.id(), rollback_error);
                    }
                } else {
                    self.release(&op);
                }
                Err(e)
            }
        }
    }

    /// Starts an operation wrapped in a handle that rolls it back when
    /// dropped unfinished.
    pub fn begin_scoped(self: &Arc<Self>) -> StorageResult<ScopedOperation> {
        let op = self.start_atomic_operation()?;
        Ok(ScopedOperation {
            op,
            manager: Arc::clone(self),
            finished: false,
        })
    }

    /// Operations currently bound to a thread.
    pub fn active_operations(&self) -> Vec<Arc<AtomicOperation>> {
        self.current
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn release(&self, op: &AtomicOperation) {
        let id = op.id();
        self.current
            .remove_if(&op.owner(), |_, current| current.id() == id);
    }
}

/// A handle to an atomic operation that rolls it back on drop if still
/// active.
pub struct ScopedOperation {
    op: Arc<AtomicOperation>,
    manager: Arc<AtomicOperationsManager>,
    finished: bool,
}

impl ScopedOperation {
    pub fn operation(&self) -> &AtomicOperation {
        &self.op
    }

    pub fn commit(mut self) -> StorageResult<()> {
        self.finished = true;
        self.manager.commit(&self.op)
    }

    pub fn rollback(mut self) -> StorageResult<()> {
        self.finished = true;
        self.manager.rollback(&self.op)
    }
}

impl std::ops::Deref for ScopedOperation {
    type Target = AtomicOperation;

    fn deref(&self) -> &Self::Target {
        &self.op
    }
}

impl Drop for ScopedOperation {
    fn drop(&mut self) {
        if !self.finished && self.op.is_active() {
            // Best effort rollback - ignore errors
            let _ = self.manager.rollback(&self.op);
        }
    }
}
