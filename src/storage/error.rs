//! Storage layer error types.

use thiserror::Error;

use crate::storage::lock::LockId;
use crate::storage::page::{FileId, PageKey};
use crate::transaction::{OperationId, OperationState};

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unknown file id: {0}")]
    UnknownFile(FileId),

    #[error("Page not found: {0}")]
    PageNotFound(PageKey),

    #[error("Corrupted page {key}: {reason}")]
    CorruptedPage { key: PageKey, reason: String },

    #[error("Invalid buffer size: expected {expected} bytes, got {actual}")]
    InvalidBufferSize { expected: usize, actual: usize },

    #[error("Buffer pool is full: cannot allocate new frame")]
    BufferPoolFull,

    #[error("Atomic operation {0} is already in progress on this thread")]
    OperationInProgress(OperationId),

    #[error("Atomic operation {id} is not active: {state}")]
    OperationNotActive { id: OperationId, state: OperationState },

    #[error("Atomic operation {operation} would deadlock waiting for {lock} held by {holder}")]
    Deadlock {
        operation: OperationId,
        lock: LockId,
        holder: OperationId,
    },

    #[error("Atomic operation {operation} timed out waiting for {lock}")]
    LockTimeout { operation: OperationId, lock: LockId },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
