//! Atomic operations.
//!
//! This module provides the transaction boundary of the storage:
//! - Operation lifecycle management (start, commit, rollback)
//! - One current operation per thread
//! - Staged page changes, invisible to others until commit
//! - Operation state tracking

pub mod id;
pub mod manager;
pub mod operation;
pub mod state;

// Re-export commonly used types
pub use id::{OperationId, OperationIdGenerator};
pub use manager::{AtomicOperationsManager, ScopedOperation};
pub use operation::AtomicOperation;
pub use state::{OperationInfo, OperationState};
