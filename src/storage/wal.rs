//! Write-Ahead Logging (WAL) module.
//!
//! Page changes of an atomic operation reach the log, and are fsynced, before
//! they are applied to the page cache:
//! - WAL record formatting and serialization
//! - Log buffer management and file rotation
//! - Log sequence number (LSN) management
//! - Reading the log back for recovery, truncation at checkpoints

pub mod manager;
pub mod record;

pub use manager::{WalConfig, WalManager};
pub use record::{
    CheckpointRecord, FileCreatedRecord, FileDeletedRecord, OperationEndRecord,
    OperationStartRecord, PageChange, PageDeltaRecord, WalRecord, WalRecordHeader,
    WalRecordPayload, WalRecordType, LSN,
};
