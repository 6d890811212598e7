//! WAL record types and structures.
//!
//! Every committed atomic operation is logged as one unit:
//! `OperationStart`, then its file creations, page deltas and file deletions,
//! then `OperationEnd`. Units without an end record are ignored on replay.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::{PageId, PAGE_SIZE};

/// Log Sequence Number - a unique identifier for WAL records.
/// LSNs are monotonically increasing and used to order log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LSN(pub u64);

impl LSN {
    /// Create a new LSN with value 0.
    pub fn new() -> Self {
        LSN(0)
    }

    /// Get the next LSN.
    pub fn next(&self) -> Self {
        LSN(self.0 + 1)
    }

    /// Check if this is an invalid LSN (0).
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl Default for LSN {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LSN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// WAL record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordType {
    OperationStart,
    FileCreated,
    PageDelta,
    FileDeleted,
    OperationEnd,
    Checkpoint,
}

/// WAL record header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecordHeader {
    /// Log sequence number of this record.
    pub lsn: LSN,
    /// Previous LSN in the same operation (0 if first record).
    pub prev_lsn: LSN,
    /// Atomic operation that generated this record.
    pub operation_id: u64,
    /// Type of the WAL record.
    pub record_type: WalRecordType,
    /// Size of the record payload in bytes.
    pub payload_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStartRecord {
    pub operation_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCreatedRecord {
    pub file_name: String,
}

/// Bytes written at `offset` of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageChange {
    pub offset: u16,
    pub bytes: Vec<u8>,
}

impl PageChange {
    /// Maximal runs of bytes where `after` differs from `before`.
    ///
    /// Bytes left unchanged are never part of a change, so deltas of two
    /// operations that touched different bytes of one page both survive.
    pub fn diff(before: &[u8; PAGE_SIZE], after: &[u8; PAGE_SIZE]) -> Vec<PageChange> {
        let mut changes = Vec::new();
        let mut pos = 0;

        while pos < PAGE_SIZE {
            if before[pos] == after[pos] {
                pos += 1;
                continue;
            }
            let start = pos;
            while pos < PAGE_SIZE && before[pos] != after[pos] {
                pos += 1;
            }
            changes.push(PageChange {
                offset: start as u16,
                bytes: after[start..pos].to_vec(),
            });
        }

        changes
    }

    pub fn apply(&self, page: &mut [u8; PAGE_SIZE]) {
        let start = self.offset as usize;
        page[start..start + self.bytes.len()].copy_from_slice(&self.bytes);
    }

    /// Whether the change stays inside a page.
    pub fn is_in_bounds(&self) -> bool {
        self.offset as usize + self.bytes.len() <= PAGE_SIZE
    }
}

/// New contents of part of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDeltaRecord {
    pub file_name: String,
    pub page_id: PageId,
    pub changes: Vec<PageChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDeletedRecord {
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEndRecord {
    pub operation_id: u64,
}

/// WAL record for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// LSN of the checkpoint.
    pub checkpoint_lsn: LSN,
}

/// Complete WAL record with header and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Record header.
    pub header: WalRecordHeader,
    /// Record payload.
    pub payload: WalRecordPayload,
}

/// WAL record payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecordPayload {
    OperationStart(OperationStartRecord),
    FileCreated(FileCreatedRecord),
    PageDelta(PageDeltaRecord),
    FileDeleted(FileDeletedRecord),
    OperationEnd(OperationEndRecord),
    Checkpoint(CheckpointRecord),
}

impl WalRecordPayload {
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::OperationStart(_) => WalRecordType::OperationStart,
            Self::FileCreated(_) => WalRecordType::FileCreated,
            Self::PageDelta(_) => WalRecordType::PageDelta,
            Self::FileDeleted(_) => WalRecordType::FileDeleted,
            Self::OperationEnd(_) => WalRecordType::OperationEnd,
            Self::Checkpoint(_) => WalRecordType::Checkpoint,
        }
    }
}

impl WalRecord {
    pub fn new(lsn: LSN, prev_lsn: LSN, operation_id: u64, payload: WalRecordPayload) -> Self {
        let header = WalRecordHeader {
            lsn,
            prev_lsn,
            operation_id,
            record_type: payload.record_type(),
            payload_size: bincode::serialized_size(&payload).unwrap_or(0) as u32,
        };
        WalRecord { header, payload }
    }

    pub fn operation_start(lsn: LSN, operation_id: u64) -> Self {
        Self::new(
            lsn,
            LSN::new(),
            operation_id,
            WalRecordPayload::OperationStart(OperationStartRecord { operation_id }),
        )
    }

    pub fn operation_end(lsn: LSN, prev_lsn: LSN, operation_id: u64) -> Self {
        Self::new(
            lsn,
            prev_lsn,
            operation_id,
            WalRecordPayload::OperationEnd(OperationEndRecord { operation_id }),
        )
    }

    pub fn page_delta(
        lsn: LSN,
        prev_lsn: LSN,
        operation_id: u64,
        file_name: &str,
        page_id: PageId,
        changes: Vec<PageChange>,
    ) -> Self {
        Self::new(
            lsn,
            prev_lsn,
            operation_id,
            WalRecordPayload::PageDelta(PageDeltaRecord {
                file_name: file_name.to_string(),
                page_id,
                changes,
            }),
        )
    }

    /// Checkpoint is not associated with an operation.
    pub fn checkpoint(lsn: LSN) -> Self {
        Self::new(
            lsn,
            LSN::new(),
            0,
            WalRecordPayload::Checkpoint(CheckpointRecord {
                checkpoint_lsn: lsn,
            }),
        )
    }

    /// Serialize the WAL record to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a WAL record from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
