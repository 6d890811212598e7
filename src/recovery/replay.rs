//! Redo-only recovery from the write-ahead log.
//!
//! Commits log an operation before applying it, and nothing staged ever
//! reaches the page cache before that, so recovery needs no undo phase:
//! 1. Analysis: split the log into operation units, keeping the complete ones
//! 2. Redo: apply complete units in log order

use std::collections::HashMap;
use std::fmt;

use log::{debug, warn};

use crate::storage::buffer::BufferPoolManager;
use crate::storage::error::StorageResult;
use crate::storage::page::{FileId, PageKey};
use crate::storage::paginated::{apply_page_delta, remove_file_named};
use crate::storage::wal::{WalManager, WalRecord, WalRecordPayload, LSN};

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryStats {
    pub records_analyzed: usize,
    pub records_redone: usize,
    /// Page deltas of files a later operation deleted.
    pub records_skipped: usize,
    pub operations_replayed: usize,
    /// Units without an end record: the commit was cut short by a crash.
    pub operations_discarded: usize,
    pub recovery_end_lsn: LSN,
}

impl fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} record(s) analyzed, {} operation(s) replayed ({} record(s) redone, {} skipped), {} incomplete operation(s) discarded, log ends at {}",
            self.records_analyzed,
            self.operations_replayed,
            self.records_redone,
            self.records_skipped,
            self.operations_discarded,
            self.recovery_end_lsn
        )
    }
}

/// Replays the WAL into the data files.
pub struct WalReplay<'a> {
    wal: &'a WalManager,
    buffer_pool: &'a BufferPoolManager,
}

impl<'a> WalReplay<'a> {
    pub fn new(wal: &'a WalManager, buffer_pool: &'a BufferPoolManager) -> Self {
        Self { wal, buffer_pool }
    }

    /// Perform recovery. Replayed pages are written back and the files
    /// recovery opened are closed again.
    pub fn recover(&self) -> StorageResult<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let records = self.wal.read_all_records()?;

        // Phase 1: Analysis
        let units = self.analysis_phase(&records, &mut stats);

        // Phase 2: Redo
        self.redo_phase(&units, &mut stats)?;

        stats.recovery_end_lsn = self.wal.get_current_lsn();
        Ok(stats)
    }

    /// Groups the log into complete operation units.
    ///
    /// A unit is written in one piece, so any record that breaks the
    /// start..end sequence ends the pending unit as incomplete.
    fn analysis_phase<'r>(
        &self,
        records: &'r [WalRecord],
        stats: &mut RecoveryStats,
    ) -> Vec<Vec<&'r WalRecord>> {
        let mut units = Vec::new();
        let mut pending: Option<(u64, Vec<&'r WalRecord>)> = None;

        for record in records {
            stats.records_analyzed += 1;
            let operation_id = record.header.operation_id;

            match &record.payload {
                WalRecordPayload::OperationStart(_) => {
                    if let Some((incomplete, _)) = pending.take() {
                        self.discard(incomplete, stats);
                    }
                    pending = Some((operation_id, Vec::new()));
                }
                WalRecordPayload::OperationEnd(_) => match pending.take() {
                    Some((id, unit)) if id == operation_id => units.push(unit),
                    Some((incomplete, _)) => self.discard(incomplete, stats),
                    None => {}
                },
                WalRecordPayload::Checkpoint(_) => {
                    if let Some((incomplete, _)) = pending.take() {
                        self.discard(incomplete, stats);
                    }
                }
                _ => {
                    let belongs = matches!(&pending, Some((id, _)) if *id == operation_id);
                    if belongs {
                        if let Some((_, unit)) = &mut pending {
                            unit.push(record);
                        }
                    } else if let Some((incomplete, _)) = pending.take() {
                        self.discard(incomplete, stats);
                    }
                }
            }
        }

        if let Some((incomplete, _)) = pending {
            self.discard(incomplete, stats);
        }
        units
    }

    fn discard(&self, operation_id: u64, stats: &mut RecoveryStats) {
        warn!("discarding incomplete operation {} found in the WAL", operation_id);
        stats.operations_discarded += 1;
    }

    fn redo_phase(&self, units: &[Vec<&WalRecord>], stats: &mut RecoveryStats) -> StorageResult<()> {
        let namespace = self.buffer_pool.namespace();
        let mut opened: HashMap<String, FileId> = HashMap::new();

        for unit in units {
            for record in unit {
                match &record.payload {
                    WalRecordPayload::FileCreated(created) => {
                        if !namespace.exists(&created.file_name) {
                            let file_id = namespace.book_file_id();
                            namespace.create_file(file_id, &created.file_name)?;
                            opened.insert(created.file_name.clone(), file_id);
                        }
                        stats.records_redone += 1;
                    }
                    WalRecordPayload::PageDelta(delta) => {
                        if !namespace.exists(&delta.file_name) {
                            stats.records_skipped += 1;
                            continue;
                        }
                        let file_id = match opened.get(&delta.file_name) {
                            Some(file_id) => *file_id,
                            None => {
                                let file_id = namespace.open_file(&delta.file_name)?;
                                opened.insert(delta.file_name.clone(), file_id);
                                file_id
                            }
                        };
                        apply_page_delta(
                            self.buffer_pool,
                            PageKey::new(file_id, delta.page_id),
                            &delta.changes,
                        )?;
                        stats.records_redone += 1;
                    }
                    WalRecordPayload::FileDeleted(deleted) => {
                        opened.remove(&deleted.file_name);
                        remove_file_named(self.buffer_pool, &deleted.file_name)?;
                        stats.records_redone += 1;
                    }
                    _ => {}
                }
            }
            stats.operations_replayed += 1;
        }

        self.buffer_pool.flush_all()?;
        for (name, file_id) in opened {
            self.buffer_pool.discard_file(file_id);
            namespace.close_file(file_id)?;
            debug!("recovery closed {}", name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::disk::FileNamespace;
    use crate::storage::wal::{
        FileCreatedRecord, FileDeletedRecord, OperationEndRecord, OperationStartRecord,
        PageChange, PageDeltaRecord, WalConfig,
    };
    use crate::storage::{PageId, PAGE_SIZE};
    use anyhow::Result;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        wal: WalManager,
        buffer_pool: BufferPoolManager,
        dir: TempDir,
    }

    fn fixture() -> Result<Fixture> {
        let dir = tempdir()?;
        let wal = WalManager::open(WalConfig {
            wal_dir: dir.path().join("wal"),
            max_file_size: 1024 * 1024,
            sync_on_commit: false,
        })?;
        let namespace = Arc::new(FileNamespace::new(dir.path())?);
        let buffer_pool = BufferPoolManager::new(namespace, Box::new(LruReplacer::new(8)), 8);
        Ok(Fixture {
            wal,
            buffer_pool,
            dir,
        })
    }

    fn start(operation_id: u64) -> WalRecordPayload {
        WalRecordPayload::OperationStart(OperationStartRecord { operation_id })
    }

    fn end(operation_id: u64) -> WalRecordPayload {
        WalRecordPayload::OperationEnd(OperationEndRecord { operation_id })
    }

    fn created(name: &str) -> WalRecordPayload {
        WalRecordPayload::FileCreated(FileCreatedRecord {
            file_name: name.to_string(),
        })
    }

    fn delta(name: &str, page: u32, offset: u16, value: u8) -> WalRecordPayload {
        WalRecordPayload::PageDelta(PageDeltaRecord {
            file_name: name.to_string(),
            page_id: PageId(page),
            changes: vec![PageChange {
                offset,
                bytes: vec![value],
            }],
        })
    }

    fn read_byte(path: &std::path::Path, page: usize, offset: usize) -> Result<u8> {
        let bytes = std::fs::read(path)?;
        Ok(bytes[page * PAGE_SIZE + offset])
    }

    #[test]
    fn test_empty_recovery() -> Result<()> {
        let f = fixture()?;
        let stats = WalReplay::new(&f.wal, &f.buffer_pool).recover()?;

        assert_eq!(stats.records_analyzed, 0);
        assert_eq!(stats.operations_replayed, 0);
        assert_eq!(stats.operations_discarded, 0);
        Ok(())
    }

    #[test]
    fn test_replays_complete_units() -> Result<()> {
        let f = fixture()?;
        f.wal.log_operation(
            1,
            vec![start(1), created("a.vpm"), delta("a.vpm", 1, 16, 9), end(1)],
        )?;

        let stats = WalReplay::new(&f.wal, &f.buffer_pool).recover()?;
        assert_eq!(stats.operations_replayed, 1);
        assert_eq!(stats.records_redone, 2);

        let path = f.dir.path().join("a.vpm");
        assert_eq!(std::fs::metadata(&path)?.len(), 2 * PAGE_SIZE as u64);
        assert_eq!(read_byte(&path, 1, 16)?, 9);
        // Recovery leaves no file open
        assert_eq!(f.buffer_pool.namespace().file_id("a.vpm"), None);
        Ok(())
    }

    #[test]
    fn test_discards_incomplete_unit() -> Result<()> {
        let f = fixture()?;
        f.wal
            .log_operation(1, vec![start(1), created("a.vpm"), end(1)])?;
        f.wal
            .log_operation(2, vec![start(2), delta("a.vpm", 0, 16, 9)])?;

        let stats = WalReplay::new(&f.wal, &f.buffer_pool).recover()?;
        assert_eq!(stats.operations_replayed, 1);
        assert_eq!(stats.operations_discarded, 1);
        assert_eq!(std::fs::metadata(f.dir.path().join("a.vpm"))?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_replay_is_idempotent() -> Result<()> {
        let f = fixture()?;
        f.wal.log_operation(
            1,
            vec![start(1), created("a.vpm"), delta("a.vpm", 0, 20, 4), end(1)],
        )?;

        WalReplay::new(&f.wal, &f.buffer_pool).recover()?;
        WalReplay::new(&f.wal, &f.buffer_pool).recover()?;

        let path = f.dir.path().join("a.vpm");
        assert_eq!(std::fs::metadata(&path)?.len(), PAGE_SIZE as u64);
        assert_eq!(read_byte(&path, 0, 20)?, 4);
        Ok(())
    }

    #[test]
    fn test_replays_deletion() -> Result<()> {
        let f = fixture()?;
        f.wal.log_operation(
            1,
            vec![start(1), created("a.vpm"), delta("a.vpm", 0, 20, 4), end(1)],
        )?;
        f.wal.log_operation(
            2,
            vec![
                start(2),
                WalRecordPayload::FileDeleted(FileDeletedRecord {
                    file_name: "a.vpm".to_string(),
                }),
                end(2),
            ],
        )?;

        let stats = WalReplay::new(&f.wal, &f.buffer_pool).recover()?;
        assert_eq!(stats.operations_replayed, 2);
        assert!(!f.dir.path().join("a.vpm").exists());
        Ok(())
    }

    #[test]
    fn test_delta_of_missing_file_is_skipped() -> Result<()> {
        let f = fixture()?;
        f.wal
            .log_operation(1, vec![start(1), delta("gone.vpm", 0, 20, 4), end(1)])?;

        let stats = WalReplay::new(&f.wal, &f.buffer_pool).recover()?;
        assert_eq!(stats.records_skipped, 1);
        assert_eq!(stats.records_redone, 0);
        assert!(!f.dir.path().join("gone.vpm").exists());
        Ok(())
    }
}
