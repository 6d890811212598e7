//! WAL manager implementation.
//!
//! The WAL manager handles writing log records to disk, managing the WAL buffer,
//! and ensuring durability through proper flushing.
//!
//! On-disk framing of a record: `[len: u32][crc32: u32][bincode bytes]`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use super::record::{WalRecord, WalRecordPayload, LSN};
use crate::storage::error::{StorageError, StorageResult};

/// Size of the WAL buffer in bytes (1MB).
const WAL_BUFFER_SIZE: usize = 1024 * 1024;

/// Length and checksum prefix of every record.
const FRAME_HEADER_SIZE: usize = 8;

/// WAL file prefix.
const WAL_FILE_PREFIX: &str = "wal_";

/// WAL file extension.
const WAL_FILE_EXTENSION: &str = ".log";

/// WAL manager configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory where WAL files are stored.
    pub wal_dir: PathBuf,
    /// Maximum size of a single WAL file in bytes.
    pub max_file_size: u64,
    /// Whether to sync WAL to disk on every commit.
    pub sync_on_commit: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            wal_dir: PathBuf::from("wal"),
            max_file_size: 64 * 1024 * 1024, // 64MB
            sync_on_commit: true,
        }
    }
}

/// WAL buffer for batching writes.
struct WalBuffer {
    data: Vec<u8>,
}

impl WalBuffer {
    fn new() -> Self {
        WalBuffer {
            data: Vec::with_capacity(WAL_BUFFER_SIZE),
        }
    }

    fn write(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    fn contents(&self) -> &[u8] {
        &self.data
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// WAL file handle.
struct WalFile {
    file: BufWriter<File>,
    size: u64,
}

impl WalFile {
    fn create(path: PathBuf) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;

        Ok(WalFile {
            file: BufWriter::new(file),
            size: 0,
        })
    }

    fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.get_mut().sync_all()?;
        Ok(())
    }
}

struct WalWriter {
    buffer: WalBuffer,
    current_file: WalFile,
    /// Sequence number of `current_file`.
    file_seq: u64,
}

/// WAL manager for handling write-ahead logging.
pub struct WalManager {
    config: WalConfig,
    /// Last LSN handed out.
    current_lsn: RwLock<LSN>,
    /// All records up to this LSN have been flushed to disk.
    flush_lsn: RwLock<LSN>,
    writer: Mutex<WalWriter>,
}

impl WalManager {
    /// Opens the WAL in `config.wal_dir`, creating the directory if needed.
    ///
    /// Existing WAL files are kept for [`WalManager::read_all_records`]; new
    /// records go to a fresh file whose sequence follows the last one found.
    pub fn open(config: WalConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.wal_dir)?;

        let existing = Self::list_wal_files(&config.wal_dir)?;
        let mut last_lsn = LSN::new();
        for path in &existing {
            if let Some(record) = Self::read_records_from_file(path)?.last() {
                last_lsn = last_lsn.max(record.header.lsn);
            }
        }
        let file_seq = existing
            .last()
            .and_then(|path| Self::file_seq(path))
            .map_or(1, |seq| seq + 1);
        let current_file = WalFile::create(Self::wal_file_path(&config.wal_dir, file_seq))?;
        debug!(
            "WAL opened in {} ({} existing file(s), last {})",
            config.wal_dir.display(),
            existing.len(),
            last_lsn
        );

        Ok(WalManager {
            config,
            current_lsn: RwLock::new(last_lsn),
            flush_lsn: RwLock::new(last_lsn),
            writer: Mutex::new(WalWriter {
                buffer: WalBuffer::new(),
                current_file,
                file_seq,
            }),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Get the next LSN.
    pub fn get_next_lsn(&self) -> LSN {
        let mut lsn = self.current_lsn.write();
        let next_lsn = lsn.next();
        *lsn = next_lsn;
        next_lsn
    }

    /// Get the current LSN.
    pub fn get_current_lsn(&self) -> LSN {
        *self.current_lsn.read()
    }

    /// Get the flush LSN.
    pub fn get_flush_lsn(&self) -> LSN {
        *self.flush_lsn.read()
    }

    /// Write a WAL record into the buffer.
    pub fn write_record(&self, record: &WalRecord) -> StorageResult<LSN> {
        let framed = Self::frame(record)?;
        let mut writer = self.writer.lock();
        self.buffer_frame(&mut writer, &framed)?;
        Ok(record.header.lsn)
    }

    /// Logs the records of one atomic operation back to back, chaining their
    /// `prev_lsn`, and flushes them. Returns the LSN of the last record.
    pub fn log_operation(
        &self,
        operation_id: u64,
        payloads: Vec<WalRecordPayload>,
    ) -> StorageResult<LSN> {
        let mut writer = self.writer.lock();
        let mut prev_lsn = LSN::new();

        for payload in payloads {
            let lsn = self.get_next_lsn();
            let record = WalRecord::new(lsn, prev_lsn, operation_id, payload);
            let framed = Self::frame(&record)?;
            self.buffer_frame(&mut writer, &framed)?;
            prev_lsn = lsn;
        }

        self.flush_writer(&mut writer)?;
        Ok(prev_lsn)
    }

    /// Flush the WAL buffer to disk.
    pub fn flush(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        self.flush_writer(&mut writer)
    }

    /// Removes every WAL file and starts a new one holding a single
    /// checkpoint record. Only safe once all logged changes are on disk.
    pub fn truncate(&self) -> StorageResult<LSN> {
        let mut writer = self.writer.lock();
        self.flush_buffer(&mut writer)?;

        let next_seq = writer.file_seq + 1;
        writer.current_file = WalFile::create(self.wal_path(next_seq))?;
        writer.file_seq = next_seq;

        for path in self.get_wal_files()? {
            if Self::file_seq(&path) != Some(next_seq) {
                std::fs::remove_file(&path)?;
            }
        }

        let lsn = self.get_next_lsn();
        let framed = Self::frame(&WalRecord::checkpoint(lsn))?;
        self.buffer_frame(&mut writer, &framed)?;
        self.flush_writer(&mut writer)?;
        debug!("WAL truncated at {}", lsn);

        Ok(lsn)
    }

    /// Reads every record of every WAL file, oldest file first.
    pub fn read_all_records(&self) -> StorageResult<Vec<WalRecord>> {
        self.flush()?;
        let mut records = Vec::new();
        for path in self.get_wal_files()? {
            records.extend(Self::read_records_from_file(&path)?);
        }
        Ok(records)
    }

    /// Read WAL records from a file.
    ///
    /// Reading stops at the first truncated or corrupt frame: that is the torn
    /// tail of a write interrupted by a crash.
    pub fn read_records_from_file(path: &Path) -> StorageResult<Vec<WalRecord>> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            if pos + FRAME_HEADER_SIZE > data.len() {
                warn!("{}: truncated WAL frame header at offset {}", path.display(), pos);
                break;
            }
            let size = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                as usize;
            let crc = u32::from_le_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]);
            let start = pos + FRAME_HEADER_SIZE;
            if start + size > data.len() {
                warn!("{}: truncated WAL record at offset {}", path.display(), pos);
                break;
            }
            let body = &data[start..start + size];
            if crc32fast::hash(body) != crc {
                warn!("{}: WAL checksum mismatch at offset {}", path.display(), pos);
                break;
            }
            let record = WalRecord::deserialize(body)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            records.push(record);
            pos = start + size;
        }

        Ok(records)
    }

    /// Get all WAL files in the WAL directory, oldest first.
    pub fn get_wal_files(&self) -> StorageResult<Vec<PathBuf>> {
        Self::list_wal_files(&self.config.wal_dir)
    }

    fn list_wal_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if Self::file_seq(&path).is_some() {
                files.push(path);
            }
        }

        // Sequence numbers are zero-padded, so name order is log order
        files.sort();

        Ok(files)
    }

    fn file_seq(path: &Path) -> Option<u64> {
        path.file_name()?
            .to_str()?
            .strip_prefix(WAL_FILE_PREFIX)?
            .strip_suffix(WAL_FILE_EXTENSION)?
            .parse()
            .ok()
    }

    fn wal_file_path(dir: &Path, seq: u64) -> PathBuf {
        dir.join(format!("{}{:020}{}", WAL_FILE_PREFIX, seq, WAL_FILE_EXTENSION))
    }

    fn wal_path(&self, seq: u64) -> PathBuf {
        Self::wal_file_path(&self.config.wal_dir, seq)
    }

    fn frame(record: &WalRecord) -> StorageResult<Vec<u8>> {
        let serialized = record
            .serialize()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut framed = Vec::with_capacity(FRAME_HEADER_SIZE + serialized.len());
        framed.extend_from_slice(&(serialized.len() as u32).to_le_bytes());
        framed.extend_from_slice(&crc32fast::hash(&serialized).to_le_bytes());
        framed.extend_from_slice(&serialized);
        Ok(framed)
    }

    fn buffer_frame(&self, writer: &mut WalWriter, framed: &[u8]) -> StorageResult<()> {
        // If adding this record would exceed buffer size, flush first
        if writer.buffer.len() + framed.len() > WAL_BUFFER_SIZE {
            self.flush_buffer(writer)?;
        }
        writer.buffer.write(framed);
        Ok(())
    }

    fn flush_writer(&self, writer: &mut WalWriter) -> StorageResult<()> {
        self.flush_buffer(writer)?;

        // Sync to disk if configured
        if self.config.sync_on_commit {
            writer.current_file.sync()?;
        }

        Ok(())
    }

    /// Flush the buffer to the current WAL file.
    fn flush_buffer(&self, writer: &mut WalWriter) -> StorageResult<()> {
        if writer.buffer.is_empty() {
            return Ok(());
        }

        // Check if we need to rotate the file
        if writer.current_file.size > 0
            && writer.current_file.size + writer.buffer.len() as u64 > self.config.max_file_size
        {
            writer.current_file.flush()?;
            writer.current_file.sync()?;

            let next_seq = writer.file_seq + 1;
            writer.current_file = WalFile::create(self.wal_path(next_seq))?;
            writer.file_seq = next_seq;
        }

        let WalWriter {
            buffer,
            current_file,
            ..
        } = writer;
        current_file.write(buffer.contents())?;
        current_file.flush()?;

        *self.flush_lsn.write() = self.get_current_lsn();

        buffer.clear();

        Ok(())
    }
}
