//! Locks held by atomic operations until they commit or roll back.
//!
//! Staging a page copy only gives an operation a private snapshot; two
//! operations staging the same page would each commit a change computed from
//! the same base. Every lock here is exclusive and stays with its operation
//! until the operation finishes, so the next holder always stages from the
//! committed result of the previous one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageKey};
use crate::transaction::OperationId;

/// How long an operation waits for a lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifier for a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockId {
    /// A file name, taken by operations creating or deleting it.
    File(String),
    /// The right to append pages to a file.
    Growth(FileId),
    /// A page some operation is changing.
    Page(PageKey),
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::File(name) => write!(f, "file {}", name),
            LockId::Growth(file_id) => write!(f, "growth of {}", file_id),
            LockId::Page(key) => write!(f, "page {}", key),
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    holders: HashMap<LockId, OperationId>,
    held: HashMap<OperationId, HashSet<LockId>>,
    /// Wait-for graph: an operation waits for at most one holder at a time.
    waits_for: HashMap<OperationId, OperationId>,
}

impl LockTable {
    /// Whether `holder` is, transitively, waiting for `waiter`.
    fn would_cause_deadlock(&self, waiter: OperationId, holder: OperationId) -> bool {
        let mut current = holder;
        for _ in 0..=self.waits_for.len() {
            if current == waiter {
                return true;
            }
            match self.waits_for.get(&current) {
                Some(next) => current = *next,
                None => return false,
            }
        }
        false
    }

    fn grant(&mut self, op: OperationId, lock_id: LockId) {
        self.waits_for.remove(&op);
        self.held.entry(op).or_default().insert(lock_id.clone());
        self.holders.insert(lock_id, op);
    }
}

pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Takes `lock_id` for `op`, waiting while another operation holds it.
    /// Taking a lock the operation already holds is a no-op.
    ///
    /// Fails with `Deadlock` if the holder is waiting for `op`, and with
    /// `LockTimeout` once the configured timeout has passed.
    pub fn acquire(&self, op: OperationId, lock_id: LockId) -> StorageResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();

        loop {
            let holder = match table.holders.get(&lock_id) {
                None => {
                    table.grant(op, lock_id);
                    return Ok(());
                }
                Some(holder) if *holder == op => return Ok(()),
                Some(holder) => *holder,
            };

            if table.would_cause_deadlock(op, holder) {
                table.waits_for.remove(&op);
                warn!("{} would deadlock on {} held by {}", op, lock_id, holder);
                return Err(StorageError::Deadlock {
                    operation: op,
                    lock: lock_id,
                    holder,
                });
            }

            table.waits_for.insert(op, holder);
            debug!("{} waits for {} held by {}", op, lock_id, holder);
            if self.released.wait_until(&mut table, deadline).timed_out()
                && table.holders.contains_key(&lock_id)
            {
                table.waits_for.remove(&op);
                return Err(StorageError::LockTimeout {
                    operation: op,
                    lock: lock_id,
                });
            }
        }
    }

    /// Releases every lock `op` holds and wakes up waiting operations.
    pub fn release_all(&self, op: OperationId) {
        let mut table = self.table.lock();
        table.waits_for.remove(&op);
        if let Some(locks) = table.held.remove(&op) {
            for lock_id in &locks {
                table.holders.remove(lock_id);
            }
            drop(table);
            self.released.notify_all();
        }
    }

    /// Locks currently held by `op`.
    pub fn held_by(&self, op: OperationId) -> Vec<LockId> {
        self.table
            .lock()
            .held
            .get(&op)
            .map(|locks| locks.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_locked(&self, lock_id: &LockId) -> bool {
        self.table.lock().holders.contains_key(lock_id)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}
