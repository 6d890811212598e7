//! Atomic operation ID generation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique identifier for an atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Op{}", self.0)
    }
}

/// A thread-safe operation ID generator.
pub struct OperationIdGenerator {
    next_id: AtomicU64,
}

impl OperationIdGenerator {
    /// Creates a new generator starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> OperationId {
        OperationId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns the last generated ID, 0 if none was generated yet.
    pub fn current(&self) -> OperationId {
        let id = self.next_id.load(Ordering::SeqCst);
        OperationId::new(id.saturating_sub(1))
    }
}

impl Default for OperationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_operation_id_display() {
        let id = OperationId::new(123);
        assert_eq!(format!("{}", id), "Op123");
        assert_eq!(id.value(), 123);
    }

    #[test]
    fn test_generator_sequence() {
        let generator = OperationIdGenerator::new();
        assert_eq!(generator.current().value(), 0);

        assert_eq!(generator.next().value(), 1);
        assert_eq!(generator.next().value(), 2);
        assert_eq!(generator.current().value(), 2);
    }

    #[test]
    fn test_generator_thread_safety() {
        let generator = Arc::new(OperationIdGenerator::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&generator);
                thread::spawn(move || (0..100).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }
        let total = all_ids.len();
        all_ids.sort();
        all_ids.dedup();

        assert_eq!(total, 800);
        assert_eq!(all_ids.len(), 800);
    }
}
