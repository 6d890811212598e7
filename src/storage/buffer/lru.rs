use super::replacer::{FrameId, Replacer};
use std::collections::{BTreeMap, HashMap};

/// Evicts the frame that was unpinned longest ago.
#[derive(Debug)]
pub struct LruReplacer {
    /// Evictable frames ordered by the tick at which they were unpinned
    queue: BTreeMap<u64, FrameId>,
    /// Unpin tick of every evictable frame
    ticks: HashMap<FrameId, u64>,
    next_tick: u64,
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: BTreeMap::new(),
            ticks: HashMap::with_capacity(max_size),
            next_tick: 0,
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        let (_, frame_id) = self.queue.pop_first()?;
        self.ticks.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some(tick) = self.ticks.remove(&frame_id) {
            self.queue.remove(&tick);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.ticks.contains_key(&frame_id) || self.ticks.len() >= self.max_size {
            return;
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.queue.insert(tick, frame_id);
        self.ticks.insert(frame_id, tick);
    }

    fn size(&self) -> usize {
        self.ticks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_in_unpin_order() {
        let mut replacer = LruReplacer::new(3);

        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_pin_removes_candidate() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);

        // Re-unpinned frames go to the back of the queue
        replacer.unpin(1);
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_duplicate_unpin_and_capacity() {
        let mut replacer = LruReplacer::new(2);

        replacer.unpin(1);
        replacer.unpin(1);
        assert_eq!(replacer.size(), 1);

        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 2);

        replacer.pin(999);
        replacer.remove(2);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_repin_moves_frame_to_back() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        replacer.pin(1);
        replacer.unpin(1);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
    }
}
