//! Short-term memory: a bounded ring of recent event descriptions.
//!
//! The sequencer appends each Normal draft's text after using it, and the
//! prompt builder injects the whole ring as the "recent events" section.
//! Nothing here is persisted.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Fixed-capacity ring; appending past capacity drops the oldest entry.
pub struct MemoryRing {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl MemoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, entry: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.into());
    }

    /// Oldest-first snapshot of the ring.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_within_capacity_keeps_everything() {
        let ring = MemoryRing::new(3);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.snapshot(), vec!["a", "b"]);
    }

    #[test]
    fn push_past_capacity_drops_oldest() {
        let ring = MemoryRing::new(3);
        for s in ["a", "b", "c", "d", "e"] {
            ring.push(s);
        }
        assert_eq!(ring.snapshot(), vec!["c", "d", "e"]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        let ring = MemoryRing::new(0);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.snapshot(), vec!["b"]);
        assert_eq!(ring.capacity(), 1);
    }
}
