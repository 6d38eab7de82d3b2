//! Deadline queue with lazy invalidation

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::clock::MonoTime;

/// Min-heap of deadlines keyed by `K`.
///
/// Rescheduling a key pushes a new entry and bumps its generation; entries
/// whose generation no longer matches are skipped when popped.
pub struct DeadlineQueue<K: Copy + Ord + std::hash::Hash> {
    heap: BinaryHeap<Reverse<(MonoTime, K, u64)>>,
    /// Current generation per key
    current: HashMap<K, u64>,
    generation: u64,
}

impl<K: Copy + Ord + std::hash::Hash> DeadlineQueue<K> {
    pub fn new() -> Self {
        DeadlineQueue {
            heap: BinaryHeap::new(),
            current: HashMap::new(),
            generation: 0,
        }
    }

    /// Schedule `key` at `at`, superseding any earlier schedule for it
    pub fn schedule(&mut self, key: K, at: MonoTime) {
        self.generation += 1;
        self.current.insert(key, self.generation);
        self.heap.push(Reverse((at, key, self.generation)));
    }

    /// Stop tracking `key`
    pub fn remove(&mut self, key: &K) {
        self.current.remove(key);
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, key, generation))) = self.heap.peek() {
            if self.current.get(key) == Some(generation) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Earliest scheduled deadline
    pub fn peek(&mut self) -> Option<MonoTime> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Pop the earliest key if its deadline is at or before `now`
    pub fn pop_due(&mut self, now: MonoTime) -> Option<(K, MonoTime)> {
        self.discard_stale();
        match self.heap.peek() {
            Some(Reverse((at, _, _))) if *at <= now => {}
            _ => return None,
        }
        let Reverse((at, key, _)) = self.heap.pop()?;
        self.current.remove(&key);
        Some((key, at))
    }

    /// Number of keys currently scheduled
    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Rebuild the heap without stale entries
    pub fn compact(&mut self) {
        let current = &self.current;
        let live: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse((_, key, generation))| current.get(key) == Some(generation))
            .collect();
        self.heap = live.into_iter().collect();
    }

    /// Entries held by the heap, including stale ones
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }
}

impl<K: Copy + Ord + std::hash::Hash> Default for DeadlineQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_deadline_order() {
        let mut queue = DeadlineQueue::new();
        queue.schedule("b", MonoTime(20));
        queue.schedule("a", MonoTime(10));
        queue.schedule("c", MonoTime(30));

        assert_eq!(queue.peek(), Some(MonoTime(10)));
        assert_eq!(queue.pop_due(MonoTime(25)), Some(("a", MonoTime(10))));
        assert_eq!(queue.pop_due(MonoTime(25)), Some(("b", MonoTime(20))));
        assert_eq!(queue.pop_due(MonoTime(25)), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reschedule_supersedes() {
        let mut queue = DeadlineQueue::new();
        queue.schedule("a", MonoTime(100));
        queue.schedule("a", MonoTime(40));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_due(MonoTime(50)), Some(("a", MonoTime(40))));
        // The superseded entry at 100 never fires
        assert_eq!(queue.pop_due(MonoTime(1_000)), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_removed_keys_are_skipped() {
        let mut queue = DeadlineQueue::new();
        queue.schedule(1u8, MonoTime(5));
        queue.schedule(2u8, MonoTime(6));
        queue.remove(&1);

        assert_eq!(queue.peek(), Some(MonoTime(6)));
        assert_eq!(queue.pop_due(MonoTime(10)), Some((2, MonoTime(6))));
    }

    #[test]
    fn test_compact_drops_stale_entries() {
        let mut queue = DeadlineQueue::new();
        for t in 0..10 {
            queue.schedule(7u8, MonoTime(100 - t));
        }
        assert_eq!(queue.heap_len(), 10);
        queue.compact();
        assert_eq!(queue.heap_len(), 1);
        assert_eq!(queue.peek(), Some(MonoTime(91)));
    }
}
