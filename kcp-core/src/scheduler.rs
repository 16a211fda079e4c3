//! One-shot timer queue for connection ticks.
//!
//! Each key holds at most one live deadline. Re-arming or cancelling bumps the key's
//! generation; stale heap entries are skipped when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

struct Entry<K> {
    at: Instant,
    generation: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.generation == other.generation
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    // min-heap on (at, generation)
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

pub struct TimerQueue<K> {
    heap: BinaryHeap<Entry<K>>,
    armed: HashMap<K, u64>,
    next_generation: u64,
}

impl<K: Copy + Eq + Hash> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `key` to fire at `at`, replacing any earlier deadline for it.
    pub fn schedule(&mut self, key: K, at: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.armed.insert(key, generation);
        self.heap.push(Entry {
            at,
            generation,
            key,
        });
    }

    pub fn cancel(&mut self, key: &K) {
        self.armed.remove(key);
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    /// Number of armed keys.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    fn is_live(&self, entry: &Entry<K>) -> bool {
        self.armed.get(&entry.key) == Some(&entry.generation)
    }

    fn drop_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.heap.peek().map(|e| e.at)
    }

    /// Pop one key whose deadline is at or before `now`. The key is disarmed.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        self.drop_stale();
        let top = self.heap.peek()?;
        if top.at > now {
            return None;
        }
        let entry = self.heap.pop()?;
        self.armed.remove(&entry.key);
        Some(entry.key)
    }
}

impl<K: Copy + Eq + Hash> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(1u32, base + Duration::from_millis(30));
        q.schedule(2u32, base + Duration::from_millis(10));
        q.schedule(3u32, base + Duration::from_millis(20));
        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(10)));
        let now = base + Duration::from_millis(25);
        assert_eq!(q.pop_due(now), Some(2));
        assert_eq!(q.pop_due(now), Some(3));
        assert_eq!(q.pop_due(now), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn reschedule_replaces_previous_deadline() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(7u32, base + Duration::from_millis(5));
        q.schedule(7u32, base + Duration::from_millis(50));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_due(base + Duration::from_millis(10)), None);
        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(50)));
        assert_eq!(q.pop_due(base + Duration::from_millis(50)), Some(7));
        assert!(!q.is_armed(&7));
    }

    #[test]
    fn cancelled_keys_never_fire() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(1u32, base);
        q.cancel(&1);
        assert_eq!(q.next_deadline(), None);
        assert_eq!(q.pop_due(base + Duration::from_secs(1)), None);
        assert!(q.is_empty());
    }
}
