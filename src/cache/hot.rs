//! In-memory HOT tier: a bounded LRU map.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
struct HotEntry {
    value: Vec<u8>,
    stamp: u64,
}

/// Least-recently-used map with an adjustable capacity.
///
/// Recency is a monotonically increasing stamp; `order` maps stamp → key so
/// the oldest entry is always the first in the tree.
#[derive(Debug)]
pub(crate) struct HotTier {
    capacity: usize,
    entries: HashMap<String, HotEntry>,
    order: BTreeMap<u64, String>,
    clock: u64,
}

impl HotTier {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.stamp);
        entry.stamp = stamp;
        self.order.insert(stamp, key.to_string());
        Some(entry.value.clone())
    }

    /// Insert or replace. Returns the number of entries evicted to make room.
    pub(crate) fn insert(&mut self, key: &str, value: Vec<u8>) -> usize {
        let stamp = self.tick();
        if let Some(old) = self.entries.insert(key.to_string(), HotEntry { value, stamp }) {
            self.order.remove(&old.stamp);
        }
        self.order.insert(stamp, key.to_string());
        self.evict_excess()
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.stamp);
                true
            }
            None => false,
        }
    }

    /// Change the capacity, evicting least-recently-used entries if it shrank.
    pub(crate) fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity;
        self.evict_excess()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_excess(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted += 1;
        }
        evicted
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
