//! Rolling strike buffer
//!
//! Deduplicated by [`StrikeKey`], bounded by a hard entry ceiling and aged
//! out by event time.

use std::collections::{HashMap, VecDeque};

use crate::strike::{StrikeEvent, StrikeKey};

/// Result of a single insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New strike stored; `evicted` older entries were dropped to make room.
    Inserted { evicted: usize },
    /// Strike was already buffered.
    Duplicate,
}

#[derive(Debug)]
pub struct StrikeBuffer {
    entries: HashMap<StrikeKey, StrikeEvent>,
    /// Keys in insertion order, oldest first.
    order: VecDeque<StrikeKey>,
    max_size: usize,
}

impl StrikeBuffer {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped per eviction round: 10% of capacity, at least one.
    fn eviction_batch(&self) -> usize {
        (self.max_size / 10).max(1)
    }

    pub fn insert(&mut self, strike: StrikeEvent) -> InsertOutcome {
        let key = strike.key();
        if self.entries.contains_key(&key) {
            return InsertOutcome::Duplicate;
        }

        let mut evicted = 0;
        if self.entries.len() >= self.max_size {
            evicted = self.evict_oldest(self.eviction_batch());
        }

        self.entries.insert(key, strike);
        self.order.push_back(key);
        InsertOutcome::Inserted { evicted }
    }

    fn evict_oldest(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop every strike older than `cutoff_ms`. Returns the number removed.
    pub fn remove_older_than(&mut self, cutoff_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, strike| strike.time_ms() >= cutoff_ms);
        let removed = before - self.entries.len();
        if removed > 0 {
            let entries = &self.entries;
            self.order.retain(|key| entries.contains_key(key));
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &StrikeEvent> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
