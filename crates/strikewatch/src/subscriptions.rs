//! Bounded subscription set with least-recently-used eviction.
//!
//! Entries are indexed twice: by tile for membership, and by an access
//! sequence number for ordering. Touching or evicting an entry is a map
//! update on each index, so neither needs a scan.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::tiles::Tile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub tile: Tile,
    pub last_access_ms: i64,
    seq: u64,
}

/// Tiles added and removed by a single [`SubscriptionSet::cover`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub added: Vec<Tile>,
    pub evicted: Vec<Tile>,
    pub refreshed: usize,
}

impl SubscriptionChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.evicted.is_empty()
    }
}

#[derive(Debug)]
pub struct SubscriptionSet {
    entries: HashMap<Tile, SubscriptionEntry>,
    by_access: BTreeMap<u64, Tile>,
    next_seq: u64,
    /// Latest access time handed out; keeps access order and time order aligned.
    latest_ms: i64,
    max_subscriptions: usize,
}

impl SubscriptionSet {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_access: BTreeMap::new(),
            next_seq: 0,
            latest_ms: i64::MIN,
            max_subscriptions: max_subscriptions.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tile: &str) -> bool {
        self.entries.contains_key(tile)
    }

    pub fn get(&self, tile: &str) -> Option<&SubscriptionEntry> {
        self.entries.get(tile)
    }

    /// Subscribed tiles, least recently used first.
    pub fn tiles(&self) -> Vec<Tile> {
        self.by_access.values().cloned().collect()
    }

    fn stamp(&mut self, now_ms: i64) -> (u64, i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.latest_ms = self.latest_ms.max(now_ms);
        (seq, self.latest_ms)
    }

    /// Refresh a tile's access time. Returns false if it is not subscribed.
    pub fn touch(&mut self, tile: &str, now_ms: i64) -> bool {
        if !self.entries.contains_key(tile) {
            return false;
        }
        let (seq, at) = self.stamp(now_ms);
        if let Some(entry) = self.entries.get_mut(tile) {
            self.by_access.remove(&entry.seq);
            entry.seq = seq;
            entry.last_access_ms = at;
            self.by_access.insert(seq, entry.tile.clone());
        }
        true
    }

    fn insert(&mut self, tile: Tile, now_ms: i64) {
        let (seq, at) = self.stamp(now_ms);
        self.by_access.insert(seq, tile.clone());
        self.entries.insert(
            tile.clone(),
            SubscriptionEntry {
                tile,
                last_access_ms: at,
                seq,
            },
        );
    }

    pub fn remove(&mut self, tile: &str) -> Option<SubscriptionEntry> {
        let entry = self.entries.remove(tile)?;
        self.by_access.remove(&entry.seq);
        Some(entry)
    }

    /// Make `required` the most recently used tiles, adding missing ones.
    ///
    /// When the new tiles would overflow the budget, the least recently used
    /// tiles outside `required` are evicted first. Tiles already subscribed
    /// only have their access time refreshed.
    pub fn cover(&mut self, required: &BTreeSet<Tile>, now_ms: i64) -> SubscriptionChange {
        let mut change = SubscriptionChange::default();

        let mut missing: Vec<&Tile> = required.iter().filter(|t| !self.contains(t)).collect();
        if missing.len() > self.max_subscriptions {
            log::warn!(
                "Coverage needs {} tiles but budget is {}, truncating",
                missing.len(),
                self.max_subscriptions
            );
            missing.truncate(self.max_subscriptions);
        }

        let overflow = (self.entries.len() + missing.len()).saturating_sub(self.max_subscriptions);
        if overflow > 0 {
            let victims: Vec<Tile> = self
                .by_access
                .values()
                .filter(|t| !required.contains(*t))
                .take(overflow)
                .cloned()
                .collect();
            for tile in victims {
                self.remove(&tile);
                change.evicted.push(tile);
            }
        }

        let room = self.max_subscriptions.saturating_sub(self.entries.len());
        missing.truncate(room);

        for tile in required {
            if self.touch(tile, now_ms) {
                change.refreshed += 1;
            }
        }
        for tile in missing {
            self.insert(tile.clone(), now_ms);
            change.added.push(tile.clone());
        }

        change
    }

    /// Remove every entry last accessed before `cutoff_ms`, oldest first.
    pub fn prune_stale(&mut self, cutoff_ms: i64) -> Vec<Tile> {
        let stale: Vec<Tile> = self
            .by_access
            .values()
            .take_while(|t| {
                self.entries
                    .get(*t)
                    .is_some_and(|e| e.last_access_ms < cutoff_ms)
            })
            .cloned()
            .collect();

        for tile in &stale {
            self.remove(tile);
        }
        stale
    }

    /// Remove everything, returning the tiles that were subscribed.
    pub fn clear(&mut self) -> Vec<Tile> {
        let tiles = self.tiles();
        self.entries.clear();
        self.by_access.clear();
        tiles
    }
}
