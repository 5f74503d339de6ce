// vim: tw=80
use crate::types::*;
use metrohash::MetroBuildHasher;
use std::{
    collections::HashMap,
    fmt::{self, Debug},
};
use tracing::{Level, event};

struct LruEntry {
    location: DataLocation,
    /// Key of the next less recently used entry
    lru: Option<RecordName>,
    /// Key of the next more recently used entry
    mru: Option<RecordName>,
}

impl Debug for LruEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LruEntry {{ lru: {:?}, mru: {:?} }}", self.lru, self.mru)
    }
}

/// Record-name index with least-recently-used replacement.
#[derive(Debug)]
pub struct LruIndex {
    /// Capacity in records
    capacity: usize,
    /// Key of the least recently used entry
    lru: Option<RecordName>,
    /// Key of the most recently used entry
    mru: Option<RecordName>,
    store: HashMap<RecordName, LruEntry, MetroBuildHasher>,
}

impl LruIndex {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn expire(&mut self) {
        if let Some(key) = self.lru {
            self.remove(&key);
        }
    }

    /// Look up a record, making it the most recently used.
    pub fn get(&mut self, key: &RecordName) -> Option<DataLocation> {
        let location = self.store.get(key)?.location;
        if self.mru != Some(*key) {
            self.unlink(key);
            self.link_mru(*key);
        }
        Some(location)
    }

    /// Insert or replace a record, making it the most recently used.
    pub fn insert(&mut self, key: RecordName, location: DataLocation) {
        if let Some(entry) = self.store.get_mut(&key) {
            if entry.location != location {
                event!(Level::DEBUG, %key, ?location, "index_advice_replaced");
            }
            entry.location = location;
            self.get(&key);
            return;
        }
        while self.store.len() >= self.capacity {
            self.expire();
        }
        let entry = LruEntry { location, lru: None, mru: None };
        self.store.insert(key, entry);
        self.link_mru(key);
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Make a detached entry the MRU
    fn link_mru(&mut self, key: RecordName) {
        let old_mru = self.mru;
        if let Some(entry) = self.store.get_mut(&key) {
            entry.lru = old_mru;
            entry.mru = None;
        }
        if let Some(old) = old_mru.and_then(|k| self.store.get_mut(&k)) {
            debug_assert!(old.mru.is_none());
            old.mru = Some(key);
        }
        self.mru = Some(key);
        if self.lru.is_none() {
            self.lru = Some(key);
        }
    }

    pub fn remove(&mut self, key: &RecordName) -> Option<DataLocation> {
        self.unlink(key);
        self.store.remove(key).map(|v| v.location)
    }

    /// Detach an entry from the recency list, leaving it in the store
    fn unlink(&mut self, key: &RecordName) {
        let Some(entry) = self.store.get(key) else { return };
        let (v_lru, v_mru) = (entry.lru, entry.mru);
        match v_mru {
            Some(m) => {
                if let Some(e) = self.store.get_mut(&m) {
                    e.lru = v_lru;
                }
            }
            None => {
                debug_assert_eq!(self.mru, Some(*key));
                self.mru = v_lru;
            }
        }
        match v_lru {
            Some(l) => {
                if let Some(e) = self.store.get_mut(&l) {
                    e.mru = v_mru;
                }
            }
            None => {
                debug_assert_eq!(self.lru, Some(*key));
                self.lru = v_mru;
            }
        }
    }

    /// An index of at most `capacity` records.  It always holds at least
    /// one.
    pub fn with_capacity(capacity: usize) -> Self {
        let store = HashMap::with_hasher(MetroBuildHasher::default());
        LruIndex{capacity: capacity.max(1), lru: None, mru: None, store}
    }
}

// LCOV_EXCL_STOP
