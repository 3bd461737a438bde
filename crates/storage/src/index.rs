//! In-memory key index.
//!
//! Maps each key to the file location of its latest entry. The index is
//! authoritative for the latest version of a key; the log is authoritative
//! for durability and recovery.

use std::collections::HashMap;

/// Location and metadata of a key's latest entry in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the entry in the data file.
    pub offset: u64,
    /// Value size in bytes.
    pub size: u32,
    /// Timestamp recorded in the entry.
    pub timestamp: i64,
    /// Tombstone marker.
    pub is_deleted: bool,
}

/// Hash map from key to [`IndexEntry`], with live/tombstone counters.
#[derive(Debug, Default)]
pub struct Index {
    entries: HashMap<Vec<u8>, IndexEntry>,
    active: usize,
    deleted: usize,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<IndexEntry> {
        self.entries.get(key).copied()
    }

    /// Record a live entry for `key`, replacing any prior entry
    /// unconditionally. The caller is responsible for not recording a
    /// stale timestamp over a fresher one.
    pub fn put(&mut self, key: Vec<u8>, offset: u64, size: u32, timestamp: i64) {
        let entry = IndexEntry {
            offset,
            size,
            timestamp,
            is_deleted: false,
        };
        match self.entries.insert(key, entry) {
            None => self.active += 1,
            Some(prev) if prev.is_deleted => {
                self.deleted -= 1;
                self.active += 1;
            }
            Some(_) => {}
        }
    }

    /// Flip `key` to a tombstone at `timestamp`. If the key is unknown a
    /// bare tombstone entry is created so the deletion still orders
    /// against later writes.
    pub fn delete(&mut self, key: Vec<u8>, offset: u64, timestamp: i64) {
        let entry = IndexEntry {
            offset,
            size: 0,
            timestamp,
            is_deleted: true,
        };
        match self.entries.insert(key, entry) {
            None => self.deleted += 1,
            Some(prev) if !prev.is_deleted => {
                self.active -= 1;
                self.deleted += 1;
            }
            Some(_) => {}
        }
    }

    /// Whether `key` exists and is not tombstoned.
    pub fn has(&self, key: &[u8]) -> bool {
        self.entries.get(key).is_some_and(|e| !e.is_deleted)
    }

    /// All live keys.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_deleted)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted
    }

    /// Total entries including tombstones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of all entries, for compaction.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, IndexEntry)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect()
    }
}
