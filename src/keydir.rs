//! The in-memory key index: a map from key bytes to a pointer into the log,
//! plus the monotonic version counter that orders writes across restarts.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::logfile::FileId;

/// A pointer to one record in the log: which file, where in it, how big
/// the value is, and the version that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_id: FileId,
    pub value_sz: u32,
    pub value_pos: i64,
    pub version: u64,
}

#[derive(Debug)]
struct Inner {
    map: HashMap<Vec<u8>, IndexEntry>,
    version: u64,
}

/// Thread-safe key index. A single `RwLock` guards both the map and the
/// version counter together, so raising the counter during a `put` can
/// never race with another thread observing a stale value.
#[derive(Debug)]
pub struct KeyDir {
    inner: RwLock<Inner>,
}

impl KeyDir {
    pub fn new() -> Self {
        KeyDir { inner: RwLock::new(Inner { map: HashMap::new(), version: 0 }) }
    }

    /// Allocates and returns the next version. Every put or delete consumes
    /// exactly one.
    pub fn next_version(&self) -> u64 {
        let mut inner = self.inner.write().expect("keydir lock poisoned");
        inner.version += 1;
        inner.version
    }

    pub fn get(&self, key: &[u8]) -> Option<IndexEntry> {
        let inner = self.inner.read().expect("keydir lock poisoned");
        inner.map.get(key).copied()
    }

    /// Upserts `key` to `entry`, raising the version counter to at least
    /// `entry.version` so that a file which was written after the process's
    /// own counter was last observed (e.g. during recovery replay) cannot
    /// cause a subsequent `next_version()` to regress. Never compares
    /// versions between the existing and new entry: the caller is
    /// responsible for presenting entries in an order where later calls
    /// win (see `DESIGN.md`).
    ///
    /// Returns `true` if the key was not previously present.
    pub fn put(&self, key: impl Into<Vec<u8>>, entry: IndexEntry) -> bool {
        let mut inner = self.inner.write().expect("keydir lock poisoned");
        if entry.version > inner.version {
            inner.version = entry.version;
        }
        inner.map.insert(key.into(), entry).is_none()
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn del(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.write().expect("keydir lock poisoned");
        inner.map.remove(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read().expect("keydir lock poisoned");
        inner.map.is_empty()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("keydir lock poisoned");
        inner.map.len()
    }

    /// Visits every `(key, entry)` pair currently in the index. Stops early
    /// if `callback` returns `false`. Each key present at the start of the
    /// traversal is visited at most once.
    pub fn traverse(&self, mut callback: impl FnMut(&[u8], &IndexEntry) -> bool) -> bool {
        let inner = self.inner.read().expect("keydir lock poisoned");
        for (key, entry) in inner.map.iter() {
            if !callback(key, entry) {
                return false;
            }
        }
        true
    }

    /// Runs `f` against the entry for `key` under a single write-lock
    /// critical section, so a caller (merge) can relocate the underlying
    /// record and update its index entry atomically. Returns `true` if the
    /// key was present. This is the Rust expression of the source design's
    /// `get_mutable` pinned-reference-plus-guard pattern, adapted to safe
    /// borrowing: the closure receives `&mut IndexEntry` instead of a
    /// escaping pointer.
    pub fn with_mut_entry(&self, key: &[u8], f: impl FnOnce(&mut IndexEntry)) -> bool {
        let mut inner = self.inner.write().expect("keydir lock poisoned");
        match inner.map.get_mut(key) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }
}

impl Default for KeyDir {
    fn default() -> Self {
        Self::new()
    }
}
