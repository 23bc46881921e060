//! In-memory sorted table of internal keys, backed by a concurrent skip
//! list.
//!
//! The memtable is the first stop for every write and every read. Entries
//! are keyed by [`InternalKey`], so multiple versions of the same user key
//! coexist and sort newest-first; a lookup with a snapshot sequence lands on
//! the newest entry at or below that snapshot.
//!
//! `crossbeam_skiplist::SkipMap` supports any number of concurrent readers
//! against the single writer task without locks, which is what lets reads
//! run while the write path holds its own serialization.

use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::dbformat::{InternalKey, LookupKey, ValueKind};
use crate::error::Result;

/// Result of probing one memtable for a key.
#[derive(Debug, Clone, PartialEq)]
pub enum MemLookup {
    /// The newest visible entry is a put with this value.
    Found(Vec<u8>),
    /// The newest visible entry is a tombstone; stop probing older sources.
    Deleted,
    /// No visible entry; fall through to the next source.
    Missing,
}

pub struct MemTable {
    entries: SkipMap<InternalKey, Vec<u8>>,
    size: AtomicUsize,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            entries: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Inserts an entry. Tombstones carry an empty value.
    pub fn add(&self, sequence: u64, kind: ValueKind, user_key: &[u8], value: &[u8]) {
        let ikey = InternalKey::new(user_key.to_vec(), sequence, kind);
        // 8 bytes of trailer plus map overhead approximated per entry.
        let charge = user_key.len() + value.len() + 24;
        self.entries.insert(ikey, value.to_vec());
        self.size.fetch_add(charge, Ordering::Relaxed);
    }

    /// Finds the newest entry for the lookup key's user key at or below its
    /// snapshot sequence.
    pub fn get(&self, key: &LookupKey) -> Result<MemLookup> {
        let start = key.internal_key().clone();
        if let Some(entry) = self.entries.range(start..).next() {
            if entry.key().user_key() == key.user_key() {
                return Ok(match entry.key().kind()? {
                    ValueKind::Put => MemLookup::Found(entry.value().clone()),
                    ValueKind::Delete => MemLookup::Deleted,
                });
            }
        }
        Ok(MemLookup::Missing)
    }

    /// Approximate memory usage in bytes.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Smallest and largest internal keys, or None when empty.
    pub fn key_range(&self) -> Option<(InternalKey, InternalKey)> {
        let first = self.entries.front()?.key().clone();
        let last = self.entries.back()?.key().clone();
        Some((first, last))
    }

    /// Forward iterator over all entries in internal-key order.
    pub fn iter(self: &Arc<Self>) -> MemTableIter {
        MemTableIter {
            memtable: Arc::clone(self),
            position: IterPos::Start,
        }
    }
}

enum IterPos {
    Start,
    SeekTo(InternalKey),
    After(InternalKey),
    Done,
}

/// Lazy forward iterator. Re-seeks the skip list past the last yielded key
/// on every step, so it holds no skip-list guards across calls and stays
/// valid while the writer keeps inserting.
pub struct MemTableIter {
    memtable: Arc<MemTable>,
    position: IterPos,
}

impl MemTableIter {
    /// Repositions the iterator so the next entry yielded is the first
    /// entry >= target.
    pub fn seek(&mut self, target: &InternalKey) {
        self.position = IterPos::SeekTo(target.clone());
    }
}

impl Iterator for MemTableIter {
    type Item = (InternalKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        use std::ops::Bound;
        let entry = match &self.position {
            IterPos::Start => self.memtable.entries.iter().next(),
            IterPos::SeekTo(target) => self.memtable.entries.range(target.clone()..).next(),
            IterPos::After(last) => self
                .memtable
                .entries
                .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                .next(),
            IterPos::Done => None,
        };

        match entry {
            Some(entry) => {
                let key = entry.key().clone();
                let value = entry.value().clone();
                self.position = IterPos::After(key.clone());
                Some((key, value))
            }
            None => {
                self.position = IterPos::Done;
                None
            }
        }
    }
}

/// Cursor adapter over a memtable for merge composition.
pub struct MemCursor {
    iter: MemTableIter,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemCursor {
    pub fn new(memtable: &Arc<MemTable>) -> Self {
        Self {
            iter: memtable.iter(),
            current: None,
        }
    }

    fn pull(&mut self) {
        self.current = self.iter.next().map(|(key, value)| (key.encode(), value));
    }
}

impl super::iterator::Cursor for MemCursor {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.iter.seek(&InternalKey::new(Vec::new(), super::dbformat::MAX_SEQUENCE, ValueKind::Put));
        self.pull();
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let target = InternalKey::decode(target)?;
        self.iter.seek(&target);
        self.pull();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.pull();
        Ok(())
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("cursor not valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("cursor not valid").1
    }
}
