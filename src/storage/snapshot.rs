//! Snapshots pin reads to a sequence number.
//!
//! The database tracks every active snapshot sequence; compaction consults
//! the smallest one to decide which overwritten entries are safe to drop.
//! Dropping a [`Snapshot`] unregisters it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Refcounted multiset of active snapshot sequences.
#[derive(Default)]
pub(crate) struct SnapshotList {
    inner: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotList {
    pub(crate) fn register(&self, sequence: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.entry(sequence).or_insert(0) += 1;
    }

    pub(crate) fn unregister(&self, sequence: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                inner.remove(&sequence);
            }
        }
    }

    /// Oldest sequence any reader may still need, or `default` when no
    /// snapshot is active.
    pub(crate) fn smallest(&self, default: u64) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .keys()
            .next()
            .copied()
            .unwrap_or(default)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// A frozen point in time. Reads through a snapshot observe exactly the
/// writes with sequence <= its sequence.
pub struct Snapshot {
    sequence: u64,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    pub(crate) fn new(sequence: u64, list: Arc<SnapshotList>) -> Self {
        list.register(sequence);
        Self { sequence, list }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.unregister(self.sequence);
    }
}
