//! Cursor composition for scans and compaction.
//!
//! Every sorted source (memtable, block, table, level) exposes the same
//! small capability surface, and composition is algebraic: a merge over N
//! cursors is itself a cursor. Compaction consumes the merged internal
//! entries directly; user-facing scans wrap the merge in a collapsing
//! adapter that applies snapshot visibility and tombstones.

use std::cmp::Ordering;

use super::dbformat::{self, extract_sequence, extract_user_key, ValueKind};
use crate::error::Result;

/// A positioned cursor over encoded internal keys in sorted order.
///
/// After a successful `seek`/`seek_to_first`/`next`, `valid()` reports
/// whether the cursor is positioned on an entry; `key()` and `value()` may
/// only be called while valid.
pub trait Cursor: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self) -> Result<()>;
    /// Positions at the first entry >= target (an encoded internal key).
    fn seek(&mut self, target: &[u8]) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    /// Encoded internal key of the current entry.
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

/// Merges N cursors into one sorted stream. The smallest key wins each
/// step; ties cannot occur because internal keys carry unique sequences.
/// With few children a linear scan beats heap bookkeeping.
pub struct MergeCursor {
    children: Vec<Box<dyn Cursor>>,
    current: Option<usize>,
}

impl MergeCursor {
    pub fn new(children: Vec<Box<dyn Cursor>>) -> Self {
        Self {
            children,
            current: None,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if dbformat::internal_compare(child.key(), self.children[s].key())
                        == Ordering::Less
                    {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }
}

impl Cursor for MergeCursor {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.find_smallest();
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek(target)?;
        }
        self.find_smallest();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some(current) = self.current {
            self.children[current].next()?;
            self.find_smallest();
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("cursor not valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("cursor not valid")].value()
    }
}

/// Collapses a merged internal-entry stream into user-visible pairs at a
/// snapshot: entries newer than the snapshot are invisible, only the newest
/// visible entry per user key counts, and tombstones hide their key.
pub struct UserIterator {
    cursor: MergeCursor,
    sequence: u64,
    last_user_key: Option<Vec<u8>>,
    done: bool,
}

impl UserIterator {
    /// Starts iteration at the first user key >= start_user_key.
    pub fn new(mut cursor: MergeCursor, start_user_key: &[u8], sequence: u64) -> Result<Self> {
        let lookup = dbformat::LookupKey::new(start_user_key, sequence);
        cursor.seek(&lookup.encode())?;
        Ok(Self {
            cursor,
            sequence,
            last_user_key: None,
            done: false,
        })
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while self.cursor.valid() {
            let key = self.cursor.key();
            let sequence = extract_sequence(key);
            let user_key = extract_user_key(key);

            if sequence > self.sequence {
                // Written after our snapshot.
                self.cursor.next()?;
                continue;
            }
            if self.last_user_key.as_deref() == Some(user_key) {
                // An older version of a user key we already resolved.
                self.cursor.next()?;
                continue;
            }

            self.last_user_key = Some(user_key.to_vec());
            let kind = ValueKind::from_u8(key[key.len() - 8])?;
            match kind {
                ValueKind::Put => {
                    let pair = (user_key.to_vec(), self.cursor.value().to_vec());
                    self.cursor.next()?;
                    return Ok(Some(pair));
                }
                ValueKind::Delete => {
                    self.cursor.next()?;
                    continue;
                }
            }
        }
        Ok(None)
    }
}

impl Iterator for UserIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A cursor over an in-memory list of (encoded key, value) pairs. Used by
/// tests and as the seam for sources materialized up front.
pub struct VecCursor {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    index: usize,
}

impl VecCursor {
    /// Entries must already be sorted by internal key.
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let index = entries.len();
        Self { entries, index }
    }
}

impl Cursor for VecCursor {
    fn valid(&self) -> bool {
        self.index < self.entries.len()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.index = 0;
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.index = self
            .entries
            .partition_point(|(k, _)| dbformat::internal_compare(k, target) == Ordering::Less);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if self.index < self.entries.len() {
            self.index += 1;
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.index].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.index].1
    }
}
