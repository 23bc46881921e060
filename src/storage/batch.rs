//! Write batches: the unit of atomic commit.
//!
//! A batch holds puts and deletes for one logical operation. The writer
//! task assigns the batch a contiguous sequence range, appends its
//! serialized form to the WAL as one record, and replays it into the
//! memtable; readers only observe the batch after the shared last-sequence
//! advances past it, so they see all of it or none of it.
//!
//! # Serialized Layout
//!
//! ```text
//! +--------------+-----------+---------------------------------+
//! | sequence:u64 | count:u32 | entry 1 | entry 2 | ...         |
//! +--------------+-----------+---------------------------------+
//! ```
//!
//! Each entry is `kind:u8 || key_len:u32 || key || value_len:u32 || value`,
//! with the value omitted for deletes. Integers are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use super::dbformat::ValueKind;
use super::memtable::MemTable;
use crate::errcorrupt;
use crate::error::Result;

const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
    count: u32,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; HEADER_SIZE],
            count: 0,
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.rep.push(ValueKind::Put as u8);
        self.append_slice(key);
        self.append_slice(value);
        self.count += 1;
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.rep.push(ValueKind::Delete as u8);
        self.append_slice(key);
        self.count += 1;
    }

    fn append_slice(&mut self, slice: &[u8]) {
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, slice.len() as u32);
        self.rep.extend_from_slice(&len);
        self.rep.extend_from_slice(slice);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        LittleEndian::write_u64(&mut self.rep[0..8], sequence);
        LittleEndian::write_u32(&mut self.rep[8..12], self.count);
    }

    pub fn sequence(&self) -> u64 {
        LittleEndian::read_u64(&self.rep[0..8])
    }

    /// Serialized form for the WAL record.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Rebuilds a batch from a WAL record during recovery.
    pub fn from_contents(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < HEADER_SIZE {
            return errcorrupt!("write batch too short: {} bytes", contents.len());
        }
        let count = LittleEndian::read_u32(&contents[8..12]);
        let batch = Self {
            rep: contents,
            count,
        };
        // Validate the framing up front so replay fails loudly.
        batch.for_each(|_, _, _, _| ())?;
        Ok(batch)
    }

    /// Calls f(sequence, kind, key, value) for each entry. Entry i carries
    /// sequence base + i.
    pub fn for_each<F: FnMut(u64, ValueKind, &[u8], &[u8])>(&self, mut f: F) -> Result<()> {
        let base = self.sequence();
        let mut pos = HEADER_SIZE;
        for i in 0..self.count {
            let kind = ValueKind::from_u8(*self.rep.get(pos).ok_or_else(truncated)?)?;
            pos += 1;
            let (key, n) = read_slice(&self.rep, pos)?;
            pos = n;
            let (value, n) = match kind {
                ValueKind::Put => read_slice(&self.rep, pos)?,
                ValueKind::Delete => (&[] as &[u8], pos),
            };
            pos = n;
            f(base + i as u64, kind, key, value);
        }
        if pos != self.rep.len() {
            return errcorrupt!("write batch has trailing bytes");
        }
        Ok(())
    }

    /// Replays the batch into a memtable.
    pub fn apply_to(&self, memtable: &MemTable) -> Result<()> {
        self.for_each(|sequence, kind, key, value| {
            memtable.add(sequence, kind, key, value);
        })
    }
}

fn truncated() -> crate::Error {
    crate::Error::Corruption("write batch truncated".to_string())
}

fn read_slice(rep: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    if pos + 4 > rep.len() {
        return Err(truncated());
    }
    let len = LittleEndian::read_u32(&rep[pos..pos + 4]) as usize;
    let start = pos + 4;
    if start + len > rep.len() {
        return Err(truncated());
    }
    Ok((&rep[start..start + len], start + len))
}
