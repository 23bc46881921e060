//! Prefix-compressed key-value blocks, the unit of table storage.
//!
//! # Block Layout
//!
//! ```text
//! +---------------------------------------------------------+
//! | entry 1 | entry 2 | ... | entry N                       |
//! +---------------------------------------------------------+
//! | restart offsets (u32 x R) | restart count (u32)         |
//! +---------------------------------------------------------+
//! ```
//!
//! Each entry shares a prefix with its predecessor:
//!
//! ```text
//! +---------------+------------------+-----------------+----------+-------+
//! | shared:varint | non_shared:varint| value_len:varint| key tail | value |
//! +---------------+------------------+-----------------+----------+-------+
//! ```
//!
//! Prefix compression resets every `restart_interval` entries; the restart
//! offsets at the tail let a reader binary-search restart points and then
//! linear-scan a short run.
//!
//! Compression and the per-block checksum are applied by the table layer
//! when a finished block is written to the file.

use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::sync::Arc;

use super::dbformat::{get_varint32, put_varint32};
use super::iterator::Cursor;
use crate::errcorrupt;
use crate::error::Result;

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            restart_interval,
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter < self.restart_interval {
            shared_prefix_len(&self.last_key, key)
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, (key.len() - shared) as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished block contents.
    pub fn finish(mut self) -> Vec<u8> {
        for restart in &self.restarts {
            let mut word = [0u8; 4];
            LittleEndian::write_u32(&mut word, *restart);
            self.buffer.extend_from_slice(&word);
        }
        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, self.restarts.len() as u32);
        self.buffer.extend_from_slice(&count);
        self.buffer
    }

    /// Estimated size of the finished block.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A parsed, immutable block.
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
}

impl Block {
    pub fn new(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < 4 {
            return errcorrupt!("block too short: {} bytes", contents.len());
        }
        let count_offset = contents.len() - 4;
        let num_restarts = LittleEndian::read_u32(&contents[count_offset..]) as usize;
        if num_restarts == 0 {
            return errcorrupt!("block has no restart points");
        }

        let restarts_size = num_restarts
            .checked_mul(4)
            .filter(|size| *size <= count_offset)
            .ok_or_else(|| crate::Error::Corruption("block restart array overflow".to_string()))?;
        let restarts_offset = count_offset - restarts_size;

        let mut restarts = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let at = restarts_offset + i * 4;
            restarts.push(LittleEndian::read_u32(&contents[at..at + 4]));
        }

        Ok(Self {
            data: contents[..restarts_offset].to_vec(),
            restarts,
        })
    }

    pub fn cursor(
        self: &Arc<Self>,
        cmp: fn(&[u8], &[u8]) -> Ordering,
    ) -> BlockCursor {
        BlockCursor {
            block: Arc::clone(self),
            cmp,
            offset: 0,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            valid: false,
        }
    }
}

/// Cursor over one block's entries.
pub struct BlockCursor {
    block: Arc<Block>,
    cmp: fn(&[u8], &[u8]) -> Ordering,
    /// Offset of the next entry to parse.
    offset: usize,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    valid: bool,
}

impl BlockCursor {
    /// Parses the entry at `self.offset` into the current position.
    fn parse_next(&mut self) -> Result<()> {
        let data = &self.block.data;
        if self.offset >= data.len() {
            self.valid = false;
            return Ok(());
        }

        let mut pos = self.offset;
        let (shared, n) = get_varint32(&data[pos..])?;
        pos += n;
        let (non_shared, n) = get_varint32(&data[pos..])?;
        pos += n;
        let (value_len, n) = get_varint32(&data[pos..])?;
        pos += n;

        let shared = shared as usize;
        let non_shared = non_shared as usize;
        let value_len = value_len as usize;

        if shared > self.key.len() || pos + non_shared + value_len > data.len() {
            self.valid = false;
            return errcorrupt!("block entry out of bounds at offset {}", self.offset);
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[pos..pos + non_shared]);
        self.value_start = pos + non_shared;
        self.value_len = value_len;
        self.offset = self.value_start + value_len;
        self.valid = true;
        Ok(())
    }

    /// Repositions at a restart point, where keys have no shared prefix.
    fn seek_to_restart(&mut self, index: usize) {
        self.offset = self.block.restarts[index] as usize;
        self.key.clear();
        self.valid = false;
    }
}

impl Cursor for BlockCursor {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.seek_to_restart(0);
        self.parse_next()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search for the last restart whose key is < target.
        let mut left = 0usize;
        let mut right = self.block.restarts.len() - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            self.seek_to_restart(mid);
            self.parse_next()?;
            if self.valid && (self.cmp)(&self.key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Linear scan within the restart run.
        self.seek_to_restart(left);
        self.parse_next()?;
        while self.valid && (self.cmp)(&self.key, target) == Ordering::Less {
            self.parse_next()?;
        }
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if self.valid {
            self.parse_next()?;
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }
}
