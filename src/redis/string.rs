//! String commands.
//!
//! A string lives in one row: `S{key}` -> `expiry_ms || payload`. TTL is
//! enforced lazily; a read that sees an expired header treats the key as
//! absent and leaves the row for the next overwrite or compaction.

use crate::errinput;
use crate::error::Result;
use crate::storage::WriteBatch;

use super::types::{
    decode_string_value, encode_string_value, hash_meta_key, now_millis, string_key,
    zset_meta_key,
};
use super::{RedisDb, RedisType};

/// SETBIT/GETBIT offsets are capped at 512MB worth of bits.
const MAX_BIT_OFFSET: u64 = 512 * 1024 * 1024 * 8;

impl RedisDb {
    /// SET: stores the value, replacing whatever the key held before,
    /// whatever its type.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();

        let mut batch = WriteBatch::new();
        self.clear_other_types(&mut batch, key, sequence, now)?;
        batch.put(&string_key(key), &encode_string_value(0, value));
        self.db.write(batch, &self.write_options)?;
        Ok(())
    }

    /// SET XX: overwrites only when the key already holds a live string.
    /// A TTL of 0 means no expiry. Returns true when the value was set.
    pub fn setxx(&self, key: &[u8], value: &[u8], ttl_ms: u64) -> Result<bool> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        if !self.string_live(key, sequence, now)? {
            return Ok(false);
        }
        let expiry = if ttl_ms == 0 { 0 } else { now + ttl_ms };
        let mut batch = WriteBatch::new();
        batch.put(&string_key(key), &encode_string_value(expiry, value));
        self.db.write(batch, &self.write_options)?;
        Ok(true)
    }

    /// GET: nil for missing or expired keys.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;
        self.read_string(key, sequence, now)
    }

    /// GETSET: swaps in the new value (clearing any TTL) and returns the
    /// old one.
    pub fn getset(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        let old = self.read_string(key, sequence, now)?;
        let mut batch = WriteBatch::new();
        batch.put(&string_key(key), &encode_string_value(0, value));
        self.db.write(batch, &self.write_options)?;
        Ok(old)
    }

    /// SETNX: stores only when the key does not exist as any type.
    /// Returns true when the value was set.
    pub fn setnx(&self, key: &[u8], value: &[u8], ttl_ms: u64) -> Result<bool> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();

        if self.exists_any(key, sequence, now)? {
            return Ok(false);
        }
        let expiry = if ttl_ms == 0 { 0 } else { now + ttl_ms };
        let mut batch = WriteBatch::new();
        batch.put(&string_key(key), &encode_string_value(expiry, value));
        self.db.write(batch, &self.write_options)?;
        Ok(true)
    }

    /// SETVX: compare-and-set. Returns 1 when the stored value matched and
    /// was replaced, 0 when the key is missing, -1 on a value mismatch.
    pub fn setvx(&self, key: &[u8], expected: &[u8], value: &[u8], ttl_ms: u64) -> Result<i32> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        match self.read_string(key, sequence, now)? {
            None => Ok(0),
            Some(current) if current != expected => Ok(-1),
            Some(_) => {
                let expiry = if ttl_ms == 0 { 0 } else { now + ttl_ms };
                let mut batch = WriteBatch::new();
                batch.put(&string_key(key), &encode_string_value(expiry, value));
                self.db.write(batch, &self.write_options)?;
                Ok(1)
            }
        }
    }

    /// DELVX: compare-and-delete with the same return convention as
    /// [`setvx`](Self::setvx).
    pub fn delvx(&self, key: &[u8], expected: &[u8]) -> Result<i32> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        match self.read_string(key, sequence, now)? {
            None => Ok(0),
            Some(current) if current != expected => Ok(-1),
            Some(_) => {
                let mut batch = WriteBatch::new();
                batch.delete(&string_key(key));
                self.db.write(batch, &self.write_options)?;
                Ok(1)
            }
        }
    }

    /// SETBIT: sets the bit at offset and returns the previous bit. The
    /// value grows zero-filled as needed; the TTL is preserved.
    pub fn setbit(&self, key: &[u8], offset: u64, bit: bool) -> Result<u8> {
        if offset >= MAX_BIT_OFFSET {
            return errinput!("bit offset {offset} out of range");
        }
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        let (expiry, mut payload) = self.read_string_with_expiry(key, sequence, now)?;
        let byte = (offset / 8) as usize;
        let mask = 1u8 << (7 - (offset % 8));
        if payload.len() <= byte {
            payload.resize(byte + 1, 0);
        }
        let old = u8::from(payload[byte] & mask != 0);
        if bit {
            payload[byte] |= mask;
        } else {
            payload[byte] &= !mask;
        }

        let mut batch = WriteBatch::new();
        batch.put(&string_key(key), &encode_string_value(expiry, &payload));
        self.db.write(batch, &self.write_options)?;
        Ok(old)
    }

    /// GETBIT: the bit at offset; out-of-range bits read as 0.
    pub fn getbit(&self, key: &[u8], offset: u64) -> Result<u8> {
        if offset >= MAX_BIT_OFFSET {
            return errinput!("bit offset {offset} out of range");
        }
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        let payload = self.read_string(key, sequence, now)?.unwrap_or_default();
        let byte = (offset / 8) as usize;
        if byte >= payload.len() {
            return Ok(0);
        }
        Ok(u8::from(payload[byte] & (1 << (7 - (offset % 8))) != 0))
    }

    /// SETRANGE: overwrites part of the value starting at offset, growing
    /// it zero-filled as needed. Returns the resulting length.
    pub fn setrange(&self, key: &[u8], offset: usize, data: &[u8]) -> Result<usize> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        let (expiry, mut payload) = self.read_string_with_expiry(key, sequence, now)?;
        if data.is_empty() {
            return Ok(payload.len());
        }
        if payload.len() < offset + data.len() {
            payload.resize(offset + data.len(), 0);
        }
        payload[offset..offset + data.len()].copy_from_slice(data);
        let len = payload.len();

        let mut batch = WriteBatch::new();
        batch.put(&string_key(key), &encode_string_value(expiry, &payload));
        self.db.write(batch, &self.write_options)?;
        Ok(len)
    }

    /// GETRANGE: inclusive byte range; negative offsets count from the
    /// end, as in Redis.
    pub fn getrange(&self, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;

        let payload = self.read_string(key, sequence, now)?.unwrap_or_default();
        let len = payload.len() as i64;
        if len == 0 {
            return Ok(Vec::new());
        }
        let start = if start < 0 { len + start } else { start }.max(0);
        let end = if end < 0 { len + end } else { end }.min(len - 1);
        if start > end {
            return Ok(Vec::new());
        }
        Ok(payload[start as usize..=end as usize].to_vec())
    }

    /// STRLEN: length of the live value, 0 when absent.
    pub fn strlen(&self, key: &[u8]) -> Result<usize> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Str, key, sequence, now)?;
        Ok(self.read_string(key, sequence, now)?.map_or(0, |v| v.len()))
    }

    /// MSET: stores every pair in one atomic batch.
    pub fn mset(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        if pairs.is_empty() {
            return errinput!("empty keys list");
        }
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();

        let mut batch = WriteBatch::new();
        for (key, value) in pairs {
            self.clear_other_types(&mut batch, key, sequence, now)?;
            batch.put(&string_key(key), &encode_string_value(0, value));
        }
        self.db.write(batch, &self.write_options)?;
        Ok(())
    }

    /// MGET: one value per key, nil for missing, expired, or wrong-typed
    /// keys.
    pub fn mget(&self, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return errinput!("empty keys list");
        }
        // A single snapshot sequence makes the multi-read consistent.
        let sequence = self.db.last_sequence();
        let now = now_millis();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.read_string(key, sequence, now)?);
        }
        Ok(out)
    }

    /// MSETNX: all-or-nothing. Fails without writing when any key already
    /// exists as any type.
    pub fn msetnx(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<bool> {
        if pairs.is_empty() {
            return errinput!("empty keys list");
        }
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();

        // Every existence check runs against the same snapshot before any
        // write goes out.
        for (key, _) in pairs {
            if self.exists_any(key, sequence, now)? {
                return Ok(false);
            }
        }

        let mut batch = WriteBatch::new();
        for (key, value) in pairs {
            batch.put(&string_key(key), &encode_string_value(0, value));
        }
        self.db.write(batch, &self.write_options)?;
        Ok(true)
    }

    // ---- Helpers ----

    /// Live payload, TTL applied.
    pub(crate) fn read_string(
        &self,
        key: &[u8],
        sequence: u64,
        now: u64,
    ) -> Result<Option<Vec<u8>>> {
        match self.db.get_at(&string_key(key), sequence)? {
            Some(value) => {
                let (expiry, payload) = decode_string_value(&value)?;
                if expiry > 0 && now >= expiry {
                    return Ok(None);
                }
                Ok(Some(payload.to_vec()))
            }
            None => Ok(None),
        }
    }

    /// (expiry, payload) for read-modify-write commands that must keep the
    /// TTL; absent and expired keys read as a fresh empty value.
    fn read_string_with_expiry(
        &self,
        key: &[u8],
        sequence: u64,
        now: u64,
    ) -> Result<(u64, Vec<u8>)> {
        match self.db.get_at(&string_key(key), sequence)? {
            Some(value) => {
                let (expiry, payload) = decode_string_value(&value)?;
                if expiry > 0 && now >= expiry {
                    return Ok((0, Vec::new()));
                }
                Ok((expiry, payload.to_vec()))
            }
            None => Ok((0, Vec::new())),
        }
    }

    /// True when the key holds a live value of any type.
    pub(crate) fn exists_any(&self, key: &[u8], sequence: u64, now: u64) -> Result<bool> {
        Ok(self.string_live(key, sequence, now)?
            || self.meta_live(RedisType::Hash, key, sequence, now)?.is_some()
            || self.meta_live(RedisType::Zset, key, sequence, now)?.is_some())
    }

    /// Queues deletes for live non-string values so a plain SET replaces
    /// the key whatever its previous type.
    fn clear_other_types(
        &self,
        batch: &mut WriteBatch,
        key: &[u8],
        sequence: u64,
        now: u64,
    ) -> Result<()> {
        if self.meta_live(RedisType::Hash, key, sequence, now)?.is_some() {
            batch.delete(&hash_meta_key(key));
        }
        if self.meta_live(RedisType::Zset, key, sequence, now)?.is_some() {
            batch.delete(&zset_meta_key(key));
        }
        Ok(())
    }
}
