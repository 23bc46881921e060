//! Redis data types encoded onto the ordered key-value engine.
//!
//! [`RedisDb`] is the surface the command handlers call. Each type codec
//! lives in its own module and extends `impl RedisDb`:
//!
//! - [`string`]: plain values with a TTL header
//! - [`hash`]: field/value maps behind a versioned meta row
//! - [`zset`]: sorted sets kept in two synchronized indexes
//!
//! Mutating commands serialize on one commands mutex so their
//! read-modify-write bodies are atomic, and every command's KV writes go
//! out in a single batch, so readers observe all of a command's effects or
//! none of them.

pub mod hash;
pub mod string;
pub mod types;
pub mod zset;

use std::path::Path;
use std::sync::Mutex;

use crate::config::{Options, WriteOptions};
use crate::errinput;
use crate::error::Result;
use crate::storage::db::Db;
use crate::storage::WriteBatch;
use crate::Error;

use types::{hash_meta_key, now_millis, string_key, zset_meta_key, Meta};

/// Aggregation applied by ZUNIONSTORE / ZINTERSTORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Min,
    Max,
}

/// Which Redis type an operation is about to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedisType {
    Str,
    Hash,
    Zset,
}

pub struct RedisDb {
    pub(crate) db: Db,
    /// Serializes mutating commands so read-modify-write bodies see a
    /// stable state. Plain reads bypass it.
    pub(crate) commands: Mutex<()>,
    pub(crate) write_options: WriteOptions,
}

impl RedisDb {
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<Self> {
        Ok(Self {
            db: Db::open(dir, options)?,
            commands: Mutex::new(()),
            write_options: WriteOptions::default(),
        })
    }

    /// The underlying engine, for maintenance operations (flush,
    /// compaction, stats, snapshots).
    pub fn engine(&self) -> &Db {
        &self.db
    }

    /// Removes the given keys whatever their type. Returns how many of
    /// them held a live value.
    pub fn del(&self, keys: &[&[u8]]) -> Result<u64> {
        if keys.is_empty() {
            return errinput!("empty keys list");
        }
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();

        let mut batch = WriteBatch::new();
        let mut removed = 0u64;
        for key in keys {
            let mut live = false;
            if self.string_live(key, sequence, now)? {
                batch.delete(&string_key(key));
                live = true;
            }
            if self.meta_live(RedisType::Hash, key, sequence, now)?.is_some() {
                batch.delete(&hash_meta_key(key));
                live = true;
            }
            if self.meta_live(RedisType::Zset, key, sequence, now)?.is_some() {
                batch.delete(&zset_meta_key(key));
                live = true;
            }
            if live {
                removed += 1;
            }
        }

        if !batch.is_empty() {
            self.db.write(batch, &self.write_options)?;
        }
        Ok(removed)
    }

    /// Sets a relative TTL in milliseconds on a live key of any type.
    /// Returns false when the key does not exist.
    pub fn expire(&self, key: &[u8], ttl_ms: u64) -> Result<bool> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        let expiry = if ttl_ms == 0 { 0 } else { now + ttl_ms };

        let mut batch = WriteBatch::new();
        if let Some(value) = self.db.get_at(&string_key(key), sequence)? {
            let (old_expiry, payload) = types::decode_string_value(&value)?;
            if old_expiry == 0 || now < old_expiry {
                batch.put(&string_key(key), &types::encode_string_value(expiry, payload));
            }
        }
        for (kind, meta_key) in [
            (RedisType::Hash, hash_meta_key(key)),
            (RedisType::Zset, zset_meta_key(key)),
        ] {
            if let Some(mut meta) = self.meta_live(kind, key, sequence, now)? {
                meta.ttl = expiry;
                batch.put(&meta_key, &meta.encode());
            }
        }

        if batch.is_empty() {
            return Ok(false);
        }
        self.db.write(batch, &self.write_options)?;
        Ok(true)
    }

    /// Clears any TTL on a live key. Returns false when the key does not
    /// exist or carries no TTL.
    pub fn persist(&self, key: &[u8]) -> Result<bool> {
        match self.ttl_millis(key)? {
            ttl if ttl > 0 => self.expire(key, 0),
            _ => Ok(false),
        }
    }

    /// Remaining TTL: -2 when the key does not exist, -1 when it has no
    /// expiry, otherwise milliseconds left.
    pub fn ttl_millis(&self, key: &[u8]) -> Result<i64> {
        let sequence = self.db.last_sequence();
        let now = now_millis();

        let mut expiry: Option<u64> = None;
        if let Some(value) = self.db.get_at(&string_key(key), sequence)? {
            let (e, _) = types::decode_string_value(&value)?;
            if e == 0 || now < e {
                expiry = Some(e);
            }
        }
        if expiry.is_none() {
            for kind in [RedisType::Hash, RedisType::Zset] {
                if let Some(meta) = self.meta_live(kind, key, sequence, now)? {
                    expiry = Some(meta.ttl);
                    break;
                }
            }
        }

        Ok(match expiry {
            None => -2,
            Some(0) => -1,
            Some(e) => (e - now) as i64,
        })
    }

    // ---- Shared liveness and type checks ----

    /// True if a live (non-expired) string exists at the key.
    pub(crate) fn string_live(&self, key: &[u8], sequence: u64, now: u64) -> Result<bool> {
        match self.db.get_at(&string_key(key), sequence)? {
            Some(value) => {
                let (expiry, _) = types::decode_string_value(&value)?;
                Ok(expiry == 0 || now < expiry)
            }
            None => Ok(false),
        }
    }

    /// The live meta row for a composite key, if any. Expired metas read
    /// as absent; their child rows are already unreachable.
    pub(crate) fn meta_live(
        &self,
        kind: RedisType,
        key: &[u8],
        sequence: u64,
        now: u64,
    ) -> Result<Option<Meta>> {
        let meta_key = match kind {
            RedisType::Hash => hash_meta_key(key),
            RedisType::Zset => zset_meta_key(key),
            RedisType::Str => return errinput!("strings have no meta row"),
        };
        match self.db.get_at(&meta_key, sequence)? {
            Some(value) => {
                let meta = Meta::decode(&value)?;
                Ok((!meta.is_expired(now)).then_some(meta))
            }
            None => Ok(None),
        }
    }

    /// Rejects an operation when the key holds a live value of a different
    /// type.
    pub(crate) fn check_type(
        &self,
        kind: RedisType,
        key: &[u8],
        sequence: u64,
        now: u64,
    ) -> Result<()> {
        let collision = match kind {
            RedisType::Str => {
                self.meta_live(RedisType::Hash, key, sequence, now)?.is_some()
                    || self.meta_live(RedisType::Zset, key, sequence, now)?.is_some()
            }
            RedisType::Hash => {
                self.string_live(key, sequence, now)?
                    || self.meta_live(RedisType::Zset, key, sequence, now)?.is_some()
            }
            RedisType::Zset => {
                self.string_live(key, sequence, now)?
                    || self.meta_live(RedisType::Hash, key, sequence, now)?.is_some()
            }
        };
        if collision {
            return Err(Error::TypeMismatch(format!(
                "key {:?} holds a value of another type",
                String::from_utf8_lossy(key)
            )));
        }
        Ok(())
    }

    /// Version stamp for a newly created composite key. The next write
    /// bumps the sequence past this, and sequences never repeat, so a
    /// recreated key can never collide with its orphaned child rows.
    pub(crate) fn next_version(&self) -> u64 {
        self.db.last_sequence() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_test_db(dir: &TempDir) -> RedisDb {
        let options = Options::default().create_if_missing(true);
        RedisDb::open(dir.path(), options).expect("Failed to open db")
    }

    #[test]
    fn test_del_across_types() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.set(b"str", b"value")?;
        db.hset(b"hash", b"f", b"v")?;
        db.zadd(b"zset", &[(1.0, b"m".to_vec())])?;

        assert_eq!(db.del(&[b"str", b"hash", b"zset", b"missing"])?, 3);
        assert_eq!(db.get(b"str")?, None);
        assert_eq!(db.hget(b"hash", b"f")?, None);
        assert_eq!(db.zscore(b"zset", b"m")?, None);

        // A second del finds nothing.
        assert_eq!(db.del(&[b"str", b"hash", b"zset"])?, 0);
        Ok(())
    }

    #[test]
    fn test_del_empty_keys_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);
        assert!(matches!(db.del(&[]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_type_collisions_rejected() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.hset(b"key", b"f", b"v")?;
        assert!(matches!(db.get(b"key"), Err(Error::TypeMismatch(_))));
        assert!(matches!(
            db.zadd(b"key", &[(1.0, b"m".to_vec())]),
            Err(Error::TypeMismatch(_))
        ));

        db.set(b"skey", b"v")?;
        assert!(matches!(db.hget(b"skey", b"f"), Err(Error::TypeMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_expire_and_ttl_on_composite() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.hset(b"h", b"f", b"v")?;
        assert_eq!(db.ttl_millis(b"h")?, -1);

        assert!(db.expire(b"h", 100_000)?);
        let remaining = db.ttl_millis(b"h")?;
        assert!(remaining > 0 && remaining <= 100_000);

        assert!(db.persist(b"h")?);
        assert_eq!(db.ttl_millis(b"h")?, -1);

        assert!(!db.expire(b"missing", 1000)?);
        assert_eq!(db.ttl_millis(b"missing")?, -2);
        Ok(())
    }

    #[test]
    fn test_expired_composite_reads_as_absent() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.hset(b"h", b"f", b"v")?;
        assert!(db.expire(b"h", 1)?);
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(db.hget(b"h", b"f")?, None);
        assert_eq!(db.hlen(b"h")?, 0);
        assert_eq!(db.ttl_millis(b"h")?, -2);

        // Recreating the key starts a fresh version; the old field rows
        // stay hidden.
        db.hset(b"h", b"other", b"x")?;
        assert_eq!(db.hget(b"h", b"f")?, None);
        assert_eq!(db.hget(b"h", b"other")?, Some(b"x".to_vec()));
        Ok(())
    }
}
