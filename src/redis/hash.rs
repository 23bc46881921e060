//! Hash commands.
//!
//! A hash spans two keyspaces: the meta row `H{key}` holding
//! `(count, version, ttl)`, and one field row per entry under
//! `h{key_len}{key}{version}{field}`. A field row is live only while the
//! meta row is live and carries the same version; deleting the key just
//! tombstones the meta row, and the orphaned field rows wait for
//! compaction.

use std::collections::HashMap;

use crate::errinput;
use crate::error::Result;
use crate::storage::WriteBatch;

use super::types::{hash_field_key, hash_field_prefix, hash_meta_key, now_millis, Meta};
use super::{RedisDb, RedisType};

impl RedisDb {
    /// HSET: stores one field. Returns true when the field was new.
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        self.hmset(key, &[(field.to_vec(), value.to_vec())])
            .map(|added| added > 0)
    }

    /// HMSET: stores several fields in one atomic batch. Returns how many
    /// of them were new.
    pub fn hmset(&self, key: &[u8], fvs: &[(Vec<u8>, Vec<u8>)]) -> Result<u32> {
        if fvs.is_empty() {
            return errinput!("empty fields list");
        }
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Hash, key, sequence, now)?;

        let mut meta = match self.meta_live(RedisType::Hash, key, sequence, now)? {
            Some(meta) => meta,
            None => Meta::new(self.next_version()),
        };

        // Later occurrences of a field win, and count each field once.
        let mut deduped: HashMap<&[u8], &[u8]> = HashMap::new();
        for (field, value) in fvs {
            deduped.insert(field, value);
        }

        let mut batch = WriteBatch::new();
        let mut added = 0u32;
        for (field, value) in deduped {
            let row_key = hash_field_key(key, meta.version, field);
            if meta.count == 0 || self.db.get_at(&row_key, sequence)?.is_none() {
                added += 1;
            }
            batch.put(&row_key, value);
        }
        meta.count += added;
        batch.put(&hash_meta_key(key), &meta.encode());

        self.db.write(batch, &self.write_options)?;
        Ok(added)
    }

    /// HGET: nil when the key or field does not exist.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Hash, key, sequence, now)?;

        let meta = match self.meta_live(RedisType::Hash, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        self.db.get_at(&hash_field_key(key, meta.version, field), sequence)
    }

    /// HMGET: one value per requested field, nil for absent fields.
    pub fn hmget(&self, key: &[u8], fields: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return errinput!("empty fields list");
        }
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Hash, key, sequence, now)?;

        let meta = self.meta_live(RedisType::Hash, key, sequence, now)?;
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            out.push(match &meta {
                Some(meta) => {
                    self.db
                        .get_at(&hash_field_key(key, meta.version, field), sequence)?
                }
                None => None,
            });
        }
        Ok(out)
    }

    /// HGETALL: every live (field, value) pair, in field byte order.
    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Hash, key, sequence, now)?;

        let meta = match self.meta_live(RedisType::Hash, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(Vec::new()),
        };

        let prefix = hash_field_prefix(key, meta.version);
        let mut out = Vec::with_capacity(meta.count as usize);
        for item in self.db.scan_at(&prefix, sequence)? {
            let (row_key, value) = item?;
            if !row_key.starts_with(&prefix) {
                break;
            }
            out.push((row_key[prefix.len()..].to_vec(), value));
        }
        Ok(out)
    }

    /// HLEN: the meta row's cardinality, 0 when the key is absent.
    pub fn hlen(&self, key: &[u8]) -> Result<usize> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Hash, key, sequence, now)?;
        Ok(self
            .meta_live(RedisType::Hash, key, sequence, now)?
            .map_or(0, |meta| meta.count as usize))
    }

    /// HEXISTS: true when the field is present.
    pub fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool> {
        Ok(self.hget(key, field)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::tmpfs::TempDir;

    fn open_test_db(dir: &TempDir) -> RedisDb {
        let options = Options::default().create_if_missing(true);
        RedisDb::open(dir.path(), options).expect("Failed to open db")
    }

    #[test]
    fn test_hash_lifecycle() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        // New field, then overwrite.
        assert!(db.hset(b"H", b"f1", b"v1")?);
        assert!(!db.hset(b"H", b"f1", b"v2")?);
        assert_eq!(db.hget(b"H", b"f1")?, Some(b"v2".to_vec()));

        // Deleting the key hides the field rows.
        assert_eq!(db.del(&[b"H"])?, 1);
        assert_eq!(db.hget(b"H", b"f1")?, None);
        assert_eq!(db.hlen(b"H")?, 0);
        Ok(())
    }

    #[test]
    fn test_hmset_hmget() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        let added = db.hmset(
            b"h",
            &[
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"a".to_vec(), b"1-final".to_vec()),
            ],
        )?;
        assert_eq!(added, 2, "duplicate fields count once");

        assert_eq!(
            db.hmget(b"h", &[b"a", b"missing", b"b"])?,
            vec![Some(b"1-final".to_vec()), None, Some(b"2".to_vec())]
        );
        assert_eq!(db.hlen(b"h")?, 2);
        Ok(())
    }

    #[test]
    fn test_hgetall_sorted_by_field() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.hmset(
            b"h",
            &[
                (b"zebra".to_vec(), b"3".to_vec()),
                (b"apple".to_vec(), b"1".to_vec()),
                (b"mango".to_vec(), b"2".to_vec()),
            ],
        )?;

        let all = db.hgetall(b"h")?;
        assert_eq!(
            all,
            vec![
                (b"apple".to_vec(), b"1".to_vec()),
                (b"mango".to_vec(), b"2".to_vec()),
                (b"zebra".to_vec(), b"3".to_vec()),
            ]
        );

        assert_eq!(db.hgetall(b"missing")?, Vec::new());
        Ok(())
    }

    #[test]
    fn test_hexists() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.hset(b"h", b"present", b"v")?;
        assert!(db.hexists(b"h", b"present")?);
        assert!(!db.hexists(b"h", b"absent")?);
        assert!(!db.hexists(b"nokey", b"f")?);
        Ok(())
    }

    #[test]
    fn test_recreated_hash_gets_fresh_version() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.hmset(
            b"h",
            &[
                (b"old1".to_vec(), b"x".to_vec()),
                (b"old2".to_vec(), b"y".to_vec()),
            ],
        )?;
        db.del(&[b"h"])?;

        // The recreated hash must not see rows from the old version.
        db.hset(b"h", b"new", b"z")?;
        assert_eq!(db.hlen(b"h")?, 1);
        assert_eq!(db.hget(b"h", b"old1")?, None);
        assert_eq!(db.hgetall(b"h")?, vec![(b"new".to_vec(), b"z".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_hash_survives_flush_and_reopen() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let db = open_test_db(&dir);
            db.hmset(
                b"h",
                &[
                    (b"f1".to_vec(), b"v1".to_vec()),
                    (b"f2".to_vec(), b"v2".to_vec()),
                ],
            )?;
            db.engine().rotate_memtable()?;
            db.engine().flush_memtable()?;
            db.hset(b"h", b"f3", b"v3")?;
        }

        let db = open_test_db(&dir);
        assert_eq!(db.hlen(b"h")?, 3);
        assert_eq!(db.hget(b"h", b"f1")?, Some(b"v1".to_vec()));
        assert_eq!(db.hget(b"h", b"f3")?, Some(b"v3".to_vec()));
        Ok(())
    }
}
