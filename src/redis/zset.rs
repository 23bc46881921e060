//! Sorted-set commands.
//!
//! A zset spans three keyspaces: the meta row `Z{key}`, a member index
//! `zm{..}{member}` -> score bits, and a score index
//! `zs{..}{sortable}{member}` -> empty. Every mutation touches both
//! indexes inside one write batch, so readers always observe them in
//! agreement. Score order falls out of the score index's key layout:
//! sortable score bytes first, member bytes as the tie-break.

use std::collections::BTreeMap;

use crate::errinput;
use crate::error::Result;
use crate::storage::WriteBatch;
use crate::Error;

use super::types::{
    decode_score, encode_score, now_millis, split_score_key, zset_member_key,
    zset_member_prefix, zset_meta_key, zset_score_key, zset_score_prefix, Meta,
};
use super::{Aggregate, RedisDb, RedisType};

impl RedisDb {
    /// ZADD: inserts or updates members. Returns how many members were
    /// newly added (score updates do not count).
    pub fn zadd(&self, key: &[u8], members: &[(f64, Vec<u8>)]) -> Result<usize> {
        if members.is_empty() {
            return errinput!("empty members list");
        }
        for (score, _) in members {
            if score.is_nan() {
                return Err(Error::ScoreNan);
            }
        }

        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        let existing = self.meta_live(RedisType::Zset, key, sequence, now)?;
        let mut meta = existing.unwrap_or_else(|| Meta::new(self.next_version()));

        // Repeated members within one call: the last occurrence wins.
        let mut deduped: BTreeMap<&[u8], f64> = BTreeMap::new();
        for (score, member) in members {
            deduped.insert(member.as_slice(), *score);
        }

        let mut batch = WriteBatch::new();
        let mut added = 0usize;
        for (member, score) in deduped {
            let old = match existing {
                Some(_) => self.member_score(key, meta.version, member, sequence)?,
                None => None,
            };
            match old {
                Some(old_score) if old_score == score => continue,
                Some(old_score) => {
                    // Reposition: drop the old score-index row, write both
                    // rows for the new score.
                    batch.delete(&zset_score_key(key, meta.version, old_score, member));
                }
                None => added += 1,
            }
            batch.put(&zset_member_key(key, meta.version, member), &encode_score(score));
            batch.put(&zset_score_key(key, meta.version, score, member), b"");
        }

        if batch.is_empty() {
            return Ok(0);
        }
        meta.count += added as u32;
        batch.put(&zset_meta_key(key), &meta.encode());
        self.db.write(batch, &self.write_options)?;
        Ok(added)
    }

    /// ZCARD: the set's cardinality, 0 when absent.
    pub fn zcard(&self, key: &[u8]) -> Result<usize> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;
        Ok(self
            .meta_live(RedisType::Zset, key, sequence, now)?
            .map_or(0, |meta| meta.count as usize))
    }

    /// ZSCORE: the member's score, nil when absent.
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => self.member_score(key, meta.version, member, sequence),
            None => Ok(None),
        }
    }

    /// ZINCRBY: adds delta to the member's score (missing members start
    /// from the delta). Returns the new score. Incrementing +inf by -inf
    /// is an error.
    pub fn zincrby(&self, key: &[u8], member: &[u8], delta: f64) -> Result<f64> {
        if delta.is_nan() {
            return Err(Error::ScoreNan);
        }
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        let existing = self.meta_live(RedisType::Zset, key, sequence, now)?;
        let mut meta = existing.unwrap_or_else(|| Meta::new(self.next_version()));
        let old = match existing {
            Some(_) => self.member_score(key, meta.version, member, sequence)?,
            None => None,
        };
        let score = match old {
            Some(old) => old + delta,
            None => delta,
        };
        if score.is_nan() {
            return Err(Error::ScoreNan);
        }

        let mut batch = WriteBatch::new();
        match old {
            Some(old_score) if old_score == score => return Ok(score),
            Some(old_score) => {
                batch.delete(&zset_score_key(key, meta.version, old_score, member));
            }
            None => meta.count += 1,
        }
        batch.put(&zset_member_key(key, meta.version, member), &encode_score(score));
        batch.put(&zset_score_key(key, meta.version, score, member), b"");
        batch.put(&zset_meta_key(key), &meta.encode());
        self.db.write(batch, &self.write_options)?;
        Ok(score)
    }

    /// ZRANK: 0-based position in ascending score order, ties broken by
    /// member bytes.
    pub fn zrank(&self, key: &[u8], member: &[u8]) -> Result<Option<usize>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let score = match self.member_score(key, meta.version, member, sequence)? {
            Some(score) => score,
            None => return Ok(None),
        };

        // Count the score-index rows strictly below (score, member).
        let target = zset_score_key(key, meta.version, score, member);
        let prefix = zset_score_prefix(key, meta.version);
        let mut rank = 0usize;
        for item in self.db.scan_at(&prefix, sequence)? {
            let (row_key, _) = item?;
            if !row_key.starts_with(&prefix) || row_key == target {
                break;
            }
            rank += 1;
        }
        Ok(Some(rank))
    }

    /// ZREVRANK: 0-based position in descending order.
    pub fn zrevrank(&self, key: &[u8], member: &[u8]) -> Result<Option<usize>> {
        let count = self.zcard(key)?;
        Ok(self.zrank(key, member)?.map(|rank| count - 1 - rank))
    }

    /// ZRANGE: members by ascending rank, inclusive; negative indexes
    /// count from the end.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<(Vec<u8>, f64)>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(Vec::new()),
        };

        let (start, stop) = match normalize_range(start, stop, meta.count as i64) {
            Some(range) => range,
            None => return Ok(Vec::new()),
        };

        let prefix = zset_score_prefix(key, meta.version);
        let mut out = Vec::with_capacity(stop - start + 1);
        for (index, item) in self.db.scan_at(&prefix, sequence)?.enumerate() {
            let (row_key, _) = item?;
            if !row_key.starts_with(&prefix) || index > stop {
                break;
            }
            if index < start {
                continue;
            }
            let (score, member) = split_score_key(&row_key, prefix.len())?;
            out.push((member.to_vec(), score));
        }
        Ok(out)
    }

    /// ZREVRANGE: members by descending rank.
    pub fn zrevrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<(Vec<u8>, f64)>> {
        let count = self.zcard(key)? as i64;
        let (start, stop) = match normalize_range(start, stop, count) {
            Some(range) => range,
            None => return Ok(Vec::new()),
        };
        // Rank r from the top is rank count-1-r from the bottom.
        let mut out = self.zrange(key, count - 1 - stop as i64, count - 1 - start as i64)?;
        out.reverse();
        Ok(out)
    }

    /// ZRANGEBYSCORE: members with min <= score <= max, each bound
    /// optionally open.
    pub fn zrangebyscore(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
        leftclose: bool,
        rightclose: bool,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        self.scorerange_collect(key, min, max, leftclose, rightclose)
    }

    /// ZREVRANGEBYSCORE: the same range in descending order.
    pub fn zrevrangebyscore(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
        leftclose: bool,
        rightclose: bool,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        let mut out = self.scorerange_collect(key, min, max, leftclose, rightclose)?;
        out.reverse();
        Ok(out)
    }

    /// ZCOUNT: how many members fall in the score range.
    pub fn zcount(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
        leftclose: bool,
        rightclose: bool,
    ) -> Result<usize> {
        Ok(self
            .scorerange_collect(key, min, max, leftclose, rightclose)?
            .len())
    }

    /// ZREM: removes members, ignoring absent ones. Returns how many were
    /// removed.
    pub fn zrem(&self, key: &[u8], members: &[&[u8]]) -> Result<usize> {
        if members.is_empty() {
            return errinput!("empty members list");
        }
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(0),
        };

        let mut victims = Vec::new();
        let mut seen: std::collections::HashSet<&[u8]> = std::collections::HashSet::new();
        for member in members {
            if !seen.insert(*member) {
                continue;
            }
            if let Some(score) = self.member_score(key, meta.version, member, sequence)? {
                victims.push((member.to_vec(), score));
            }
        }
        self.remove_entries(key, meta, &victims)
    }

    /// ZREMRANGEBYRANK: removes the members a ZRANGE with the same bounds
    /// would return.
    pub fn zremrangebyrank(&self, key: &[u8], start: i64, stop: i64) -> Result<usize> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(0),
        };
        let victims = self.zrange(key, start, stop)?;
        self.remove_entries(key, meta, &victims)
    }

    /// ZREMRANGEBYSCORE: removes the members in the score range.
    pub fn zremrangebyscore(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
        leftclose: bool,
        rightclose: bool,
    ) -> Result<usize> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(0),
        };
        let victims = self.scorerange_collect(key, min, max, leftclose, rightclose)?;
        self.remove_entries(key, meta, &victims)
    }

    /// ZRANGEBYLEX: members between two byte-string bounds, in member
    /// order. An empty bound is unbounded. Meaningful when all members
    /// share one score.
    pub fn zrangebylex(
        &self,
        key: &[u8],
        min: &[u8],
        max: &[u8],
        leftclose: bool,
        rightclose: bool,
    ) -> Result<Vec<Vec<u8>>> {
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(Vec::new()),
        };

        let prefix = zset_member_prefix(key, meta.version);
        let mut out = Vec::new();
        for item in self.db.scan_at(&prefix, sequence)? {
            let (row_key, _) = item?;
            if !row_key.starts_with(&prefix) {
                break;
            }
            let member = &row_key[prefix.len()..];
            let above = min.is_empty() || if leftclose { member >= min } else { member > min };
            if !above {
                continue;
            }
            if !max.is_empty() {
                let below = if rightclose { member <= max } else { member < max };
                if !below {
                    break;
                }
            }
            out.push(member.to_vec());
        }
        Ok(out)
    }

    /// ZLEXCOUNT: how many members fall in the lex range.
    pub fn zlexcount(
        &self,
        key: &[u8],
        min: &[u8],
        max: &[u8],
        leftclose: bool,
        rightclose: bool,
    ) -> Result<usize> {
        Ok(self.zrangebylex(key, min, max, leftclose, rightclose)?.len())
    }

    /// ZREMRANGEBYLEX: removes the members in the lex range.
    pub fn zremrangebylex(
        &self,
        key: &[u8],
        min: &[u8],
        max: &[u8],
        leftclose: bool,
        rightclose: bool,
    ) -> Result<usize> {
        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();
        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(0),
        };

        let members = self.zrangebylex(key, min, max, leftclose, rightclose)?;
        let mut victims = Vec::with_capacity(members.len());
        for member in members {
            if let Some(score) = self.member_score(key, meta.version, &member, sequence)? {
                victims.push((member, score));
            }
        }
        self.remove_entries(key, meta, &victims)
    }

    /// ZUNIONSTORE: folds the weighted inputs into `dest`, replacing it.
    /// Returns the result's cardinality.
    pub fn zunionstore(
        &self,
        dest: &[u8],
        keys: &[&[u8]],
        weights: &[f64],
        aggregate: Aggregate,
    ) -> Result<usize> {
        self.store_combined(dest, keys, weights, aggregate, false)
    }

    /// ZINTERSTORE: like ZUNIONSTORE but keeps only members present in
    /// every input.
    pub fn zinterstore(
        &self,
        dest: &[u8],
        keys: &[&[u8]],
        weights: &[f64],
        aggregate: Aggregate,
    ) -> Result<usize> {
        self.store_combined(dest, keys, weights, aggregate, true)
    }

    fn store_combined(
        &self,
        dest: &[u8],
        keys: &[&[u8]],
        weights: &[f64],
        aggregate: Aggregate,
        intersect: bool,
    ) -> Result<usize> {
        if keys.is_empty() {
            return errinput!("empty keys list");
        }
        if !weights.is_empty() && weights.len() != keys.len() {
            return errinput!("{} weights for {} keys", weights.len(), keys.len());
        }

        let _guard = self.commands.lock()?;
        let sequence = self.db.last_sequence();
        let now = now_millis();

        let mut acc: BTreeMap<Vec<u8>, f64> = BTreeMap::new();
        for (index, key) in keys.iter().enumerate() {
            self.check_type(RedisType::Zset, key, sequence, now)?;
            let weight = weights.get(index).copied().unwrap_or(1.0);

            let mut present: std::collections::HashSet<Vec<u8>> = Default::default();
            if let Some(meta) = self.meta_live(RedisType::Zset, key, sequence, now)? {
                let prefix = zset_member_prefix(key, meta.version);
                for item in self.db.scan_at(&prefix, sequence)? {
                    let (row_key, value) = item?;
                    if !row_key.starts_with(&prefix) {
                        break;
                    }
                    let member = row_key[prefix.len()..].to_vec();
                    let score = sanitize(decode_score(&value)? * weight);
                    if intersect {
                        present.insert(member.clone());
                    }
                    match acc.entry(member) {
                        std::collections::btree_map::Entry::Vacant(entry) => {
                            if !intersect || index == 0 {
                                entry.insert(score);
                            }
                        }
                        std::collections::btree_map::Entry::Occupied(mut entry) => {
                            let folded = match aggregate {
                                Aggregate::Sum => sanitize(*entry.get() + score),
                                Aggregate::Min => entry.get().min(score),
                                Aggregate::Max => entry.get().max(score),
                            };
                            *entry.get_mut() = folded;
                        }
                    }
                }
            }
            if intersect && index > 0 {
                acc.retain(|member, _| present.contains(member));
            }
        }

        // The destination is replaced whatever it held before.
        let mut batch = WriteBatch::new();
        if self.string_live(dest, sequence, now)? {
            batch.delete(&super::types::string_key(dest));
        }
        if self.meta_live(RedisType::Hash, dest, sequence, now)?.is_some() {
            batch.delete(&super::types::hash_meta_key(dest));
        }
        if self.meta_live(RedisType::Zset, dest, sequence, now)?.is_some() {
            batch.delete(&zset_meta_key(dest));
        }

        if !acc.is_empty() {
            let mut meta = Meta::new(self.next_version());
            meta.count = acc.len() as u32;
            for (member, score) in &acc {
                batch.put(&zset_member_key(dest, meta.version, member), &encode_score(*score));
                batch.put(&zset_score_key(dest, meta.version, *score, member), b"");
            }
            batch.put(&zset_meta_key(dest), &meta.encode());
        }

        if !batch.is_empty() {
            self.db.write(batch, &self.write_options)?;
        }
        Ok(acc.len())
    }

    // ---- Helpers ----

    fn member_score(
        &self,
        key: &[u8],
        version: u64,
        member: &[u8],
        sequence: u64,
    ) -> Result<Option<f64>> {
        match self
            .db
            .get_at(&zset_member_key(key, version, member), sequence)?
        {
            Some(value) => Ok(Some(decode_score(&value)?)),
            None => Ok(None),
        }
    }

    fn scorerange_collect(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
        leftclose: bool,
        rightclose: bool,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        if min.is_nan() || max.is_nan() {
            return Err(Error::ScoreNan);
        }
        let sequence = self.db.last_sequence();
        let now = now_millis();
        self.check_type(RedisType::Zset, key, sequence, now)?;

        let meta = match self.meta_live(RedisType::Zset, key, sequence, now)? {
            Some(meta) => meta,
            None => return Ok(Vec::new()),
        };

        let prefix = zset_score_prefix(key, meta.version);
        // Rows below the minimum score never get scanned: the seek starts
        // at the minimum's sortable position.
        let mut start = prefix.clone();
        start.extend_from_slice(&super::types::score_to_sortable(min));

        let mut out = Vec::new();
        for item in self.db.scan_at(&start, sequence)? {
            let (row_key, _) = item?;
            if !row_key.starts_with(&prefix) {
                break;
            }
            let (score, member) = split_score_key(&row_key, prefix.len())?;
            if score > max || (score == max && !rightclose) {
                break;
            }
            if score == min && !leftclose {
                continue;
            }
            out.push((member.to_vec(), score));
        }
        Ok(out)
    }

    /// Deletes both index rows per victim and rewrites (or removes) the
    /// meta row, all in one batch.
    fn remove_entries(
        &self,
        key: &[u8],
        mut meta: Meta,
        victims: &[(Vec<u8>, f64)],
    ) -> Result<usize> {
        if victims.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for (member, score) in victims {
            batch.delete(&zset_member_key(key, meta.version, member));
            batch.delete(&zset_score_key(key, meta.version, *score, member));
        }
        meta.count = meta.count.saturating_sub(victims.len() as u32);
        if meta.count == 0 {
            // An empty sorted set does not exist.
            batch.delete(&zset_meta_key(key));
        } else {
            batch.put(&zset_meta_key(key), &meta.encode());
        }
        self.db.write(batch, &self.write_options)?;
        Ok(victims.len())
    }
}

/// Maps the inclusive, possibly negative Redis (start, stop) onto concrete
/// indexes; None when the range is empty.
fn normalize_range(start: i64, stop: i64, len: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Aggregating opposing infinities yields NaN; Redis stores that as 0.
fn sanitize(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score
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

    fn pairs(members: &[(&[u8], f64)]) -> Vec<(f64, Vec<u8>)> {
        members.iter().map(|(m, s)| (*s, m.to_vec())).collect()
    }

    fn names(entries: &[(Vec<u8>, f64)]) -> Vec<Vec<u8>> {
        entries.iter().map(|(m, _)| m.clone()).collect()
    }

    #[test]
    fn test_zadd_update_reorders() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        // "a" appears twice; the second score wins and "a" counts once.
        let added = db.zadd(
            b"Z",
            &pairs(&[(b"a", 1.0), (b"b", 2.0), (b"a", 2.0), (b"c", 3.0)]),
        )?;
        assert_eq!(added, 3);
        assert_eq!(db.zcard(b"Z")?, 3);

        // Equal scores order by member bytes: "a" before "b".
        assert_eq!(
            db.zrange(b"Z", 0, -1)?,
            vec![
                (b"a".to_vec(), 2.0),
                (b"b".to_vec(), 2.0),
                (b"c".to_vec(), 3.0),
            ]
        );

        // Updating a score repositions without changing cardinality.
        assert_eq!(db.zadd(b"Z", &pairs(&[(b"c", 0.5)]))?, 0);
        assert_eq!(names(&db.zrange(b"Z", 0, -1)?), vec![b"c".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(db.zcard(b"Z")?, 3);
        Ok(())
    }

    #[test]
    fn test_zadd_rejects_nan_and_empty() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        assert!(matches!(db.zadd(b"Z", &[]), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            db.zadd(b"Z", &[(f64::NAN, b"m".to_vec())]),
            Err(Error::ScoreNan)
        ));
    }

    #[test]
    fn test_zscore_and_infinities() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(
            b"Z",
            &pairs(&[(b"low", f64::NEG_INFINITY), (b"mid", 0.0), (b"high", f64::INFINITY)]),
        )?;
        assert_eq!(db.zscore(b"Z", b"low")?, Some(f64::NEG_INFINITY));
        assert_eq!(db.zscore(b"Z", b"high")?, Some(f64::INFINITY));
        assert_eq!(db.zscore(b"Z", b"missing")?, None);

        assert_eq!(
            names(&db.zrange(b"Z", 0, -1)?),
            vec![b"low".to_vec(), b"mid".to_vec(), b"high".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn test_zrange_negative_indexes() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(
            b"Z",
            &pairs(&[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0), (b"d", 4.0)]),
        )?;

        assert_eq!(names(&db.zrange(b"Z", 0, 1)?), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(names(&db.zrange(b"Z", -2, -1)?), vec![b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(names(&db.zrange(b"Z", 2, 100)?), vec![b"c".to_vec(), b"d".to_vec()]);
        assert!(db.zrange(b"Z", 3, 1)?.is_empty());
        assert!(db.zrange(b"Z", 10, 20)?.is_empty());
        assert!(db.zrange(b"missing", 0, -1)?.is_empty());

        assert_eq!(
            names(&db.zrevrange(b"Z", 0, 1)?),
            vec![b"d".to_vec(), b"c".to_vec()]
        );
        assert_eq!(
            names(&db.zrevrange(b"Z", -2, -1)?),
            vec![b"b".to_vec(), b"a".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn test_zrange_matches_full_scorerange() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(
            b"Z",
            &pairs(&[(b"a", -3.5), (b"b", 0.0), (b"c", 0.0), (b"d", 99.25)]),
        )?;
        assert_eq!(
            db.zrange(b"Z", 0, -1)?,
            db.zrangebyscore(b"Z", f64::NEG_INFINITY, f64::INFINITY, true, true)?
        );
        Ok(())
    }

    #[test]
    fn test_zrangebyscore_bounds() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(
            b"Z",
            &pairs(&[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0), (b"d", 4.0)]),
        )?;

        // Closed/open endpoint combinations.
        assert_eq!(
            names(&db.zrangebyscore(b"Z", 2.0, 3.0, true, false)?),
            vec![b"b".to_vec()]
        );
        assert_eq!(
            names(&db.zrangebyscore(b"Z", 2.0, 3.0, true, true)?),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(
            names(&db.zrangebyscore(b"Z", 2.0, 3.0, false, true)?),
            vec![b"c".to_vec()]
        );
        assert!(db.zrangebyscore(b"Z", 2.0, 2.0, false, false)?.is_empty());

        assert_eq!(db.zcount(b"Z", 2.0, 3.0, true, true)?, 2);
        assert_eq!(db.zcount(b"Z", f64::NEG_INFINITY, f64::INFINITY, true, true)?, 4);

        assert_eq!(
            names(&db.zrevrangebyscore(b"Z", 1.0, 3.0, true, true)?),
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn test_zrank_counts_smaller_entries() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(
            b"Z",
            &pairs(&[(b"a", 1.0), (b"b", 2.0), (b"c", 2.0), (b"d", 3.0)]),
        )?;

        assert_eq!(db.zrank(b"Z", b"a")?, Some(0));
        assert_eq!(db.zrank(b"Z", b"b")?, Some(1), "tie broken by member bytes");
        assert_eq!(db.zrank(b"Z", b"c")?, Some(2));
        assert_eq!(db.zrank(b"Z", b"d")?, Some(3));
        assert_eq!(db.zrank(b"Z", b"missing")?, None);

        assert_eq!(db.zrevrank(b"Z", b"a")?, Some(3));
        assert_eq!(db.zrevrank(b"Z", b"d")?, Some(0));
        Ok(())
    }

    #[test]
    fn test_zincrby() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        assert_eq!(db.zincrby(b"Z", b"m", 2.5)?, 2.5);
        assert_eq!(db.zincrby(b"Z", b"m", -1.0)?, 1.5);
        assert_eq!(db.zscore(b"Z", b"m")?, Some(1.5));

        db.zadd(b"Z", &pairs(&[(b"inf", f64::INFINITY)]))?;
        assert!(matches!(
            db.zincrby(b"Z", b"inf", f64::NEG_INFINITY),
            Err(Error::ScoreNan)
        ));
        Ok(())
    }

    #[test]
    fn test_zrem_and_remranges() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(
            b"Z",
            &pairs(&[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0), (b"d", 4.0), (b"e", 5.0)]),
        )?;

        assert_eq!(db.zrem(b"Z", &[b"b", b"missing", b"b"])?, 1);
        assert_eq!(db.zcard(b"Z")?, 4);
        assert_eq!(db.zscore(b"Z", b"b")?, None);
        assert_eq!(db.zrank(b"Z", b"c")?, Some(1));

        // Remove the top two by rank.
        assert_eq!(db.zremrangebyrank(b"Z", -2, -1)?, 2);
        assert_eq!(names(&db.zrange(b"Z", 0, -1)?), vec![b"a".to_vec(), b"c".to_vec()]);

        assert_eq!(db.zremrangebyscore(b"Z", 3.0, 10.0, true, true)?, 1);
        assert_eq!(names(&db.zrange(b"Z", 0, -1)?), vec![b"a".to_vec()]);

        // Removing the last member deletes the key.
        assert_eq!(db.zrem(b"Z", &[b"a"])?, 1);
        assert_eq!(db.zcard(b"Z")?, 0);
        assert_eq!(db.zrank(b"Z", b"a")?, None);
        Ok(())
    }

    #[test]
    fn test_lex_ranges() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        // All members share one score, as lex commands require.
        db.zadd(
            b"Z",
            &pairs(&[(b"a", 0.0), (b"b", 0.0), (b"c", 0.0), (b"d", 0.0)]),
        )?;

        assert_eq!(
            db.zrangebylex(b"Z", b"", b"", true, true)?,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(
            db.zrangebylex(b"Z", b"b", b"c", true, true)?,
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(db.zrangebylex(b"Z", b"b", b"c", false, false)?, Vec::<Vec<u8>>::new());
        assert_eq!(db.zlexcount(b"Z", b"a", b"", true, true)?, 4);
        assert_eq!(db.zlexcount(b"Z", b"a", b"c", false, true)?, 2);

        assert_eq!(db.zremrangebylex(b"Z", b"b", b"c", true, true)?, 2);
        assert_eq!(
            db.zrangebylex(b"Z", b"", b"", true, true)?,
            vec![b"a".to_vec(), b"d".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn test_zinterstore_with_weights() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(b"A", &pairs(&[(b"x", 1.0), (b"y", 2.0)]))?;
        db.zadd(b"B", &pairs(&[(b"y", 3.0), (b"z", 4.0)]))?;

        let count = db.zinterstore(b"D", &[b"A", b"B"], &[2.0, 3.0], Aggregate::Sum)?;
        assert_eq!(count, 1);
        assert_eq!(db.zscore(b"D", b"y")?, Some(2.0 * 2.0 + 3.0 * 3.0));
        assert_eq!(db.zcard(b"D")?, 1);
        Ok(())
    }

    #[test]
    fn test_zunionstore_aggregates() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        db.zadd(b"A", &pairs(&[(b"x", 1.0), (b"y", 5.0)]))?;
        db.zadd(b"B", &pairs(&[(b"y", 2.0), (b"z", 3.0)]))?;

        let count = db.zunionstore(b"D", &[b"A", b"B"], &[], Aggregate::Sum)?;
        assert_eq!(count, 3);
        assert_eq!(db.zscore(b"D", b"x")?, Some(1.0));
        assert_eq!(db.zscore(b"D", b"y")?, Some(7.0));
        assert_eq!(db.zscore(b"D", b"z")?, Some(3.0));

        db.zunionstore(b"D", &[b"A", b"B"], &[], Aggregate::Min)?;
        assert_eq!(db.zscore(b"D", b"y")?, Some(2.0));

        db.zunionstore(b"D", &[b"A", b"B"], &[], Aggregate::Max)?;
        assert_eq!(db.zscore(b"D", b"y")?, Some(5.0));

        // The destination is replaced, not merged into.
        db.zadd(b"E", &pairs(&[(b"only", 1.0)]))?;
        db.zunionstore(b"E", &[b"A"], &[], Aggregate::Sum)?;
        assert_eq!(db.zscore(b"E", b"only")?, None);
        assert_eq!(db.zcard(b"E")?, 2);
        Ok(())
    }

    #[test]
    fn test_union_weight_validation() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);
        assert!(matches!(
            db.zunionstore(b"D", &[], &[], Aggregate::Sum),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            db.zunionstore(b"D", &[b"A", b"B"], &[1.0], Aggregate::Sum),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_indexes_stay_synchronized() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        // Mixed workload: adds, updates, removals.
        db.zadd(
            b"Z",
            &pairs(&[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0), (b"d", 4.0)]),
        )?;
        db.zadd(b"Z", &pairs(&[(b"b", 9.0), (b"e", 0.5)]))?;
        db.zrem(b"Z", &[b"c"])?;

        // The member index (via zscore) and the score index (via zrange)
        // must agree exactly.
        let from_score_index = db.zrange(b"Z", 0, -1)?;
        assert_eq!(from_score_index.len(), db.zcard(b"Z")?);
        for (member, score) in &from_score_index {
            assert_eq!(
                db.zscore(b"Z", member)?,
                Some(*score),
                "member {:?} out of sync",
                String::from_utf8_lossy(member)
            );
        }
        assert_eq!(
            names(&from_score_index),
            vec![b"e".to_vec(), b"a".to_vec(), b"d".to_vec(), b"b".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn test_zset_survives_flush_and_compaction() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = open_test_db(&dir);

        for i in 0..200 {
            db.zadd(b"big", &[(i as f64, format!("member_{:04}", i).into_bytes())])?;
        }
        db.engine().rotate_memtable()?;
        db.engine().flush_memtable()?;

        // Updates after the flush shadow the table data.
        db.zadd(b"big", &pairs(&[(b"member_0000", 500.0)]))?;
        db.zrem(b"big", &[b"member_0001"])?;

        assert_eq!(db.zcard(b"big")?, 199);
        assert_eq!(db.zscore(b"big", b"member_0000")?, Some(500.0));
        assert_eq!(db.zscore(b"big", b"member_0001")?, None);

        let all = db.zrange(b"big", 0, -1)?;
        assert_eq!(all.len(), 199);
        assert_eq!(all.last().unwrap().0, b"member_0000".to_vec());
        Ok(())
    }
}
