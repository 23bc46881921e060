//! Key encodings shared by the Redis type codecs.
//!
//! Each Redis type claims a prefix in the ordered keyspace:
//!
//! - String: `S{key}` -> `ttl_expiry_ms(u64) || payload`
//! - Hash meta: `H{key}` -> `count(u32) || version(u64) || ttl(u64)`
//! - Hash field: `h{key_len:u32}{key}{version:u64}{field}` -> value
//! - Zset meta: `Z{key}` -> same shape as hash meta
//! - Zset member index: `zm{key_len}{key}{version}{member}` -> score bits
//! - Zset score index: `zs{key_len}{key}{version}{sortable:8}{member}` -> empty
//!
//! Numeric fields are little-endian. The one exception is `sortable`, the
//! order-preserving transform of an IEEE-754 double, written big-endian so
//! that bytewise key order equals numeric score order; members with equal
//! scores then order bytewise, which is exactly the Redis tie-break.
//!
//! Composite keys embed a version stamp. Deleting or expiring a key bumps
//! the version in (or removes) the meta row, which orphans every child row
//! in one write; orphans are invisible to readers and get dropped when
//! compaction reaches them.

use byteorder::{ByteOrder, LittleEndian};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errcorrupt;
use crate::error::Result;

pub(crate) const STRING_PREFIX: u8 = b'S';
pub(crate) const HASH_META_PREFIX: u8 = b'H';
pub(crate) const HASH_FIELD_PREFIX: u8 = b'h';
pub(crate) const ZSET_META_PREFIX: u8 = b'Z';
pub(crate) const ZSET_MEMBER_PREFIX: &[u8] = b"zm";
pub(crate) const ZSET_SCORE_PREFIX: &[u8] = b"zs";

pub(crate) const META_SIZE: usize = 20;

/// Milliseconds since the epoch; the clock TTLs are measured against.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Metadata row for hashes and sorted sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Meta {
    pub count: u32,
    pub version: u64,
    pub ttl: u64,
}

impl Meta {
    pub(crate) fn new(version: u64) -> Self {
        Self {
            count: 0,
            version,
            ttl: 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.count);
        LittleEndian::write_u64(&mut buf[4..12], self.version);
        LittleEndian::write_u64(&mut buf[12..20], self.ttl);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != META_SIZE {
            return errcorrupt!("meta row has {} bytes, expected {META_SIZE}", buf.len());
        }
        Ok(Self {
            count: LittleEndian::read_u32(&buf[0..4]),
            version: LittleEndian::read_u64(&buf[4..12]),
            ttl: LittleEndian::read_u64(&buf[12..20]),
        })
    }

    pub(crate) fn is_expired(&self, now: u64) -> bool {
        self.ttl > 0 && now >= self.ttl
    }
}

// ---- String keys ----

pub(crate) fn string_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(STRING_PREFIX);
    out.extend_from_slice(key);
    out
}

/// String values carry their expiry in a fixed header.
pub(crate) fn encode_string_value(expiry_ms: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    let mut header = [0u8; 8];
    LittleEndian::write_u64(&mut header, expiry_ms);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    out
}

/// Splits a string value into (expiry_ms, payload).
pub(crate) fn decode_string_value(value: &[u8]) -> Result<(u64, &[u8])> {
    if value.len() < 8 {
        return errcorrupt!("string value has {} bytes, expected >= 8", value.len());
    }
    Ok((LittleEndian::read_u64(&value[..8]), &value[8..]))
}

// ---- Hash keys ----

pub(crate) fn hash_meta_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(HASH_META_PREFIX);
    out.extend_from_slice(key);
    out
}

pub(crate) fn hash_field_prefix(key: &[u8], version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(13 + key.len());
    out.push(HASH_FIELD_PREFIX);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, key.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(key);
    let mut v = [0u8; 8];
    LittleEndian::write_u64(&mut v, version);
    out.extend_from_slice(&v);
    out
}

pub(crate) fn hash_field_key(key: &[u8], version: u64, field: &[u8]) -> Vec<u8> {
    let mut out = hash_field_prefix(key, version);
    out.extend_from_slice(field);
    out
}

// ---- Zset keys ----

pub(crate) fn zset_meta_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(ZSET_META_PREFIX);
    out.extend_from_slice(key);
    out
}

fn zset_index_prefix(tag: &[u8], key: &[u8], version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + key.len());
    out.extend_from_slice(tag);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, key.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(key);
    let mut v = [0u8; 8];
    LittleEndian::write_u64(&mut v, version);
    out.extend_from_slice(&v);
    out
}

pub(crate) fn zset_member_prefix(key: &[u8], version: u64) -> Vec<u8> {
    zset_index_prefix(ZSET_MEMBER_PREFIX, key, version)
}

pub(crate) fn zset_member_key(key: &[u8], version: u64, member: &[u8]) -> Vec<u8> {
    let mut out = zset_member_prefix(key, version);
    out.extend_from_slice(member);
    out
}

pub(crate) fn zset_score_prefix(key: &[u8], version: u64) -> Vec<u8> {
    zset_index_prefix(ZSET_SCORE_PREFIX, key, version)
}

pub(crate) fn zset_score_key(key: &[u8], version: u64, score: f64, member: &[u8]) -> Vec<u8> {
    let mut out = zset_score_prefix(key, version);
    out.extend_from_slice(&score_to_sortable(score));
    out.extend_from_slice(member);
    out
}

/// (sortable score bytes, member) from a score-index row key. The caller
/// supplies the prefix it scanned with.
pub(crate) fn split_score_key<'a>(row_key: &'a [u8], prefix_len: usize) -> Result<(f64, &'a [u8])> {
    if row_key.len() < prefix_len + 8 {
        return errcorrupt!("score index key too short: {} bytes", row_key.len());
    }
    let mut sortable = [0u8; 8];
    sortable.copy_from_slice(&row_key[prefix_len..prefix_len + 8]);
    Ok((sortable_to_score(sortable), &row_key[prefix_len + 8..]))
}

// ---- Scores ----

/// Score stored in the member index: raw IEEE-754 bits, little-endian.
pub(crate) fn encode_score(score: f64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, score.to_bits());
    buf
}

pub(crate) fn decode_score(value: &[u8]) -> Result<f64> {
    if value.len() != 8 {
        return errcorrupt!("score value has {} bytes, expected 8", value.len());
    }
    Ok(f64::from_bits(LittleEndian::read_u64(value)))
}

/// Transforms a double so that bytewise comparison of the big-endian bytes
/// equals numeric comparison: positive values get the sign bit flipped,
/// negative values get all bits inverted.
pub(crate) fn score_to_sortable(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    ordered.to_be_bytes()
}

pub(crate) fn sortable_to_score(sortable: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(sortable);
    let bits = if ordered >> 63 == 1 {
        ordered ^ (1 << 63)
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip() {
        let meta = Meta {
            count: 42,
            version: 9000,
            ttl: 123456,
        };
        let decoded = Meta::decode(&meta.encode()).expect("Failed to decode");
        assert_eq!(decoded, meta);

        assert!(Meta::decode(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_meta_expiry() {
        let mut meta = Meta::new(1);
        assert!(!meta.is_expired(u64::MAX), "ttl 0 never expires");
        meta.ttl = 100;
        assert!(!meta.is_expired(99));
        assert!(meta.is_expired(100));
        assert!(meta.is_expired(101));
    }

    #[test]
    fn test_string_value_roundtrip() {
        let value = encode_string_value(777, b"payload");
        let (expiry, payload) = decode_string_value(&value).unwrap();
        assert_eq!(expiry, 777);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_key_prefixes_are_disjoint() {
        // The same user key under different types never collides.
        let key = b"mykey";
        let keys = vec![
            string_key(key),
            hash_meta_key(key),
            hash_field_key(key, 1, b"f"),
            zset_meta_key(key),
            zset_member_key(key, 1, b"m"),
            zset_score_key(key, 1, 1.0, b"m"),
        ];
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_versions_partition_child_rows() {
        // Rows from different versions of the same key never interleave
        // under one version's prefix.
        let v1 = zset_member_key(b"k", 1, b"member");
        let prefix_v2 = zset_member_prefix(b"k", 2);
        assert!(!v1.starts_with(&prefix_v2));
    }

    #[test]
    fn test_score_sortable_preserves_order() {
        let scores = [
            f64::NEG_INFINITY,
            -1e100,
            -2.5,
            -1.0,
            -f64::MIN_POSITIVE,
            0.0,
            f64::MIN_POSITIVE,
            0.5,
            1.0,
            2.5,
            1e100,
            f64::INFINITY,
        ];
        for window in scores.windows(2) {
            let (a, b) = (window[0], window[1]);
            assert!(
                score_to_sortable(a) < score_to_sortable(b),
                "sortable({a}) must sort below sortable({b})"
            );
        }
    }

    #[test]
    fn test_score_sortable_roundtrip() {
        for score in [-1e300, -7.25, -0.0, 0.0, 3.5, 12345.6789, 1e300] {
            let back = sortable_to_score(score_to_sortable(score));
            assert_eq!(back.to_bits(), score.to_bits());
        }
        assert_eq!(
            sortable_to_score(score_to_sortable(f64::INFINITY)),
            f64::INFINITY
        );
        assert_eq!(
            sortable_to_score(score_to_sortable(f64::NEG_INFINITY)),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_score_key_split() {
        let prefix = zset_score_prefix(b"k", 3);
        let row = zset_score_key(b"k", 3, -4.5, b"member");
        let (score, member) = split_score_key(&row, prefix.len()).unwrap();
        assert_eq!(score, -4.5);
        assert_eq!(member, b"member");
    }

    #[test]
    fn test_equal_scores_order_by_member() {
        let a = zset_score_key(b"k", 1, 2.0, b"alpha");
        let b = zset_score_key(b"k", 1, 2.0, b"beta");
        let c = zset_score_key(b"k", 1, 3.0, b"aaa");
        assert!(a < b, "equal scores tie-break on member bytes");
        assert!(b < c, "score dominates member");
    }
}
