//! Bloom filter for table files.
//!
//! One filter covers a whole table's user keys. A negative answer skips the
//! index and data block reads for a missing key; false positives only cost
//! the reads that would have happened without the filter.
//!
//! Hashing is a single base hash per key with k derived probes (double
//! hashing), so building and probing stay cheap at 10 bits per key the
//! false-positive rate is roughly 1%.

/// Serialized form: bit array followed by one byte holding the probe count.
pub struct BloomFilter {
    bits: Vec<u8>,
    probes: u8,
}

impl BloomFilter {
    /// Builds a filter over the given keys.
    pub fn build(keys: &[Vec<u8>], bits_per_key: u32) -> Self {
        // ln(2) * bits/key rounded, clamped to a sane probe count.
        let probes = ((bits_per_key as f64 * 0.69) as u8).clamp(1, 30);

        let mut nbits = keys.len() * bits_per_key as usize;
        // Tiny filters have a high false-positive rate; enforce a floor.
        if nbits < 64 {
            nbits = 64;
        }
        let nbytes = (nbits + 7) / 8;
        let nbits = nbytes * 8;

        let mut bits = vec![0u8; nbytes];
        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..probes {
                let bit = (h as usize) % nbits;
                bits[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }

        Self { bits, probes }
    }

    /// True if the key may be in the set; false means definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let nbits = self.bits.len() * 8;
        if nbits == 0 {
            return true;
        }
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..self.probes {
            let bit = (h as usize) % nbits;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.bits.clone();
        buf.push(self.probes);
        buf
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&probes, bits) = data.split_last()?;
        Some(Self {
            bits: bits.to_vec(),
            probes,
        })
    }
}

/// 32-bit hash in the spirit of the classic table-filter hash: a simple
/// multiplicative mix that spreads short binary keys well.
fn bloom_hash(key: &[u8]) -> u32 {
    const SEED: u32 = 0xbc9f1d34;
    const M: u32 = 0xc6a4a793;

    let mut h = SEED ^ (key.len() as u32).wrapping_mul(M);
    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h = h.wrapping_add(word);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }
    for &byte in chunks.remainder() {
        h = h.wrapping_add(byte as u32);
        h = h.wrapping_mul(M);
        h ^= h >> 24;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key_{:05}", i).into_bytes()).collect()
    }

    #[test]
    fn test_no_false_negatives() {
        let keys = keys(1000);
        let filter = BloomFilter::build(&keys, 10);
        for key in &keys {
            assert!(filter.may_contain(key), "missing key {:?}", key);
        }
    }

    #[test]
    fn test_false_positive_rate_reasonable() {
        let present = keys(1000);
        let filter = BloomFilter::build(&present, 10);

        let mut false_positives = 0;
        let trials = 10_000;
        for i in 0..trials {
            let absent = format!("absent_{:05}", i).into_bytes();
            if filter.may_contain(&absent) {
                false_positives += 1;
            }
        }
        // ~1% expected at 10 bits/key; allow generous slack.
        assert!(
            false_positives < trials / 25,
            "false positive rate too high: {}/{}",
            false_positives,
            trials
        );
    }

    #[test]
    fn test_empty_filter() {
        let filter = BloomFilter::build(&[], 10);
        // An empty filter reports everything absent.
        assert!(!filter.may_contain(b"anything"));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let keys = keys(100);
        let filter = BloomFilter::build(&keys, 10);
        let decoded = BloomFilter::decode(&filter.encode()).expect("Failed to decode");
        for key in &keys {
            assert!(decoded.may_contain(key));
        }
    }
}
