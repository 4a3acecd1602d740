//! Filter policies. The default is a Bloom filter sized at ~10 bits per key,
//! which keeps the false-positive rate around 1%.

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_128;

use crate::key::extract_user_key;

/// Builds and queries the per-block membership filters embedded in tables.
pub trait FilterPolicy: Send + Sync {
    /// Stable identifier, recorded in the table's metaindex under
    /// `"filter." + name()`. Changing the algorithm requires a new name.
    fn name(&self) -> &'static str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Must return true if `key` was in the set the filter was built from.
    /// May return true for keys that were not (false positive).
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with double hashing.
///
/// Filter layout: the bit array, then one byte recording the number of
/// probes. The two independent hashes come from splitting a 128-bit xxh3
/// digest.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    probes: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> BloomFilterPolicy {
        // probes = bits_per_key * ln(2), bounded to keep small filters sane.
        let probes = ((bits_per_key as f64) * 0.69) as usize;
        BloomFilterPolicy {
            bits_per_key,
            probes: probes.clamp(1, 30),
        }
    }

    fn hashes(key: &[u8]) -> (u64, u64) {
        let digest = xxh3_128(key);
        (digest as u64, (digest >> 64) as u64)
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> BloomFilterPolicy {
        BloomFilterPolicy::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "cinderdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Very small key sets would see high false-positive rates; floor the
        // array at 64 bits.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let start = dst.len();
        dst.resize(start + bytes, 0);
        dst.push(self.probes as u8);
        let array = &mut dst[start..start + bytes];

        for key in keys {
            let (h1, h2) = Self::hashes(key);
            for i in 0..self.probes as u64 {
                let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % bits as u64) as usize;
                array[bit / 8] |= 1 << (bit % 8);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let array = &filter[..filter.len() - 1];
        let bits = array.len() * 8;
        let probes = filter[filter.len() - 1];
        if probes > 30 {
            // Reserved for future encodings; treat as a match.
            return true;
        }

        let (h1, h2) = Self::hashes(key);
        for i in 0..probes as u64 {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % bits as u64) as usize;
            if array[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

/// Adapts a user-key filter policy to the internal keys the table builder
/// feeds it, by stripping the tag before hashing or probing.
pub struct InternalFilterPolicy {
    user: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user: Arc<dyn FilterPolicy>) -> InternalFilterPolicy {
        InternalFilterPolicy { user }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user.name()
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let user_keys: Vec<&[u8]> = keys.iter().map(|k| extract_user_key(k)).collect();
        self.user.create_filter(&user_keys, dst);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user.key_may_match(extract_user_key(key), filter)
    }
}
