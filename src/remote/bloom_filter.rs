use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, FirestoreResult};

/// Bloom filter backing the watch protocol's existence filters.
///
/// The server sends a bitmap plus hash count; the client probes each locally
/// held document name. A key reported absent is definitely not in the
/// target's result set any more, so it can be purged without a re-listen;
/// false positives are bounded by the filter's configured rate and are
/// caught by the subsequent count comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: usize,
    hash_count: u32,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u32, hash_count: u32) -> FirestoreResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!(
                "invalid bloom filter padding: {padding}"
            )));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument("empty bloom filter cannot have padding"));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("bloom filter hash count must be positive"));
        }
        let bit_count = bitmap.len() * 8 - padding as usize;
        Ok(Self {
            bitmap,
            bit_count,
            hash_count,
        })
    }

    /// Builds a filter sized for `expected_entries` at roughly a 1% false
    /// positive rate. Used by tests and the in-memory backend.
    pub fn with_expected_entries(expected_entries: usize) -> Self {
        let bit_count = (expected_entries.max(1) * 10).next_multiple_of(8);
        Self {
            bitmap: vec![0; bit_count / 8],
            bit_count,
            hash_count: 7,
        }
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Padding bits in the last byte, for the wire representation.
    pub fn padding(&self) -> u32 {
        (self.bitmap.len() * 8 - self.bit_count) as u32
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = Self::hash(value);
        for i in 0..self.hash_count {
            let bit = self.bit_for(h1, h2, i);
            self.bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = Self::hash(value);
        (0..self.hash_count).all(|i| {
            let bit = self.bit_for(h1, h2, i);
            self.bitmap[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    fn bit_for(&self, h1: u64, h2: u64, i: u32) -> usize {
        let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (combined % self.bit_count as u64) as usize
    }

    // Double hashing over the two halves of a SHA-256 digest.
    fn hash(value: &str) -> (u64, u64) {
        let digest = Sha256::digest(value.as_bytes());
        let h1 = u64::from_le_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("digest is 32 bytes"));
        (h1, h2)
    }
}
