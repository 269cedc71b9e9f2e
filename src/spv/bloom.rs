//! Bloom filter computed over watched program hashes and wallet outpoints.
//!
//! The filter is uploaded to peers via `filterload` so they only relay
//! blocks filtered down to transactions the wallet may care about.

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

use crate::core::serialize::{read_u32, read_var_bytes, write_u32, write_var_bytes, Serializable};

/// Maximum filter size in bytes.
pub const MAX_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Filter update flags carried by `filterload`.
pub const UPDATE_NONE: u8 = 0;
pub const UPDATE_ALL: u8 = 1;

/// A Bloom filter and its `filterload` payload form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Create a filter sized for `elements` entries at the given false
    /// positive rate.
    pub fn new(elements: usize, fp_rate: f64, tweak: u32) -> Self {
        let elements = elements.max(1);
        // size: -n * ln(p) / ln(2)^2, bits
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let size_bits = (-(elements as f64) * fp_rate.ln() / ln2_squared) as usize;
        let size_bytes = (size_bits / 8).clamp(1, MAX_FILTER_SIZE);
        // hash functions: (m/n) * ln(2)
        let hash_funcs = ((size_bytes * 8) as f64 / elements as f64 * std::f64::consts::LN_2)
            as u32;
        Self {
            data: vec![0u8; size_bytes],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags: UPDATE_NONE,
        }
    }

    /// Add an element to the filter.
    pub fn insert(&mut self, element: &[u8]) {
        for i in 0..self.hash_funcs {
            let idx = self.hash(element, i);
            self.data[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Check whether an element may be in the filter.
    pub fn contains(&self, element: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let idx = self.hash(element, i);
            self.data[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    // Seeded hash: SHA-256 over (seed || element), first four bytes as index.
    fn hash(&self, element: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(0xFBA4C795).wrapping_add(self.tweak);
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(element);
        let digest = hasher.finalize();
        let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (idx as usize) % (self.data.len() * 8)
    }
}

impl Serializable for BloomFilter {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_var_bytes(writer, &self.data)?;
        write_u32(writer, self.hash_funcs)?;
        write_u32(writer, self.tweak)?;
        writer.write_all(&[self.flags])
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let data = read_var_bytes(reader)?;
        if data.is_empty() || data.len() > MAX_FILTER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad bloom filter size",
            ));
        }
        let hash_funcs = read_u32(reader)?;
        if hash_funcs == 0 || hash_funcs > MAX_HASH_FUNCS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad bloom hash function count",
            ));
        }
        let tweak = read_u32(reader)?;
        let mut flags = [0u8; 1];
        reader.read_exact(&mut flags)?;
        Ok(Self {
            data,
            hash_funcs,
            tweak,
            flags: flags[0],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains() {
        let mut filter = BloomFilter::new(10, 0.0005, 7);
        filter.insert(b"watched program hash");
        filter.insert(b"outpoint");

        assert!(filter.contains(b"watched program hash"));
        assert!(filter.contains(b"outpoint"));
        assert!(!filter.contains(b"something else entirely"));
    }

    #[test]
    fn test_sizing_grows_with_elements() {
        let small = BloomFilter::new(10, 0.0005, 0);
        let large = BloomFilter::new(1000, 0.0005, 0);
        assert!(large.size() > small.size());
        assert!(small.hash_funcs >= 1);
    }

    #[test]
    fn test_empty_filter() {
        let filter = BloomFilter::new(10, 0.0005, 0);
        assert!(filter.is_empty());
    }

    #[test]
    fn test_payload_round_trip() {
        let mut filter = BloomFilter::new(20, 0.0005, 99);
        filter.insert(b"abc");
        let decoded = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(filter, decoded);
        assert!(decoded.contains(b"abc"));
    }

    #[test]
    fn test_reject_oversize_payload() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, &vec![0u8; MAX_FILTER_SIZE + 1]).unwrap();
        write_u32(&mut buf, 1).unwrap();
        write_u32(&mut buf, 0).unwrap();
        buf.push(0);
        assert!(BloomFilter::from_bytes(&buf).is_err());
    }
}
