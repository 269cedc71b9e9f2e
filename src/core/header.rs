//! Block headers and proof-of-work arithmetic.

use primitive_types::U256;
use std::io::{self, Read, Write};

use crate::core::hash::{sha256d, Uint256};
use crate::core::serialize::{
    read_u32, read_var_bytes, write_u32, write_var_bytes, Serializable,
};

/// A block header as carried by `merkleblock` messages and the header store.
///
/// The auxiliary proof-of-work blob is opaque to the client and excluded
/// from the header hash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: u32,
    pub prev: Uint256,
    pub merkle_root: Uint256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: u32,
    pub aux_pow: Vec<u8>,
}

impl BlockHeader {
    /// Header hash: double SHA-256 of the serialization without `aux_pow`.
    pub fn hash(&self) -> Uint256 {
        let mut buf = Vec::with_capacity(88);
        self.serialize_base(&mut buf).expect("serialize to vec");
        Uint256::new(sha256d(&buf))
    }

    /// Expected proof-of-work for this header, derived from compact bits.
    pub fn work(&self) -> U256 {
        work_from_bits(self.bits)
    }

    fn serialize_base<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_u32(writer, self.version)?;
        writer.write_all(self.prev.as_bytes())?;
        writer.write_all(self.merkle_root.as_bytes())?;
        write_u32(writer, self.timestamp)?;
        write_u32(writer, self.bits)?;
        write_u32(writer, self.nonce)?;
        write_u32(writer, self.height)
    }
}

impl Serializable for BlockHeader {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.serialize_base(writer)?;
        write_var_bytes(writer, &self.aux_pow)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let version = read_u32(reader)?;
        let mut prev = [0u8; 32];
        reader.read_exact(&mut prev)?;
        let mut merkle_root = [0u8; 32];
        reader.read_exact(&mut merkle_root)?;
        let timestamp = read_u32(reader)?;
        let bits = read_u32(reader)?;
        let nonce = read_u32(reader)?;
        let height = read_u32(reader)?;
        let aux_pow = read_var_bytes(reader)?;
        Ok(Self {
            version,
            prev: Uint256::new(prev),
            merkle_root: Uint256::new(merkle_root),
            timestamp,
            bits,
            nonce,
            height,
            aux_pow,
        })
    }
}

/// Decode a compact difficulty target.
pub fn target_from_bits(bits: u32) -> U256 {
    let exponent = (bits >> 24) as usize;
    let mantissa = U256::from(bits & 0x007fffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// Expected work for a target: floor(2^256 / (target + 1)), computed as
/// (~target / (target + 1)) + 1 to stay inside 256 bits.
pub fn work_from_bits(bits: u32) -> U256 {
    let target = target_from_bits(bits);
    if target.is_zero() {
        return U256::zero();
    }
    (!target / (target + U256::one())) + U256::one()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev: Uint256::digest(b"prev"),
            merkle_root: Uint256::digest(b"root"),
            timestamp: 1_540_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
            height: 7,
            aux_pow: vec![0xde, 0xad],
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let decoded = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_hash_ignores_aux_pow() {
        let header = sample_header();
        let mut stripped = header.clone();
        stripped.aux_pow.clear();
        assert_eq!(header.hash(), stripped.hash());
    }

    #[test]
    fn test_hash_depends_on_fields() {
        let header = sample_header();
        let mut other = header.clone();
        other.nonce += 1;
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn test_lower_target_means_more_work() {
        // 0x1c.. targets are 256x smaller than 0x1d.. ones
        let easy = work_from_bits(0x1d00ffff);
        let hard = work_from_bits(0x1c00ffff);
        assert!(hard > easy);
    }

    #[test]
    fn test_genesis_bits_work_nonzero() {
        assert!(work_from_bits(0x1d00ffff) > U256::zero());
    }
}
