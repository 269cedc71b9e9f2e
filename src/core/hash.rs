//! Fixed-size hash types and hashing helpers.
//!
//! `Uint256` is a 256-bit hash kept big-endian in memory; its text form
//! reverses byte order, matching how block explorers print hashes.
//! `Uint168` is the 21-byte program hash that identifies an address.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// Program hash prefix for standard (single-signature) addresses.
pub const PREFIX_STANDARD: u8 = 0x21;

/// Program hash prefix for multi-signature addresses.
pub const PREFIX_MULTISIG: u8 = 0x12;

/// SHA-256 of the input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA-256, the protocol's hash for headers, transactions and
/// message checksums.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// RIPEMD160 of SHA-256, used to shorten redeem scripts into program hashes.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha256(data));
    ripemd.finalize().into()
}

/// A 256-bit hash (block hash, transaction hash, merkle node).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uint256(pub [u8; 32]);

impl Uint256 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() != 32 {
            return Err(Error::Codec(format!("bad hash length {}", data.len())));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(data);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Hash of arbitrary data via double SHA-256.
    pub fn digest(data: &[u8]) -> Self {
        Self(sha256d(data))
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A 168-bit program hash: prefix byte + RIPEMD160(SHA256(redeem script)).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uint168(pub [u8; 21]);

impl Uint168 {
    pub fn new(bytes: [u8; 21]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() != 21 {
            return Err(Error::Codec(format!(
                "bad program hash length {}",
                data.len()
            )));
        }
        let mut bytes = [0u8; 21];
        bytes.copy_from_slice(data);
        Ok(Self(bytes))
    }

    /// Derive a program hash from a redeem script and a type prefix.
    pub fn from_code(code: &[u8], prefix: u8) -> Self {
        let mut bytes = [0u8; 21];
        bytes[0] = prefix;
        bytes[1..].copy_from_slice(&hash160(code));
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 21] {
        &self.0
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    /// Base58Check address: program hash followed by a 4-byte double-SHA-256
    /// checksum.
    pub fn to_address(&self) -> String {
        let mut data = self.0.to_vec();
        let checksum = sha256d(&data);
        data.extend_from_slice(&checksum[..4]);
        bs58::encode(data).into_string()
    }

    /// Parse and checksum-verify a Base58Check address.
    pub fn from_address(address: &str) -> Result<Self> {
        let data = bs58::decode(address)
            .into_vec()
            .map_err(|_| Error::Config(format!("invalid address {}", address)))?;
        if data.len() != 25 {
            return Err(Error::Config(format!("invalid address {}", address)));
        }
        let checksum = sha256d(&data[..21]);
        if data[21..] != checksum[..4] {
            return Err(Error::Config(format!("bad address checksum {}", address)));
        }
        Self::from_slice(&data[..21]).map_err(|_| Error::Config("bad address".to_string()))
    }
}

impl fmt::Display for Uint168 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_address())
    }
}

impl fmt::Debug for Uint168 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_reverses_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let hash = Uint256::new(bytes);
        let text = hash.to_string();
        assert!(text.ends_with("ab"));
        assert!(text.starts_with("00"));
    }

    #[test]
    fn test_sha256d_known_vector() {
        // double SHA-256 of empty input
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_address_round_trip() {
        let hash = Uint168::from_code(&[0x21, 0xAC], PREFIX_STANDARD);
        let address = hash.to_address();
        let parsed = Uint168::from_address(&address).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_address_checksum_rejected() {
        let hash = Uint168::from_code(&[0x21, 0xAC], PREFIX_STANDARD);
        let mut address = hash.to_address();
        // Corrupt the last character
        let tail = if address.ends_with('1') { '2' } else { '1' };
        address.pop();
        address.push(tail);
        assert!(Uint168::from_address(&address).is_err());
    }

    #[test]
    fn test_from_slice_length_check() {
        assert!(Uint256::from_slice(&[0u8; 31]).is_err());
        assert!(Uint168::from_slice(&[0u8; 20]).is_err());
    }
}
