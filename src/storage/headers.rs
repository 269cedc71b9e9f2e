//! Header store: append-only headers keyed by hash, plus the active-chain
//! index and tip pointer.
//!
//! Tree `Headers` maps hash → stored header (header + cumulative work);
//! tree `Chain` holds the `Tip` key and 4-byte big-endian height → hash
//! entries for the active chain.

use primitive_types::U256;
use sled::{Db, Tree};
use std::io::{self, Read, Write};
use std::path::Path;

use crate::core::hash::Uint256;
use crate::core::header::BlockHeader;
use crate::core::serialize::Serializable;
use crate::error::{Error, Result};

const TREE_HEADERS: &str = "Headers";
const TREE_CHAIN: &str = "Chain";
const KEY_TIP: &[u8] = b"Tip";

/// A header plus the cumulative work of the chain ending at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHeader {
    pub header: BlockHeader,
    pub total_work: U256,
}

impl StoredHeader {
    pub fn hash(&self) -> Uint256 {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }
}

impl Serializable for StoredHeader {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.header.serialize(writer)?;
        let mut work = [0u8; 32];
        self.total_work.to_big_endian(&mut work);
        writer.write_all(&work)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let header = BlockHeader::deserialize(reader)?;
        let mut work = [0u8; 32];
        reader.read_exact(&mut work)?;
        Ok(Self {
            header,
            total_work: U256::from_big_endian(&work),
        })
    }
}

/// Sled-backed header store.
pub struct HeaderStore {
    db: Db,
    headers: Tree,
    chain: Tree,
}

impl HeaderStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store for tests.
    pub fn memory() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        let headers = db.open_tree(TREE_HEADERS)?;
        let chain = db.open_tree(TREE_CHAIN)?;
        Ok(Self { db, headers, chain })
    }

    /// Persist a header by hash.
    pub fn put(&self, stored: &StoredHeader) -> Result<()> {
        self.headers
            .insert(stored.hash().as_bytes(), stored.to_bytes())?;
        Ok(())
    }

    pub fn get(&self, hash: &Uint256) -> Result<StoredHeader> {
        match self.headers.get(hash.as_bytes())? {
            Some(bytes) => StoredHeader::from_bytes(&bytes)
                .map_err(|e| Error::Codec(format!("corrupt header record: {}", e))),
            None => Err(Error::NotFound(format!("header {}", hash))),
        }
    }

    pub fn contains(&self, hash: &Uint256) -> Result<bool> {
        Ok(self.headers.contains_key(hash.as_bytes())?)
    }

    /// Hash of the active-chain block at the given height.
    pub fn hash_at(&self, height: u32) -> Result<Uint256> {
        match self.chain.get(height.to_be_bytes())? {
            Some(bytes) => Uint256::from_slice(&bytes),
            None => Err(Error::NotFound(format!("height {}", height))),
        }
    }

    /// Active-chain header at the given height.
    pub fn at_height(&self, height: u32) -> Result<StoredHeader> {
        let hash = self.hash_at(height)?;
        self.get(&hash)
    }

    /// Put the active-chain index entry for a height.
    pub fn set_chain_entry(&self, height: u32, hash: &Uint256) -> Result<()> {
        self.chain.insert(height.to_be_bytes(), hash.as_bytes().as_slice())?;
        Ok(())
    }

    /// Remove the active-chain index entry for a height (rollback).
    pub fn clear_chain_entry(&self, height: u32) -> Result<()> {
        self.chain.remove(height.to_be_bytes())?;
        Ok(())
    }

    pub fn set_tip(&self, hash: &Uint256) -> Result<()> {
        self.chain.insert(KEY_TIP, hash.as_bytes().as_slice())?;
        Ok(())
    }

    pub fn tip(&self) -> Result<StoredHeader> {
        match self.chain.get(KEY_TIP)? {
            Some(bytes) => {
                let hash = Uint256::from_slice(&bytes)?;
                self.get(&hash)
            }
            None => Err(Error::NotFound("chain tip".to_string())),
        }
    }

    /// Whether the given hash sits on the active chain.
    pub fn is_active(&self, stored: &StoredHeader) -> Result<bool> {
        match self.hash_at(stored.height()) {
            Ok(hash) => Ok(hash == stored.hash()),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Empty both trees and flush before returning.
    pub fn reset(&self) -> Result<()> {
        self.headers.clear()?;
        self.chain.clear()?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
