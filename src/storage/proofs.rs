//! Proof store: merkle proofs keyed by block hash.

use sled::{Db, Tree};
use std::path::Path;

use crate::core::hash::Uint256;
use crate::core::serialize::Serializable;
use crate::error::{Error, Result};
use crate::spv::merkle::MerkleProof;

const TREE_PROOFS: &str = "Proofs";

/// Sled-backed proof store.
pub struct ProofStore {
    db: Db,
    proofs: Tree,
}

impl ProofStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store for tests.
    pub fn memory() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        let proofs = db.open_tree(TREE_PROOFS)?;
        Ok(Self { db, proofs })
    }

    pub fn put(&self, proof: &MerkleProof) -> Result<()> {
        self.proofs
            .insert(proof.block_hash.as_bytes(), proof.to_bytes())?;
        Ok(())
    }

    pub fn get(&self, block_hash: &Uint256) -> Result<MerkleProof> {
        match self.proofs.get(block_hash.as_bytes())? {
            Some(bytes) => MerkleProof::from_bytes(&bytes)
                .map_err(|e| Error::Codec(format!("corrupt proof record: {}", e))),
            None => Err(Error::NotFound(format!("proof {}", block_hash))),
        }
    }

    pub fn delete(&self, block_hash: &Uint256) -> Result<()> {
        self.proofs.remove(block_hash.as_bytes())?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.proofs.clear()?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof() -> MerkleProof {
        let ids: Vec<Uint256> = (0..4)
            .map(|i: u32| Uint256::digest(&i.to_le_bytes()))
            .collect();
        let matched = vec![false, true, false, false];
        MerkleProof::create(Uint256::digest(b"block"), 9, &ids, &matched).0
    }

    #[test]
    fn test_put_get_delete() {
        let store = ProofStore::memory().unwrap();
        let proof = sample_proof();
        store.put(&proof).unwrap();

        assert_eq!(store.get(&proof.block_hash).unwrap(), proof);

        store.delete(&proof.block_hash).unwrap();
        assert!(matches!(
            store.get(&proof.block_hash),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let store = ProofStore::memory().unwrap();
        assert!(matches!(
            store.get(&Uint256::digest(b"missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_reset() {
        let store = ProofStore::memory().unwrap();
        let proof = sample_proof();
        store.put(&proof).unwrap();
        store.reset().unwrap();
        assert!(matches!(
            store.get(&proof.block_hash),
            Err(Error::NotFound(_))
        ));
    }
}
