//! Partial merkle trees: inclusion proofs carried by `merkleblock`.
//!
//! A proof encodes a depth-first walk of the block's merkle tree as a flag
//! bitset plus the node hashes the walk needs. Re-walking the tree yields
//! both the root and the set of matched transaction hashes; the matched set
//! is always recomputed, never trusted from the wire.

use std::io::{self, Read, Write};

use crate::core::hash::{sha256d, Uint256};
use crate::core::serialize::{
    read_hash, read_u32, read_var_bytes, read_varint, write_hash, write_u32, write_var_bytes,
    write_varint, Serializable,
};
use crate::error::{Error, Result};

/// Upper bound on transactions per block, to reject absurd proofs early.
const MAX_TX_PER_BLOCK: u32 = 1_000_000;

/// A merkle inclusion proof for one block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MerkleProof {
    pub block_hash: Uint256,
    pub height: u32,
    pub total_tx: u32,
    pub hashes: Vec<Uint256>,
    pub flags: Vec<u8>,
}

impl MerkleProof {
    /// Build a proof for the given transaction set, marking the entries of
    /// `matched` that are true. Returns the proof and the merkle root it
    /// commits to.
    pub fn create(
        block_hash: Uint256,
        height: u32,
        tx_ids: &[Uint256],
        matched: &[bool],
    ) -> (Self, Uint256) {
        assert_eq!(tx_ids.len(), matched.len());
        let mut proof = Self {
            block_hash,
            height,
            total_tx: tx_ids.len() as u32,
            hashes: Vec::new(),
            flags: Vec::new(),
        };
        let mut bits = Vec::new();
        let tree_height = proof.tree_height();
        let root = proof.build(tree_height, 0, tx_ids, matched, &mut bits);
        proof.flags = pack_bits(&bits);
        (proof, root)
    }

    /// Walk the partial tree, returning the recomputed root and the matched
    /// transaction hashes in tree order. Any structural defect is a
    /// `PeerMisbehavior` error.
    pub fn extract_matches(&self) -> Result<(Uint256, Vec<Uint256>)> {
        if self.total_tx == 0 || self.total_tx > MAX_TX_PER_BLOCK {
            return Err(Error::PeerMisbehavior(format!(
                "merkle proof with {} transactions",
                self.total_tx
            )));
        }
        if self.hashes.len() > self.total_tx as usize {
            return Err(Error::PeerMisbehavior(
                "merkle proof has more hashes than transactions".to_string(),
            ));
        }
        if self.flags.is_empty() {
            return Err(Error::PeerMisbehavior("merkle proof without flags".to_string()));
        }

        let mut walker = TreeWalker {
            proof: self,
            bits_used: 0,
            hashes_used: 0,
        };
        let mut matches = Vec::new();
        let root = walker.traverse(self.tree_height(), 0, &mut matches)?;

        // Every hash and every flag byte must have been consumed.
        if walker.hashes_used != self.hashes.len() {
            return Err(Error::PeerMisbehavior(
                "merkle proof with unused hashes".to_string(),
            ));
        }
        if (walker.bits_used + 7) / 8 != self.flags.len() {
            return Err(Error::PeerMisbehavior(
                "merkle proof with unused flag bits".to_string(),
            ));
        }
        Ok((root, matches))
    }

    /// Height of the tree: the smallest level that is one node wide.
    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.width(height) > 1 {
            height += 1;
        }
        height
    }

    /// Number of nodes at the given level.
    fn width(&self, height: u32) -> u32 {
        (self.total_tx + (1 << height) - 1) >> height
    }

    fn build(
        &mut self,
        height: u32,
        pos: u32,
        tx_ids: &[Uint256],
        matched: &[bool],
        bits: &mut Vec<bool>,
    ) -> Uint256 {
        let parent_of_match = self.subtree_has_match(height, pos, matched);
        bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            let hash = self.node_hash(height, pos, tx_ids);
            self.hashes.push(hash);
            hash
        } else {
            let left = self.build(height - 1, pos * 2, tx_ids, matched, bits);
            let right = if pos * 2 + 1 < self.width(height - 1) {
                self.build(height - 1, pos * 2 + 1, tx_ids, matched, bits)
            } else {
                left
            };
            hash_pair(&left, &right)
        }
    }

    fn subtree_has_match(&self, height: u32, pos: u32, matched: &[bool]) -> bool {
        let first = (pos << height) as usize;
        let last = (((pos + 1) << height) as usize).min(matched.len());
        matched[first..last].iter().any(|&m| m)
    }

    fn node_hash(&self, height: u32, pos: u32, tx_ids: &[Uint256]) -> Uint256 {
        if height == 0 {
            tx_ids[pos as usize]
        } else {
            let left = self.node_hash(height - 1, pos * 2, tx_ids);
            let right = if pos * 2 + 1 < self.width(height - 1) {
                self.node_hash(height - 1, pos * 2 + 1, tx_ids)
            } else {
                left
            };
            hash_pair(&left, &right)
        }
    }
}

impl Serializable for MerkleProof {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_hash(writer, &self.block_hash)?;
        write_u32(writer, self.height)?;
        write_u32(writer, self.total_tx)?;
        write_varint(writer, self.hashes.len() as u64)?;
        for hash in &self.hashes {
            write_hash(writer, hash)?;
        }
        write_var_bytes(writer, &self.flags)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let block_hash = read_hash(reader)?;
        let height = read_u32(reader)?;
        let total_tx = read_u32(reader)?;
        let count = read_varint(reader)?;
        if count > MAX_TX_PER_BLOCK as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "merkle proof hash count too large",
            ));
        }
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            hashes.push(read_hash(reader)?);
        }
        let flags = read_var_bytes(reader)?;
        Ok(Self {
            block_hash,
            height,
            total_tx,
            hashes,
            flags,
        })
    }
}

struct TreeWalker<'a> {
    proof: &'a MerkleProof,
    bits_used: usize,
    hashes_used: usize,
}

impl TreeWalker<'_> {
    fn traverse(&mut self, height: u32, pos: u32, matches: &mut Vec<Uint256>) -> Result<Uint256> {
        let flag = self.next_bit()?;
        if height == 0 || !flag {
            let hash = self.next_hash()?;
            if height == 0 && flag {
                matches.push(hash);
            }
            return Ok(hash);
        }
        let left = self.traverse(height - 1, pos * 2, matches)?;
        let right = if pos * 2 + 1 < self.proof.width(height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1, matches)?;
            // Duplicated interior nodes would let the root be forged.
            if right == left {
                return Err(Error::PeerMisbehavior(
                    "merkle proof with duplicated node".to_string(),
                ));
            }
            right
        } else {
            left
        };
        Ok(hash_pair(&left, &right))
    }

    fn next_bit(&mut self) -> Result<bool> {
        let byte = self.bits_used / 8;
        if byte >= self.proof.flags.len() {
            return Err(Error::PeerMisbehavior(
                "merkle proof flag bits exhausted".to_string(),
            ));
        }
        let bit = self.proof.flags[byte] & (1 << (self.bits_used % 8)) != 0;
        self.bits_used += 1;
        Ok(bit)
    }

    fn next_hash(&mut self) -> Result<Uint256> {
        let hash = self
            .proof
            .hashes
            .get(self.hashes_used)
            .copied()
            .ok_or_else(|| Error::PeerMisbehavior("merkle proof hashes exhausted".to_string()))?;
        self.hashes_used += 1;
        Ok(hash)
    }
}

fn hash_pair(left: &Uint256, right: &Uint256) -> Uint256 {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(left.as_bytes());
    data.extend_from_slice(right.as_bytes());
    Uint256::new(sha256d(&data))
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_ids(n: usize) -> Vec<Uint256> {
        (0..n)
            .map(|i| Uint256::digest(format!("tx {}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_proof_round_trip_wire() {
        let ids = tx_ids(5);
        let mut matched = vec![false; 5];
        matched[2] = true;
        let (proof, _) = MerkleProof::create(Uint256::digest(b"block"), 3, &ids, &matched);
        let decoded = MerkleProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(proof, decoded);
    }

    #[test]
    fn test_single_match_verifies() {
        let ids = tx_ids(7);
        let mut matched = vec![false; 7];
        matched[4] = true;
        let (proof, root) = MerkleProof::create(Uint256::digest(b"block"), 1, &ids, &matched);

        let (computed, matches) = proof.extract_matches().unwrap();
        assert_eq!(computed, root);
        assert_eq!(matches, vec![ids[4]]);
    }

    #[test]
    fn test_multiple_matches_in_order() {
        let ids = tx_ids(9);
        let mut matched = vec![false; 9];
        matched[0] = true;
        matched[5] = true;
        matched[8] = true;
        let (proof, root) = MerkleProof::create(Uint256::digest(b"block"), 1, &ids, &matched);

        let (computed, matches) = proof.extract_matches().unwrap();
        assert_eq!(computed, root);
        assert_eq!(matches, vec![ids[0], ids[5], ids[8]]);
    }

    #[test]
    fn test_no_match_still_produces_root() {
        let ids = tx_ids(4);
        let matched = vec![false; 4];
        let (proof, root) = MerkleProof::create(Uint256::digest(b"block"), 1, &ids, &matched);

        let (computed, matches) = proof.extract_matches().unwrap();
        assert_eq!(computed, root);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_single_tx_block() {
        let ids = tx_ids(1);
        let (proof, root) = MerkleProof::create(Uint256::digest(b"block"), 1, &ids, &[true]);

        let (computed, matches) = proof.extract_matches().unwrap();
        assert_eq!(computed, root);
        assert_eq!(computed, ids[0]);
        assert_eq!(matches, vec![ids[0]]);
    }

    #[test]
    fn test_tampered_hash_changes_root() {
        let ids = tx_ids(6);
        let mut matched = vec![false; 6];
        matched[1] = true;
        let (mut proof, root) = MerkleProof::create(Uint256::digest(b"block"), 1, &ids, &matched);
        proof.hashes[0] = Uint256::digest(b"tampered");

        match proof.extract_matches() {
            Ok((computed, _)) => assert_ne!(computed, root),
            Err(Error::PeerMisbehavior(_)) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_empty_proof_rejected() {
        let proof = MerkleProof::default();
        assert!(matches!(
            proof.extract_matches(),
            Err(Error::PeerMisbehavior(_))
        ));
    }

    #[test]
    fn test_excess_hashes_rejected() {
        let ids = tx_ids(4);
        let mut matched = vec![false; 4];
        matched[0] = true;
        let (mut proof, _) = MerkleProof::create(Uint256::digest(b"block"), 1, &ids, &matched);
        proof.hashes.push(Uint256::digest(b"extra"));
        assert!(matches!(
            proof.extract_matches(),
            Err(Error::PeerMisbehavior(_))
        ));
    }
}
