//! SPV verification: Bloom filtering and merkle inclusion proofs.

pub mod bloom;
pub mod merkle;

pub use bloom::BloomFilter;
pub use merkle::MerkleProof;
