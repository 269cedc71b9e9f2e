//! Persistent state: header store, proof store and the wallet ledger.
//!
//! `ChainStore` is the single entry point for compound mutations. It always
//! touches the stores in the fixed order headers → proofs → ledger, which is
//! the crate-wide lock order.

pub mod headers;
pub mod ledger;
pub mod proofs;

pub use headers::{HeaderStore, StoredHeader};
pub use ledger::{Addr, Ledger, StoreTx, Stxo, Utxo};
pub use proofs::ProofStore;

use std::path::Path;

use crate::core::hash::Uint256;
use crate::core::transaction::Transaction;
use crate::error::{Error, Result};
use crate::spv::merkle::MerkleProof;

/// The three stores behind one facade.
pub struct ChainStore {
    headers: HeaderStore,
    proofs: ProofStore,
    ledger: Ledger,
}

impl ChainStore {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            headers: HeaderStore::open(dir.join("headers"))?,
            proofs: ProofStore::open(dir.join("proofs"))?,
            ledger: Ledger::open(dir.join("ledger.db"))?,
        })
    }

    /// Fully in-memory stores for tests.
    pub fn memory() -> Result<Self> {
        Ok(Self {
            headers: HeaderStore::memory()?,
            proofs: ProofStore::memory()?,
            ledger: Ledger::memory()?,
        })
    }

    pub fn headers(&self) -> &HeaderStore {
        &self.headers
    }

    pub fn proofs(&self) -> &ProofStore {
        &self.proofs
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The active tip, if any block has been connected yet.
    pub fn tip(&self) -> Option<StoredHeader> {
        match self.headers.tip() {
            Ok(stored) => Some(stored),
            Err(_) => None,
        }
    }

    pub fn chain_height(&self) -> u32 {
        self.ledger.chain_height()
    }

    /// Connect a block to the active chain: persist header and proof, apply
    /// its transactions to the ledger and advance the chain height. Returns
    /// the hashes of transactions that touched the wallet.
    pub fn connect_block(
        &self,
        stored: &StoredHeader,
        proof: &MerkleProof,
        txs: &[Transaction],
    ) -> Result<Vec<Uint256>> {
        let hash = stored.hash();
        let height = stored.height();

        self.headers.put(stored)?;
        self.headers.set_chain_entry(height, &hash)?;
        self.headers.set_tip(&hash)?;
        self.proofs.put(proof)?;

        let mut relevant = Vec::new();
        for tx in txs {
            if self.ledger.apply_tx(tx, height)? {
                relevant.push(tx.hash());
            }
        }
        self.ledger.set_chain_height(height)?;
        Ok(relevant)
    }

    /// Persist a header that is not (yet) on the active chain.
    pub fn put_side_header(&self, stored: &StoredHeader, proof: &MerkleProof) -> Result<()> {
        self.headers.put(stored)?;
        self.proofs.put(proof)
    }

    /// Disconnect the block at `height` from the active chain and revert its
    /// ledger effects.
    pub fn rollback_block(&self, height: u32) -> Result<()> {
        self.headers.clear_chain_entry(height)?;
        self.ledger.rollback(height)
    }

    /// Point the active chain at a new tip.
    pub fn set_tip(&self, stored: &StoredHeader) -> Result<()> {
        self.headers.set_tip(&stored.hash())?;
        self.ledger.set_chain_height(stored.height())
    }

    /// Log-sparse block locator from the active tip: the last ten blocks,
    /// then exponentially increasing steps back to genesis.
    pub fn locator(&self) -> Vec<Uint256> {
        let tip = match self.tip() {
            Some(tip) => tip,
            None => return Vec::new(),
        };
        let mut hashes = Vec::new();
        let mut height = tip.height() as i64;
        let mut step = 1i64;
        while height >= 0 {
            if let Ok(hash) = self.headers.hash_at(height as u32) {
                hashes.push(hash);
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        if let Ok(genesis) = self.headers.hash_at(0) {
            if hashes.last() != Some(&genesis) {
                hashes.push(genesis);
            }
        }
        hashes
    }

    /// Empty every store, headers first.
    pub fn reset(&self) -> Result<()> {
        self.headers.reset()?;
        self.proofs.reset()?;
        self.ledger.reset()
    }

    pub fn flush(&self) -> Result<()> {
        self.headers.flush()?;
        self.proofs.flush()
    }

    /// Whether a header is known, on any branch.
    pub fn has_header(&self, hash: &Uint256) -> bool {
        self.headers.contains(hash).unwrap_or(false)
    }

    pub fn get_header(&self, hash: &Uint256) -> Result<StoredHeader> {
        self.headers.get(hash)
    }

    /// Locate the fork point between the active chain and the branch ending
    /// at `stored`: walk the branch back until a block on the active chain
    /// is found. Returns the fork header.
    pub fn find_fork(&self, stored: &StoredHeader) -> Result<StoredHeader> {
        let mut cursor = stored.clone();
        loop {
            if self.headers.is_active(&cursor)? {
                return Ok(cursor);
            }
            if cursor.height() == 0 {
                return Err(Error::Protocol("branch does not connect".to_string()));
            }
            cursor = self.headers.get(&cursor.header.prev)?;
        }
    }
}
