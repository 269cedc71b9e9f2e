//! SPV wallet core for an ELA-style UTXO chain.
//!
//! Maintains a light view of a remote blockchain from block headers and
//! Bloom-filtered merkle blocks: verifies that transactions of interest are
//! included in the chain, keeps a rollback-safe UTXO ledger, and builds,
//! signs and broadcasts transactions.
//!
//! # Example
//!
//! ```no_run
//! use spv_wallet::config::Config;
//! use spv_wallet::service::SpvService;
//!
//! # async fn run() -> Result<(), spv_wallet::error::Error> {
//! let config = Config::new(7630401, vec!["127.0.0.1:20866".into()]);
//! let service = SpvService::new(config)?;
//! service.register_account("EJbTbWd8a9rdutUfvBxhcrvEeNy21tW1Ee").await?;
//! service.start()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod service;
pub mod spv;
pub mod storage;
pub mod wallet;

pub use config::Config;
pub use core::{BlockHeader, OutPoint, Transaction, Uint168, Uint256};
pub use error::{Error, Result};
pub use service::{SpvService, TransactionListener};
pub use spv::{BloomFilter, MerkleProof};
pub use storage::ChainStore;
pub use wallet::{KeyPair, Wallet};
