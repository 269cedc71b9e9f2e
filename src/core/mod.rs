//! Shared chain primitives: hashes, serialization, headers and transactions.

pub mod hash;
pub mod header;
pub mod serialize;
pub mod transaction;

pub use hash::{Uint168, Uint256};
pub use header::BlockHeader;
pub use serialize::Serializable;
pub use transaction::{OutPoint, Transaction, TransactionBuilder, TxInput, TxOutput};
