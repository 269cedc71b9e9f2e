//! Keys, accounts and transaction construction.

pub mod keys;
pub mod wallet;

pub use keys::KeyPair;
pub use wallet::{Output, Wallet};
