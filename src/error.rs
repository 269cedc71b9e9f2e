//! Crate-wide error type.
//!
//! One enum covers every failure kind the service can surface, so the
//! embedding front-end can map each kind to a distinct exit code.

use thiserror::Error;

/// All error kinds surfaced by the SPV wallet.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer misbehavior: {0}")]
    PeerMisbehavior(String),
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Distinct nonzero exit code per kind, for the CLI front-end.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Io(_) => 3,
            Error::Codec(_) => 4,
            Error::Protocol(_) => 5,
            Error::PeerMisbehavior(_) => 6,
            Error::InsufficientFunds { .. } => 7,
            Error::InvalidSignature => 8,
            Error::NotFound(_) => 9,
            Error::AlreadyExists(_) => 10,
            Error::Rejected(_) => 11,
            Error::Shutdown => 12,
        }
    }

    /// Errors caused by a misbehaving or incompatible peer. These disconnect
    /// the peer and are never propagated to the caller.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Error::Codec(_) | Error::Protocol(_) | Error::PeerMisbehavior(_)
        )
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound("no rows".to_string()),
            other => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
        }
    }
}
