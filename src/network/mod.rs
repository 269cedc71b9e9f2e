//! Networking: wire codec, address book, peer manager and chain syncer.

pub mod addrman;
pub mod manager;
pub mod message;
pub mod peer;
pub mod sync;

pub use addrman::AddrManager;
pub use manager::PeerManager;
pub use message::Message;
pub use peer::{PeerEvent, PeerState};
pub use sync::ChainSyncer;
