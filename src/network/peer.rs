//! Peer connection state.

use std::time::Instant;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::network::message::Message;

/// Handshake state machine. Only ESTABLISH peers receive application
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// TCP connected, nothing sent yet.
    Init,
    /// Our `version` is out, waiting for the peer's.
    Hand,
    /// Peer's `version` accepted and `verack` sent, waiting for theirs.
    Handshake,
    /// Handshake complete.
    Establish,
    /// Connection torn down.
    Closed,
}

/// Bookkeeping for one connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: String,
    pub state: PeerState,
    pub version: u32,
    pub services: u64,
    pub height: u64,
    pub last_active: Instant,
}

impl PeerInfo {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            state: PeerState::Init,
            version: 0,
            services: 0,
            height: 0,
            last_active: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// Events surfaced to the syncer, in per-peer arrival order.
#[derive(Debug)]
pub enum PeerEvent {
    /// A peer reached ESTABLISH, reporting its chain height.
    Connected { addr: String, height: u64 },
    /// A peer was disconnected.
    Disconnected { addr: String },
    /// An application message from an ESTABLISH peer.
    Message { addr: String, message: Message },
}

/// Sender half of a peer's outbound queue.
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: String,
    tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn new(addr: String, tx: mpsc::Sender<Message>) -> Self {
        Self { addr, tx }
    }

    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Protocol(format!("peer {} gone", self.addr)))
    }

    /// Queue a message without waiting; drops if the peer is gone.
    pub fn try_send(&self, message: Message) {
        if let Err(e) = self.tx.try_send(message) {
            log::debug!("dropping message for {}: {}", self.addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peer_starts_init() {
        let info = PeerInfo::new("1.2.3.4:20866".into());
        assert_eq!(info.state, PeerState::Init);
        assert_eq!(info.height, 0);
    }

    #[tokio::test]
    async fn test_handle_send_fails_after_drop() {
        let (tx, rx) = mpsc::channel(1);
        let handle = PeerHandle::new("a:1".into(), tx);
        drop(rx);
        assert!(handle.send(Message::VerAck).await.is_err());
    }
}
