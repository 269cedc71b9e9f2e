//! Peer manager: outbound dials, handshake, keep-alive and dispatch.
//!
//! Peers post events to a channel the syncer reads; the syncer answers with
//! send intents through per-peer outbound queues. No back-pointers between
//! the two.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time;
use tokio_util::codec::Framed;

use crate::config::{
    Config, DIAL_TIMEOUT, HANDSHAKE_TIMEOUT, INFO_UPDATE_INTERVAL, KEEP_ALIVE_TIMEOUT,
    MAX_PEER_STRIKES,
};
use crate::error::{Error, Result};
use crate::network::addrman::AddrManager;
use crate::network::message::{FrameCodec, Message, VersionMsg, PROTOCOL_VERSION, SERVICE_SPV};
use crate::network::peer::{PeerEvent, PeerHandle, PeerInfo, PeerState};

/// Outbound queue depth per peer.
const OUTBOUND_QUEUE: usize = 64;

/// Dial loop cadence.
const DIAL_INTERVAL: time::Duration = time::Duration::from_secs(3);

/// Owns all outbound connections.
pub struct PeerManager {
    config: Arc<Config>,
    addrman: Arc<AddrManager>,
    peers: RwLock<HashMap<String, PeerInfo>>,
    handles: RwLock<HashMap<String, PeerHandle>>,
    strikes: RwLock<HashMap<String, u32>>,
    events: mpsc::Sender<PeerEvent>,
    local_height: AtomicU64,
    nonce: u64,
    shutdown: watch::Receiver<bool>,
}

impl PeerManager {
    pub fn new(
        config: Arc<Config>,
        addrman: Arc<AddrManager>,
        events: mpsc::Sender<PeerEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            addrman,
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            strikes: RwLock::new(HashMap::new()),
            events,
            local_height: AtomicU64::new(0),
            nonce: rand::random(),
            shutdown,
        })
    }

    pub fn local_height(&self) -> u64 {
        self.local_height.load(Ordering::Relaxed)
    }

    pub fn set_local_height(&self, height: u64) {
        self.local_height.store(height, Ordering::Relaxed);
    }

    /// Spawn the dial and keep-alive loops.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move { manager.dial_loop().await });
        let manager = self.clone();
        tokio::spawn(async move { manager.keep_alive_loop().await });
    }

    /// Disconnect every peer; called on shutdown.
    pub async fn stop(&self) {
        let addrs: Vec<String> = self.peers.read().await.keys().cloned().collect();
        for addr in addrs {
            self.disconnect(&addr).await;
        }
    }

    async fn dial_loop(self: Arc<Self>) {
        let mut ticker = time::interval(DIAL_INTERVAL);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }

            let (established, total) = {
                let peers = self.peers.read().await;
                let established = peers
                    .values()
                    .filter(|p| p.state == PeerState::Establish)
                    .count();
                (established, peers.len())
            };
            if established >= self.config.min_outbound || total >= self.config.max_connections {
                continue;
            }

            for seed in self.addrman.idle(self.config.min_outbound - established) {
                let addr = self.config.seed_addr(&seed);
                let manager = self.clone();
                tokio::spawn(async move { manager.connect(addr).await });
            }
        }
    }

    async fn connect(self: Arc<Self>, addr: String) {
        if self.peers.read().await.contains_key(&addr) {
            return;
        }
        self.peers
            .write()
            .await
            .insert(addr.clone(), PeerInfo::new(addr.clone()));

        let stream = match time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::debug!("dial {} failed: {}", addr, e);
                self.peers.write().await.remove(&addr);
                self.strike(&addr).await;
                return;
            }
            Err(_) => {
                log::debug!("dial {} timed out", addr);
                self.peers.write().await.remove(&addr);
                self.strike(&addr).await;
                return;
            }
        };
        log::info!("connected to {}", addr);
        self.addrman.add(&addr);

        let framed = Framed::new(stream, FrameCodec::new(self.config.magic));
        let (mut sink, mut stream) = framed.split();

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        self.handles
            .write()
            .await
            .insert(addr.clone(), PeerHandle::new(addr.clone(), tx));

        // Write half: drains the outbound queue.
        let write_addr = addr.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    log::debug!("send to {} failed: {}", write_addr, e);
                    break;
                }
            }
        });

        // Kick off the handshake.
        let version = Message::Version(VersionMsg {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: Utc::now().timestamp(),
            port: 0,
            nonce: self.nonce,
            height: self.local_height(),
            relay: 0,
        });
        if self.send_to(&addr, version).await.is_err() {
            self.disconnect(&addr).await;
            return;
        }
        self.set_state(&addr, PeerState::Hand).await;

        // Handshake watchdog.
        let watchdog = self.clone();
        let watchdog_addr = addr.clone();
        tokio::spawn(async move {
            time::sleep(HANDSHAKE_TIMEOUT).await;
            let state = watchdog.peer_state(&watchdog_addr).await;
            if matches!(state, Some(PeerState::Init | PeerState::Hand | PeerState::Handshake)) {
                log::info!("handshake with {} timed out", watchdog_addr);
                watchdog.strike(&watchdog_addr).await;
                watchdog.disconnect(&watchdog_addr).await;
            }
        });

        // Read half: strictly ordered per-peer dispatch.
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        if let Err(e) = self.handle_message(&addr, message).await {
                            log::warn!("peer {}: {}", addr, e);
                            if e.is_peer_fault() {
                                self.strike(&addr).await;
                            }
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("peer {}: {}", addr, e);
                        self.strike(&addr).await;
                        break;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        self.disconnect(&addr).await;
    }

    /// Apply one inbound message against the peer's state machine.
    pub async fn handle_message(&self, addr: &str, message: Message) -> Result<()> {
        let state = {
            let mut peers = self.peers.write().await;
            let peer = peers
                .get_mut(addr)
                .ok_or_else(|| Error::Protocol(format!("unknown peer {}", addr)))?;
            peer.touch();
            peer.state
        };

        match (state, message) {
            (PeerState::Hand, Message::Version(version)) => {
                self.accept_version(addr, &version)?;
                {
                    let mut peers = self.peers.write().await;
                    if let Some(peer) = peers.get_mut(addr) {
                        peer.version = version.version;
                        peer.services = version.services;
                        peer.height = version.height;
                        peer.state = PeerState::Handshake;
                    }
                }
                self.send_to(addr, Message::VerAck).await
            }
            (PeerState::Handshake, Message::VerAck) => {
                let height = {
                    let mut peers = self.peers.write().await;
                    let peer = peers
                        .get_mut(addr)
                        .ok_or_else(|| Error::Protocol(format!("unknown peer {}", addr)))?;
                    peer.state = PeerState::Establish;
                    peer.height
                };
                log::info!("handshake with {} complete, height {}", addr, height);
                self.strikes.write().await.remove(addr);
                let _ = self
                    .events
                    .send(PeerEvent::Connected {
                        addr: addr.to_string(),
                        height,
                    })
                    .await;
                Ok(())
            }
            (PeerState::Establish, Message::Ping { height }) => {
                self.set_peer_height(addr, height).await;
                self.send_to(
                    addr,
                    Message::Pong {
                        height: self.local_height(),
                    },
                )
                .await
            }
            (PeerState::Establish, Message::Pong { height }) => {
                self.set_peer_height(addr, height).await;
                Ok(())
            }
            (PeerState::Establish, Message::Addr(addrs)) => {
                for learned in addrs {
                    self.addrman.learn(&learned);
                }
                Ok(())
            }
            (PeerState::Establish, Message::GetAddr) => {
                // Client side: nothing to share.
                Ok(())
            }
            (PeerState::Establish, message) => {
                let _ = self
                    .events
                    .send(PeerEvent::Message {
                        addr: addr.to_string(),
                        message,
                    })
                    .await;
                Ok(())
            }
            (state, message) => Err(Error::Protocol(format!(
                "unexpected {} in state {:?}",
                message.command(),
                state
            ))),
        }
    }

    fn accept_version(&self, addr: &str, version: &VersionMsg) -> Result<()> {
        if version.version < PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "peer {} version {} below {}",
                addr, version.version, PROTOCOL_VERSION
            )));
        }
        if version.services & SERVICE_SPV == 0 {
            return Err(Error::Protocol(format!(
                "peer {} does not serve SPV clients",
                addr
            )));
        }
        if version.nonce == self.nonce {
            return Err(Error::Protocol("connected to self".to_string()));
        }
        Ok(())
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let mut ticker = time::interval(INFO_UPDATE_INTERVAL);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }

            let idle_limit = INFO_UPDATE_INTERVAL * KEEP_ALIVE_TIMEOUT;
            let mut stale = Vec::new();
            let mut live = Vec::new();
            {
                let peers = self.peers.read().await;
                for peer in peers.values() {
                    if peer.state != PeerState::Establish {
                        continue;
                    }
                    if peer.last_active.elapsed() > idle_limit {
                        stale.push(peer.addr.clone());
                    } else {
                        live.push(peer.addr.clone());
                    }
                }
            }
            for addr in stale {
                log::info!("disconnecting idle peer {}", addr);
                self.disconnect(&addr).await;
            }
            let ping = Message::Ping {
                height: self.local_height(),
            };
            for addr in live {
                let _ = self.send_to(&addr, ping.clone()).await;
            }
        }
    }

    /// Record a strike against an address; three strikes discard it from the
    /// address cache.
    pub async fn strike(&self, addr: &str) {
        let mut strikes = self.strikes.write().await;
        let count = strikes.entry(addr.to_string()).or_insert(0);
        *count += 1;
        if *count >= MAX_PEER_STRIKES {
            strikes.remove(addr);
            drop(strikes);
            self.addrman.discard(addr);
        }
    }

    pub async fn disconnect(&self, addr: &str) {
        let removed = {
            let mut peers = self.peers.write().await;
            peers.remove(addr)
        };
        self.handles.write().await.remove(addr);
        self.addrman.disconnected(addr);
        if let Some(mut peer) = removed {
            peer.state = PeerState::Closed;
            log::info!("peer {} closed", addr);
            let _ = self
                .events
                .send(PeerEvent::Disconnected {
                    addr: addr.to_string(),
                })
                .await;
        }
    }

    /// Disconnect for misbehavior: strike first, then close.
    pub async fn punish(&self, addr: &str, reason: &str) {
        log::warn!("peer {} misbehaved: {}", addr, reason);
        self.strike(addr).await;
        self.disconnect(addr).await;
    }

    pub async fn send_to(&self, addr: &str, message: Message) -> Result<()> {
        let handle = {
            let handles = self.handles.read().await;
            handles.get(addr).cloned()
        };
        match handle {
            Some(handle) => handle.send(message).await,
            None => Err(Error::Protocol(format!("peer {} gone", addr))),
        }
    }

    /// Send to every ESTABLISH peer.
    pub async fn broadcast(&self, message: Message) {
        for (addr, _) in self.established().await {
            let _ = self.send_to(&addr, message.clone()).await;
        }
    }

    /// Addresses and reported heights of all ESTABLISH peers.
    pub async fn established(&self) -> Vec<(String, u64)> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Establish)
            .map(|p| (p.addr.clone(), p.height))
            .collect()
    }

    /// The ESTABLISH peer reporting the greatest height.
    pub async fn best_peer(&self) -> Option<(String, u64)> {
        self.established()
            .await
            .into_iter()
            .max_by_key(|(_, height)| *height)
    }

    async fn peer_state(&self, addr: &str) -> Option<PeerState> {
        self.peers.read().await.get(addr).map(|p| p.state)
    }

    async fn set_state(&self, addr: &str, state: PeerState) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.state = state;
        }
    }

    async fn set_peer_height(&self, addr: &str, height: u64) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.height = height;
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_test_peer(
        &self,
        addr: &str,
        state: PeerState,
    ) -> mpsc::Receiver<Message> {
        let mut info = PeerInfo::new(addr.to_string());
        info.state = state;
        self.peers.write().await.insert(addr.to_string(), info);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.handles
            .write()
            .await
            .insert(addr.to_string(), PeerHandle::new(addr.to_string(), tx));
        rx
    }
}
