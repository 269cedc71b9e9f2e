//! The SPV service facade and transaction listener fan-out.
//!
//! Embedders register accounts and listeners, start the service, and get
//! notified when transactions of interest confirm or roll back. A slow
//! listener never blocks the syncer: each listener drains its own bounded
//! queue, and on overflow the stream degrades to a rollback-plus-latest
//! summary.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time;

use crate::config::Config;
use crate::core::hash::{Uint168, Uint256};
use crate::core::transaction::Transaction;
use crate::error::{Error, Result};
use crate::network::addrman::{AddrManager, CACHE_FILE};
use crate::network::manager::PeerManager;
use crate::network::message::{InvType, Message};
use crate::network::peer::PeerEvent;
use crate::network::sync::{build_filter, ChainSyncer, OutgoingTxs, RejectLog};
use crate::spv::merkle::MerkleProof;
use crate::storage::ledger::{addr_type, Addr};
use crate::storage::ChainStore;
use crate::wallet::wallet::is_ready_to_send;

/// Callbacks for transactions touching registered accounts.
pub trait TransactionListener: Send + Sync + 'static {
    /// Restrict notifications to one transaction type, or `None` for all.
    fn tx_type(&self) -> Option<u8> {
        None
    }

    /// Whether to wait for confirmation depth before notifying.
    fn confirmed(&self) -> bool;

    /// A matching transaction, with the proof of its inclusion.
    fn notify(&self, proof: &MerkleProof, tx: &Transaction);

    /// The block at `height` was rolled back.
    fn rollback(&self, height: u32);
}

/// Per-listener queue depth.
const LISTENER_QUEUE: usize = 64;

/// How long `send_transaction` watches for a peer rejection.
const REJECT_WINDOW: time::Duration = time::Duration::from_secs(2);

enum Notification {
    Transaction { proof: MerkleProof, tx: Transaction },
    Rollback(u32),
}

struct ListenerEntry {
    tx_type: Option<u8>,
    confirmed: bool,
    sender: mpsc::Sender<Notification>,
    overflowed: AtomicBool,
    latest_height: AtomicU32,
}

impl ListenerEntry {
    /// Queue a notification without blocking. When the queue is full the
    /// listener is marked overflowed; once space frees up it receives a
    /// single rollback-to-latest summary instead of the dropped backlog.
    fn dispatch(&self, notification: Notification, height: u32) {
        self.latest_height.store(height, Ordering::Relaxed);
        if self.overflowed.load(Ordering::Relaxed) {
            let summary = Notification::Rollback(self.latest_height.load(Ordering::Relaxed));
            if self.sender.try_send(summary).is_ok() {
                self.overflowed.store(false, Ordering::Relaxed);
            }
            return;
        }
        if self.sender.try_send(notification).is_err() {
            log::warn!("listener queue full, degrading to summary");
            self.overflowed.store(true, Ordering::Relaxed);
        }
    }
}

/// Fan-out of chain events to registered listeners.
pub struct Notifier {
    entries: Mutex<Vec<ListenerEntry>>,
    /// Transactions delivered but not yet acknowledged by the embedder.
    receipt_queue: Mutex<HashSet<Uint256>>,
    /// Signalled when the reject log changes.
    rejects_changed: Notify,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            receipt_queue: Mutex::new(HashSet::new()),
            rejects_changed: Notify::new(),
        }
    }

    /// Register a listener and spawn its drain task.
    pub fn register(&self, listener: Arc<dyn TransactionListener>) {
        let (sender, mut receiver) = mpsc::channel(LISTENER_QUEUE);
        self.entries.lock().unwrap().push(ListenerEntry {
            tx_type: listener.tx_type(),
            confirmed: listener.confirmed(),
            sender,
            overflowed: AtomicBool::new(false),
            latest_height: AtomicU32::new(0),
        });
        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                match notification {
                    Notification::Transaction { proof, tx } => listener.notify(&proof, &tx),
                    Notification::Rollback(height) => listener.rollback(height),
                }
            }
        });
    }

    /// Notify listeners waiting for confirmation depth.
    pub async fn notify_confirmed(&self, proof: &MerkleProof, tx: &Transaction) {
        self.receipt_queue.lock().unwrap().insert(tx.hash());
        self.fan_out(proof, tx, true);
    }

    /// Notify listeners that want inclusion as soon as it happens.
    pub async fn notify_unconfirmed(&self, proof: &MerkleProof, tx: &Transaction) {
        self.fan_out(proof, tx, false);
    }

    pub async fn notify_rollback(&self, height: u32) {
        for entry in self.entries.lock().unwrap().iter() {
            entry.dispatch(Notification::Rollback(height), height);
        }
    }

    fn fan_out(&self, proof: &MerkleProof, tx: &Transaction, confirmed: bool) {
        for entry in self.entries.lock().unwrap().iter() {
            if entry.confirmed != confirmed {
                continue;
            }
            if entry.tx_type.map(|t| t != tx.tx_type).unwrap_or(false) {
                continue;
            }
            entry.dispatch(
                Notification::Transaction {
                    proof: proof.clone(),
                    tx: tx.clone(),
                },
                proof.height,
            );
        }
    }

    /// Acknowledge a delivered transaction.
    pub fn submit_receipt(&self, tx_id: &Uint256) -> Result<()> {
        if self.receipt_queue.lock().unwrap().remove(tx_id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("receipt {}", tx_id)))
        }
    }

    /// Wake tasks watching the reject log.
    pub fn wake(&self) {
        self.rejects_changed.notify_waiters();
    }

    async fn rejects_changed(&self) {
        self.rejects_changed.notified().await;
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// The SPV service: owns the stores, the peer manager and the syncer.
pub struct SpvService {
    config: Arc<Config>,
    store: Arc<ChainStore>,
    peers: Arc<PeerManager>,
    notifier: Arc<Notifier>,
    rejects: RejectLog,
    outgoing: OutgoingTxs,
    events: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    shutdown: watch::Sender<bool>,
}

impl SpvService {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = Arc::new(ChainStore::open(&config.data_dir)?);
        Self::with_store(config, store)
    }

    /// Build a service over an existing store (tests use in-memory stores).
    pub fn with_store(config: Arc<Config>, store: Arc<ChainStore>) -> Result<Self> {
        let addrman = Arc::new(AddrManager::new(
            config.seeds.clone(),
            config.data_dir.join(CACHE_FILE),
        ));
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peers = PeerManager::new(config.clone(), addrman, events_tx, shutdown_rx);
        Ok(Self {
            config,
            store,
            peers,
            notifier: Arc::new(Notifier::new()),
            rejects: Arc::new(RwLock::new(HashMap::new())),
            outgoing: Arc::new(RwLock::new(HashMap::new())),
            events: Mutex::new(Some(events_rx)),
            shutdown: shutdown_tx,
        })
    }

    pub fn store(&self) -> Arc<ChainStore> {
        self.store.clone()
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    /// Watch an address for incoming and outgoing transactions.
    pub async fn register_account(&self, address: &str) -> Result<()> {
        let program_hash = Uint168::from_address(address)?;
        if self.store.ledger().get_address(&program_hash).is_ok() {
            return Err(Error::AlreadyExists(format!("account {}", address)));
        }
        self.store.ledger().add_address(&Addr {
            program_hash,
            script: Vec::new(),
            addr_type: addr_type::STANDARD,
        })?;
        // The filter must cover the new address on every peer.
        let filter = build_filter(self.store.ledger(), self.config.fp_rate);
        self.peers.broadcast(Message::FilterLoad(filter)).await;
        Ok(())
    }

    pub fn register_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.notifier.register(listener);
    }

    /// Acknowledge a notified transaction so it leaves the receipt queue.
    pub fn submit_transaction_receipt(&self, tx_id: &Uint256) -> Result<()> {
        self.notifier.submit_receipt(tx_id)
    }

    /// Check a transaction against a proof and the stored active chain.
    pub fn verify_transaction(&self, proof: &MerkleProof, tx: &Transaction) -> Result<()> {
        let (root, matches) = proof.extract_matches()?;
        if !matches.contains(&tx.hash()) {
            return Err(Error::Rejected(format!(
                "transaction {} not covered by proof",
                tx.hash()
            )));
        }

        let stored = self.store.headers().at_height(proof.height)?;
        if stored.hash() != proof.block_hash || stored.header.merkle_root != root {
            return Err(Error::Rejected(format!(
                "proof does not match active chain at {}",
                proof.height
            )));
        }

        let chain_height = self.store.chain_height();
        let depth = chain_height + 1 - proof.height;
        if depth < self.config.confirm_depth {
            return Err(Error::Rejected(format!(
                "only {} of {} confirmations",
                depth, self.config.confirm_depth
            )));
        }
        Ok(())
    }

    /// Broadcast a fully-signed transaction, surfacing a hard peer
    /// rejection observed within the reject window.
    pub async fn send_transaction(&self, tx: Transaction) -> Result<()> {
        if !is_ready_to_send(&tx) {
            return Err(Error::InvalidSignature);
        }
        let tx_id = tx.hash();
        // Track the pending spend and keep the signed bytes servable.
        self.store.ledger().apply_tx(&tx, 0)?;
        self.outgoing.write().await.insert(tx_id, tx);

        self.peers
            .broadcast(Message::Inv {
                inv_type: InvType::Transaction,
                hashes: vec![tx_id],
            })
            .await;

        let deadline = time::Instant::now() + REJECT_WINDOW;
        loop {
            if let Some(reject) = self.rejects.write().await.remove(&tx_id) {
                return Err(Error::Rejected(reject.reason));
            }
            let now = time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let _ = time::timeout(deadline - now, self.notifier.rejects_changed()).await;
        }
    }

    pub fn chain_height(&self) -> u32 {
        self.store.chain_height()
    }

    /// Start the dialer, keep-alive and syncer tasks.
    pub fn start(&self) -> Result<()> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Config("service already started".to_string()))?;

        self.peers.start();
        let syncer = ChainSyncer::new(
            self.config.clone(),
            self.store.clone(),
            self.peers.clone(),
            self.notifier.clone(),
            self.rejects.clone(),
            self.outgoing.clone(),
        );
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(syncer.run(events, shutdown));
        log::info!("spv service started");
        Ok(())
    }

    /// Cooperative shutdown: every loop observes the flag, peers close and
    /// the stores flush.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.peers.stop().await;
        if let Err(e) = self.store.flush() {
            log::error!("flush on stop failed: {}", e);
        }
        log::info!("spv service stopped");
    }
}
