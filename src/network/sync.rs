//! Chain syncer: header/merkle-block pipeline, fork resolution and rollback.
//!
//! A single task consumes peer events in arrival order. Blocks arrive as
//! `merkleblock` messages followed by the matched `tx` messages; once a
//! block's transactions are complete it is committed. Ledger mutations only
//! ever happen for the active chain; side branches are buffered until their
//! cumulative work overtakes the tip.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, Instant};

use crate::config::{Config, MAX_BLOCK_RETRIES, PENDING_TIMEOUT};
use crate::core::hash::Uint256;
use crate::core::transaction::Transaction;
use crate::error::{Error, Result};
use crate::network::manager::PeerManager;
use crate::network::message::{InvType, MerkleBlockMsg, Message, RejectMsg};
use crate::network::peer::PeerEvent;
use crate::service::Notifier;
use crate::spv::bloom::BloomFilter;
use crate::spv::merkle::MerkleProof;
use crate::storage::{ChainStore, Ledger, StoredHeader};

/// Most filtered-block requests in flight at once.
const REQUEST_BATCH: usize = 50;

/// Orphan buffer cap.
const MAX_ORPHANS: usize = 100;

/// Cadence of the pending-request timeout sweep.
const TIMEOUT_SWEEP: time::Duration = time::Duration::from_secs(5);

/// A requested filtered block we are still waiting for.
struct PendingBlock {
    from: String,
    requested_at: Instant,
    retries: u32,
}

/// A merkle block whose matched transactions have not all arrived yet.
struct IncompleteBlock {
    msg: MerkleBlockMsg,
    expected: Vec<Uint256>,
    txs: Vec<Transaction>,
}

/// Broadcast rejections observed from peers, keyed by transaction hash.
pub type RejectLog = Arc<RwLock<HashMap<Uint256, RejectMsg>>>;

/// Signed transactions we have announced and may be asked to serve.
pub type OutgoingTxs = Arc<RwLock<HashMap<Uint256, Transaction>>>;

pub struct ChainSyncer {
    config: Arc<Config>,
    store: Arc<ChainStore>,
    peers: Arc<PeerManager>,
    notifier: Arc<Notifier>,
    rejects: RejectLog,
    outgoing: OutgoingTxs,

    sync_peer: Option<String>,
    request_queue: VecDeque<Uint256>,
    pending: HashMap<Uint256, PendingBlock>,
    incomplete: HashMap<Uint256, IncompleteBlock>,
    // Orphan merkle blocks keyed by their missing parent.
    orphans: HashMap<Uint256, (MerkleBlockMsg, Vec<Transaction>)>,
    // Matched transactions of side-branch blocks, for replay on reorg.
    side_txs: HashMap<Uint256, Vec<Transaction>>,
}

impl ChainSyncer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<ChainStore>,
        peers: Arc<PeerManager>,
        notifier: Arc<Notifier>,
        rejects: RejectLog,
        outgoing: OutgoingTxs,
    ) -> Self {
        peers.set_local_height(store.chain_height() as u64);
        Self {
            config,
            store,
            peers,
            notifier,
            rejects,
            outgoing,
            sync_peer: None,
            request_queue: VecDeque::new(),
            pending: HashMap::new(),
            incomplete: HashMap::new(),
            orphans: HashMap::new(),
            side_txs: HashMap::new(),
        }
    }

    /// Event loop. Returns when the shutdown flag flips; pending work is
    /// dropped and the stores flushed.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<PeerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep = time::interval(TIMEOUT_SWEEP);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.check_timeouts().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        self.pending.clear();
        self.request_queue.clear();
        if let Err(e) = self.store.flush() {
            log::error!("flush on shutdown failed: {}", e);
        }
        log::info!("syncer stopped");
    }

    pub async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, height } => {
                let filter = build_filter(self.store.ledger(), self.config.fp_rate);
                let _ = self.peers.send_to(&addr, Message::FilterLoad(filter)).await;
                let _ = self.peers.send_to(&addr, Message::GetAddr).await;
                log::info!("peer {} established at height {}", addr, height);
                self.maybe_sync().await;
            }
            PeerEvent::Disconnected { addr } => {
                if self.sync_peer.as_deref() == Some(&addr) {
                    self.sync_peer = None;
                    self.maybe_sync().await;
                }
            }
            PeerEvent::Message { addr, message } => {
                if let Err(e) = self.handle_message(&addr, message).await {
                    if e.is_peer_fault() {
                        self.peers.punish(&addr, &e.to_string()).await;
                    } else {
                        log::error!("syncer error from {}: {}", addr, e);
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, addr: &str, message: Message) -> Result<()> {
        match message {
            Message::Inv { inv_type, hashes } => self.on_inv(addr, inv_type, hashes).await,
            Message::MerkleBlock(msg) => self.on_merkle_block(addr, msg).await,
            Message::Tx(tx) => self.on_tx(addr, tx).await,
            Message::NotFound { hashes, .. } => {
                for hash in hashes {
                    if let Some(pending) = self.pending.remove(&hash) {
                        log::debug!("{} not found at {}", hash, pending.from);
                        self.request_queue.push_back(hash);
                    }
                }
                self.issue_requests().await;
                Ok(())
            }
            Message::GetData { inv_type, hashes } => {
                if inv_type == InvType::Transaction {
                    self.serve_transactions(addr, hashes).await;
                }
                Ok(())
            }
            Message::Reject(reject) => {
                log::warn!(
                    "peer {} rejected {:?} ({:#04x}): {}",
                    addr,
                    reject.command,
                    reject.code,
                    reject.reason
                );
                if reject.command == "tx" && reject.is_hard_failure() {
                    self.rejects.write().await.insert(reject.data, reject);
                    self.notifier.wake();
                }
                Ok(())
            }
            // Handshake and keep-alive traffic never reaches the syncer.
            other => Err(Error::Protocol(format!(
                "unexpected {} from {}",
                other.command(),
                addr
            ))),
        }
    }

    /// Start bulk sync when some peer is far enough ahead.
    async fn maybe_sync(&mut self) {
        if self.sync_peer.is_some() {
            return;
        }
        let local = self.peers.local_height();
        if let Some((addr, height)) = self.peers.best_peer().await {
            if height > local + self.config.sync_threshold {
                log::info!(
                    "syncing from {} (height {} vs local {})",
                    addr,
                    height,
                    local
                );
                self.sync_peer = Some(addr.clone());
                let message = Message::GetBlocks {
                    locator: self.store.locator(),
                    hash_stop: Uint256::default(),
                };
                let _ = self.peers.send_to(&addr, message).await;
            }
        }
    }

    async fn on_inv(&mut self, addr: &str, inv_type: InvType, hashes: Vec<Uint256>) -> Result<()> {
        match inv_type {
            InvType::Block | InvType::FilteredBlock => {
                for hash in hashes {
                    if self.store.has_header(&hash)
                        || self.pending.contains_key(&hash)
                        || self.incomplete.contains_key(&hash)
                        || self.request_queue.contains(&hash)
                    {
                        continue;
                    }
                    self.request_queue.push_back(hash);
                }
                if self.sync_peer.is_none() {
                    self.sync_peer = Some(addr.to_string());
                }
                self.issue_requests().await;
                Ok(())
            }
            // Mempool gossip is out of scope.
            InvType::Transaction => Ok(()),
        }
    }

    /// Fill the in-flight window with `getdata` requests.
    async fn issue_requests(&mut self) {
        let target = match &self.sync_peer {
            Some(addr) => addr.clone(),
            None => return,
        };
        let mut batch = Vec::new();
        while self.pending.len() + batch.len() < REQUEST_BATCH {
            match self.request_queue.pop_front() {
                Some(hash) => batch.push(hash),
                None => break,
            }
        }
        if batch.is_empty() {
            return;
        }
        for hash in &batch {
            self.pending.insert(
                *hash,
                PendingBlock {
                    from: target.clone(),
                    requested_at: Instant::now(),
                    retries: 0,
                },
            );
        }
        let message = Message::GetData {
            inv_type: InvType::FilteredBlock,
            hashes: batch,
        };
        if self.peers.send_to(&target, message).await.is_err() {
            self.sync_peer = None;
        }
    }

    async fn on_merkle_block(&mut self, addr: &str, msg: MerkleBlockMsg) -> Result<()> {
        let hash = msg.header.hash();
        self.pending.remove(&hash);

        // Already on the active chain: nothing to do.
        if let Ok(active) = self.store.headers().hash_at(msg.header.height) {
            if active == hash {
                return Ok(());
            }
        }

        let proof = msg.to_proof();
        let (root, matches) = proof.extract_matches()?;
        if root != msg.header.merkle_root {
            return Err(Error::PeerMisbehavior(format!(
                "merkle root mismatch in block {}",
                hash
            )));
        }

        if matches.is_empty() {
            self.commit_block(addr, msg, Vec::new()).await
        } else {
            self.incomplete.insert(
                hash,
                IncompleteBlock {
                    msg,
                    expected: matches,
                    txs: Vec::new(),
                },
            );
            Ok(())
        }
    }

    async fn on_tx(&mut self, addr: &str, tx: Transaction) -> Result<()> {
        let tx_id = tx.hash();

        // A transaction completing a filtered block we are assembling?
        let block_hash = self.incomplete.iter().find_map(|(hash, block)| {
            if block.expected.contains(&tx_id) && !block.txs.iter().any(|t| t.hash() == tx_id) {
                Some(*hash)
            } else {
                None
            }
        });

        match block_hash {
            Some(hash) => {
                let complete = {
                    let block = self.incomplete.get_mut(&hash).expect("checked above");
                    block.txs.push(tx);
                    block.txs.len() == block.expected.len()
                };
                if complete {
                    let block = self.incomplete.remove(&hash).expect("checked above");
                    self.commit_block(addr, block.msg, block.txs).await?;
                }
                Ok(())
            }
            None => {
                // Unconfirmed wallet transaction pushed by a peer.
                match self.store.ledger().apply_tx(&tx, 0) {
                    Ok(true) => {
                        log::info!("unconfirmed transaction {} stored", tx_id);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Place a verified merkle block on the chain: extend, buffer as orphan,
    /// or record a side branch and reorg when it wins.
    async fn commit_block(
        &mut self,
        addr: &str,
        msg: MerkleBlockMsg,
        txs: Vec<Transaction>,
    ) -> Result<()> {
        let header = msg.header.clone();
        let hash = header.hash();
        let proof = msg.to_proof();

        let tip = self.store.tip();
        let stored = match &tip {
            // Nothing connected yet: only the genesis block can start the
            // chain; anything later is buffered until its ancestry arrives.
            None => {
                if header.height != 0 {
                    if self.orphans.len() < MAX_ORPHANS {
                        let parent = header.prev;
                        self.orphans.insert(parent, (msg, txs));
                        self.request_queue.push_front(parent);
                        if self.sync_peer.is_none() {
                            self.sync_peer = Some(addr.to_string());
                        }
                        self.issue_requests().await;
                    }
                    return Ok(());
                }
                StoredHeader {
                    total_work: header.work(),
                    header,
                }
            }
            Some(tip) if tip.hash() == header.prev => {
                if header.height != tip.height() + 1 {
                    return Err(Error::PeerMisbehavior(format!(
                        "block {} height {} does not follow {}",
                        hash,
                        header.height,
                        tip.height()
                    )));
                }
                StoredHeader {
                    total_work: tip.total_work + header.work(),
                    header,
                }
            }
            Some(_) => match self.store.get_header(&header.prev) {
                Ok(parent) => {
                    if header.height != parent.height() + 1 {
                        return Err(Error::PeerMisbehavior(format!(
                            "block {} height {} does not follow parent",
                            hash, header.height
                        )));
                    }
                    let stored = StoredHeader {
                        total_work: parent.total_work + header.work(),
                        header,
                    };
                    // Side branch: persist, remember its transactions and
                    // reorg if it now carries more work than the tip.
                    self.with_io_retry(|store| store.put_side_header(&stored, &proof))?;
                    self.side_txs.insert(hash, txs);
                    let tip = tip.as_ref().expect("tip checked above");
                    if stored.total_work > tip.total_work {
                        self.reorg(&stored).await?;
                    }
                    self.continue_sync().await;
                    return Ok(());
                }
                Err(Error::NotFound(_)) => {
                    // Orphan: hold on to it and fetch the parent.
                    if self.orphans.len() < MAX_ORPHANS {
                        let parent = header.prev;
                        self.orphans.insert(parent, (msg, txs));
                        self.request_queue.push_front(parent);
                        if self.sync_peer.is_none() {
                            self.sync_peer = Some(addr.to_string());
                        }
                        self.issue_requests().await;
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        self.connect_and_notify(&stored, &proof, &txs).await?;

        // An orphan may have been waiting for this block.
        if let Some((orphan_msg, orphan_txs)) = self.orphans.remove(&stored.hash()) {
            Box::pin(self.commit_block(addr, orphan_msg, orphan_txs)).await?;
        }

        self.continue_sync().await;
        Ok(())
    }

    /// Connect a block at the tip and fire the resulting notifications.
    async fn connect_and_notify(
        &mut self,
        stored: &StoredHeader,
        proof: &MerkleProof,
        txs: &[Transaction],
    ) -> Result<()> {
        let relevant = self.with_io_retry(|store| store.connect_block(stored, proof, txs))?;
        let height = stored.height();
        self.peers.set_local_height(height as u64);
        self.side_txs.remove(&stored.hash());

        if !relevant.is_empty() {
            log::info!(
                "block {} at {} carries {} wallet transaction(s)",
                stored.hash(),
                height,
                relevant.len()
            );
            // Inclusion notifications for listeners that do not wait for
            // confirmation depth.
            for tx in txs {
                if relevant.contains(&tx.hash()) {
                    self.notifier.notify_unconfirmed(proof, tx).await;
                }
            }
            // The UTXO set changed: refresh every peer's filter.
            let filter = build_filter(self.store.ledger(), self.config.fp_rate);
            self.peers.broadcast(Message::FilterLoad(filter)).await;
        }

        // Transactions reaching confirmation depth with this block.
        if height + 1 >= self.config.confirm_depth {
            let confirmed_height = height + 1 - self.config.confirm_depth;
            let confirmed = self.store.ledger().get_txs_at(confirmed_height)?;
            if !confirmed.is_empty() {
                let block_hash = self.store.headers().hash_at(confirmed_height)?;
                let proof = self.store.proofs().get(&block_hash)?;
                for store_tx in confirmed {
                    self.notifier.notify_confirmed(&proof, &store_tx.data).await;
                }
            }
        }
        Ok(())
    }

    /// Switch the active chain to the branch ending at `new_tip`.
    async fn reorg(&mut self, new_tip: &StoredHeader) -> Result<()> {
        let fork = self.store.find_fork(new_tip)?;
        let old_tip = self
            .store
            .tip()
            .ok_or_else(|| Error::NotFound("chain tip".to_string()))?;
        log::warn!(
            "reorg: {} (height {}) -> {} (height {}), fork at {}",
            old_tip.hash(),
            old_tip.height(),
            new_tip.hash(),
            new_tip.height(),
            fork.height()
        );

        // Revert the abandoned branch, newest block first.
        for height in ((fork.height() + 1)..=old_tip.height()).rev() {
            self.with_io_retry(|store| store.rollback_block(height))?;
            self.notifier.notify_rollback(height).await;
        }
        self.store.set_tip(&fork)?;
        self.peers.set_local_height(fork.height() as u64);

        // Collect the winning branch fork -> new tip.
        let mut branch = Vec::new();
        let mut cursor = new_tip.clone();
        while cursor.hash() != fork.hash() {
            let parent = cursor.header.prev;
            branch.push(cursor.clone());
            if cursor.height() == 0 {
                break;
            }
            cursor = self.store.get_header(&parent)?;
        }
        branch.reverse();

        // Apply it in order.
        for stored in branch {
            let hash = stored.hash();
            let proof = self.store.proofs().get(&hash)?;
            let txs = self.side_txs.remove(&hash).unwrap_or_default();
            self.connect_and_notify(&stored, &proof, &txs).await?;
        }
        Ok(())
    }

    /// Keep the request pipeline full, or look for a farther-ahead peer
    /// when it drains.
    async fn continue_sync(&mut self) {
        if !self.request_queue.is_empty() {
            self.issue_requests().await;
            return;
        }
        if self.pending.is_empty() && self.incomplete.is_empty() {
            self.sync_peer = None;
            self.maybe_sync().await;
        }
    }

    /// Re-request pending blocks that timed out; give up after the retry
    /// budget and restart sync from the current tip.
    async fn check_timeouts(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (hash, pending) in &self.pending {
            if now.duration_since(pending.requested_at) > PENDING_TIMEOUT {
                expired.push((*hash, pending.retries, pending.from.clone()));
            }
        }
        if expired.is_empty() {
            return;
        }

        let established = self.peers.established().await;
        for (hash, retries, from) in expired {
            self.pending.remove(&hash);
            if retries >= MAX_BLOCK_RETRIES {
                log::warn!("giving up on block {} after {} retries", hash, retries);
                self.sync_peer = None;
                self.maybe_sync().await;
                continue;
            }
            // Prefer a different peer for the retry.
            let next = established
                .iter()
                .map(|(addr, _)| addr)
                .find(|addr| **addr != from)
                .or_else(|| established.first().map(|(addr, _)| addr));
            if let Some(addr) = next {
                log::debug!("re-requesting {} from {}", hash, addr);
                self.pending.insert(
                    hash,
                    PendingBlock {
                        from: addr.clone(),
                        requested_at: Instant::now(),
                        retries: retries + 1,
                    },
                );
                let message = Message::GetData {
                    inv_type: InvType::FilteredBlock,
                    hashes: vec![hash],
                };
                let _ = self.peers.send_to(addr, message).await;
            } else {
                self.request_queue.push_back(hash);
            }
        }
    }

    /// Serve a peer's `getdata` for transactions we announced. Only the
    /// signed originals kept in memory are served; the ledger holds
    /// unsigned bytes.
    async fn serve_transactions(&mut self, addr: &str, hashes: Vec<Uint256>) {
        for hash in hashes {
            let tx = self.outgoing.read().await.get(&hash).cloned();
            match tx {
                Some(tx) => {
                    let _ = self.peers.send_to(addr, Message::Tx(tx)).await;
                }
                None => {
                    let _ = self
                        .peers
                        .send_to(
                            addr,
                            Message::NotFound {
                                inv_type: InvType::Transaction,
                                hashes: vec![hash],
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// Store writes are retried once on I/O failure, then escalated.
    fn with_io_retry<T>(&self, op: impl Fn(&ChainStore) -> Result<T>) -> Result<T> {
        match op(&self.store) {
            Err(Error::Io(e)) => {
                log::warn!("store operation failed, retrying once: {}", e);
                op(&self.store)
            }
            other => other,
        }
    }
}

/// Bloom filter over every watched program hash and every wallet outpoint.
pub fn build_filter(ledger: &Ledger, fp_rate: f64) -> BloomFilter {
    let addrs = ledger.get_addresses().unwrap_or_default();
    let utxos = ledger.get_utxos(None).unwrap_or_default();
    let mut filter = BloomFilter::new(addrs.len() + utxos.len(), fp_rate, rand::random());
    for addr in &addrs {
        filter.insert(addr.program_hash.as_bytes());
    }
    for utxo in &utxos {
        filter.insert(&utxo.outpoint.to_key());
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{Uint168, PREFIX_STANDARD};
    use crate::core::header::BlockHeader;
    use crate::core::transaction::{OutPoint, TransactionBuilder};
    use crate::network::addrman::AddrManager;
    use crate::network::peer::PeerState;
    use crate::service::TransactionListener;
    use crate::storage::ledger::{addr_type, Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const PEER: &str = "p:20866";

    struct RecordingListener {
        confirmed: bool,
        notified: Mutex<Vec<(Uint256, u32)>>,
        notify_count: AtomicUsize,
        rollbacks: Mutex<Vec<u32>>,
    }

    impl RecordingListener {
        fn new(confirmed: bool) -> Arc<Self> {
            Arc::new(Self {
                confirmed,
                notified: Mutex::new(Vec::new()),
                notify_count: AtomicUsize::new(0),
                rollbacks: Mutex::new(Vec::new()),
            })
        }
    }

    impl TransactionListener for Arc<RecordingListener> {
        fn confirmed(&self) -> bool {
            self.confirmed
        }

        fn notify(&self, proof: &MerkleProof, tx: &Transaction) {
            self.notified.lock().unwrap().push((tx.hash(), proof.height));
            self.notify_count.fetch_add(1, Ordering::SeqCst);
        }

        fn rollback(&self, height: u32) {
            self.rollbacks.lock().unwrap().push(height);
        }
    }

    struct Harness {
        syncer: ChainSyncer,
        store: Arc<ChainStore>,
        peers: Arc<PeerManager>,
        addrman: Arc<AddrManager>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::new(7, vec!["seed:20866".into()]));
        let store = Arc::new(ChainStore::memory().unwrap());
        let addrman = Arc::new(AddrManager::new(
            Vec::new(),
            dir.path().join("addrs.cache"),
        ));
        let (events_tx, _events_rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // The shutdown sender leaks with the harness lifetime; fine in tests.
        std::mem::forget(_shutdown_tx);
        let peers = PeerManager::new(config.clone(), addrman.clone(), events_tx, shutdown_rx);
        let notifier = Arc::new(Notifier::new());
        let syncer = ChainSyncer::new(
            config,
            store.clone(),
            peers.clone(),
            notifier,
            Arc::new(RwLock::new(HashMap::new())),
            Arc::new(RwLock::new(HashMap::new())),
        );
        Harness {
            syncer,
            store,
            peers,
            addrman,
            _dir: dir,
        }
    }

    impl Harness {
        fn notifier(&self) -> Arc<Notifier> {
            self.syncer.notifier.clone()
        }

        fn watch(&self, address: Uint168) {
            self.store
                .ledger()
                .add_address(&Addr {
                    program_hash: address,
                    script: vec![0x21, 0xAC],
                    addr_type: addr_type::STANDARD,
                })
                .unwrap();
        }

        async fn feed_block(&mut self, block: MerkleBlockMsg, txs: Vec<Transaction>) {
            self.syncer
                .handle_event(PeerEvent::Message {
                    addr: PEER.to_string(),
                    message: Message::MerkleBlock(block),
                })
                .await;
            for tx in txs {
                self.syncer
                    .handle_event(PeerEvent::Message {
                        addr: PEER.to_string(),
                        message: Message::Tx(tx),
                    })
                    .await;
            }
        }
    }

    fn payment(address: Uint168, value: u64, salt: u32) -> Transaction {
        TransactionBuilder::new()
            .add_input(OutPoint::new(Uint256::digest(&salt.to_le_bytes()), 0))
            .add_output(address, value, 0)
            .build()
    }

    /// Build a merkle block at `height` on `prev`. Transactions paired with
    /// `true` pass the filter and must be fed after the block.
    fn make_block(
        prev: Uint256,
        height: u32,
        salt: u32,
        txs: &[(Transaction, bool)],
    ) -> (MerkleBlockMsg, Vec<Transaction>) {
        let tx_ids: Vec<Uint256> = txs.iter().map(|(tx, _)| tx.hash()).collect();
        let matched: Vec<bool> = txs.iter().map(|(_, m)| *m).collect();
        let (proof, root) = MerkleProof::create(Uint256::default(), height, &tx_ids, &matched);
        let header = BlockHeader {
            version: 1,
            prev,
            merkle_root: root,
            timestamp: height,
            bits: 0x1d00ffff,
            nonce: salt,
            height,
            aux_pow: Vec::new(),
        };
        let msg = MerkleBlockMsg {
            header,
            total_tx: tx_ids.len() as u32,
            hashes: proof.hashes,
            flags: proof.flags,
        };
        let fed: Vec<Transaction> = txs
            .iter()
            .filter(|(_, m)| *m)
            .map(|(tx, _)| tx.clone())
            .collect();
        (msg, fed)
    }

    fn filler(height: u32, salt: u32) -> (Transaction, bool) {
        (
            payment(
                Uint168::from_code(&[salt as u8, 0xAC], PREFIX_STANDARD),
                1,
                height * 1000 + salt,
            ),
            false,
        )
    }

    async fn settle() {
        time::sleep(time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_simple_receive_and_deferred_confirmation() {
        let mut harness = harness().await;
        let address = Uint168::from_code(&[0x21, 0xAC], PREFIX_STANDARD);
        harness.watch(address);

        let listener = RecordingListener::new(true);
        harness.notifier().register(Arc::new(listener.clone()));

        let pay = payment(address, 10, 7);
        let mut prev = Uint256::default();
        for height in 0..=8u32 {
            let (block, txs) = if height == 3 {
                make_block(prev, height, height, &[(pay.clone(), true), filler(height, 9)])
            } else {
                make_block(prev, height, height, &[filler(height, 1), filler(height, 2)])
            };
            prev = block.header.hash();
            harness.feed_block(block, txs).await;

            if height == 3 {
                let utxos = harness.store.ledger().get_utxos(Some(&address)).unwrap();
                assert_eq!(utxos.len(), 1);
                assert_eq!(utxos[0].value, 10);
                assert_eq!(utxos[0].height, 3);
                assert_eq!(utxos[0].lock_time, 0);
                assert_eq!(utxos[0].outpoint, OutPoint::new(pay.hash(), 0));
            }
            if height == 7 {
                // Confirmation depth not reached yet
                settle().await;
                assert_eq!(listener.notify_count.load(Ordering::SeqCst), 0);
            }
        }

        // At height 8 the block at height 3 has exactly 6 confirmations
        settle().await;
        assert_eq!(listener.notify_count.load(Ordering::SeqCst), 1);
        let notified = listener.notified.lock().unwrap();
        assert_eq!(notified[0], (pay.hash(), 3));
        assert_eq!(harness.store.chain_height(), 8);
    }

    #[tokio::test]
    async fn test_reorg_rolls_back_and_switches_tip() {
        let mut harness = harness().await;
        let address = Uint168::from_code(&[0x21, 0xAC], PREFIX_STANDARD);
        harness.watch(address);

        let listener = RecordingListener::new(true);
        harness.notifier().register(Arc::new(listener.clone()));

        // Branch X: h0..h6, paying the watched address at height 3
        let pay = payment(address, 10, 7);
        let mut x_hashes = Vec::new();
        let mut prev = Uint256::default();
        for height in 0..=6u32 {
            let (block, txs) = if height == 3 {
                make_block(prev, height, height, &[(pay.clone(), true), filler(height, 9)])
            } else {
                make_block(prev, height, height, &[filler(height, 1)])
            };
            prev = block.header.hash();
            x_hashes.push(prev);
            harness.feed_block(block, txs).await;
        }
        assert_eq!(harness.store.chain_height(), 6);
        assert_eq!(
            harness.store.ledger().get_utxos(Some(&address)).unwrap().len(),
            1
        );

        // Branch Y diverges after height 2 and grows to height 7, no
        // payment to the watched address anywhere.
        let mut prev = x_hashes[2];
        let mut y_tip = Uint256::default();
        for height in 3..=7u32 {
            let (block, txs) = make_block(prev, height, 1000 + height, &[filler(height, 1)]);
            prev = block.header.hash();
            y_tip = prev;
            harness.feed_block(block, txs).await;
        }

        // The losing branch was reverted newest-first down to the fork
        settle().await;
        assert_eq!(*listener.rollbacks.lock().unwrap(), vec![6, 5, 4, 3]);
        assert!(harness
            .store
            .ledger()
            .get_utxos(Some(&address))
            .unwrap()
            .is_empty());
        assert_eq!(harness.store.chain_height(), 7);
        assert_eq!(harness.store.tip().unwrap().hash(), y_tip);
    }

    #[tokio::test]
    async fn test_bad_merkle_root_punishes_peer() {
        let mut harness = harness().await;
        harness.addrman.learn(PEER);

        // A valid genesis so there is ledger state to protect
        let (genesis, txs) = make_block(Uint256::default(), 0, 0, &[filler(0, 1)]);
        let genesis_hash = genesis.header.hash();
        harness.feed_block(genesis, txs).await;

        for round in 0..3u32 {
            let _outbound = harness
                .peers
                .insert_test_peer(PEER, PeerState::Establish)
                .await;

            let (mut block, _) = make_block(genesis_hash, 1, 100 + round, &[filler(1, 1)]);
            block.header.merkle_root = Uint256::digest(b"forged");
            harness.feed_block(block, Vec::new()).await;

            // Peer disconnected, ledger untouched
            assert!(harness.peers.established().await.is_empty());
            assert_eq!(harness.store.chain_height(), 0);
            assert_eq!(harness.store.tip().unwrap().hash(), genesis_hash);
        }

        // Three strikes: the address is gone from the cache
        assert!(!harness.addrman.idle(10).contains(&PEER.to_string()));
    }

    #[tokio::test]
    async fn test_orphan_block_waits_for_parent() {
        let mut harness = harness().await;

        let (block0, txs0) = make_block(Uint256::default(), 0, 0, &[filler(0, 1)]);
        let hash0 = block0.header.hash();
        let (block1, txs1) = make_block(hash0, 1, 1, &[filler(1, 1)]);
        let hash1 = block1.header.hash();

        // Child first: buffered, nothing committed
        harness.feed_block(block1, txs1).await;
        assert!(harness.store.tip().is_none());

        // Parent arrives: both connect
        harness.feed_block(block0, txs0).await;
        assert_eq!(harness.store.chain_height(), 1);
        assert_eq!(harness.store.tip().unwrap().hash(), hash1);
        assert!(harness.store.has_header(&hash0));
    }

    #[tokio::test]
    async fn test_inv_triggers_filtered_block_requests() {
        let mut harness = harness().await;
        let mut outbound = harness
            .peers
            .insert_test_peer(PEER, PeerState::Establish)
            .await;

        let wanted: Vec<Uint256> = (0..3u32)
            .map(|i| Uint256::digest(&i.to_le_bytes()))
            .collect();
        harness
            .syncer
            .handle_event(PeerEvent::Message {
                addr: PEER.to_string(),
                message: Message::Inv {
                    inv_type: InvType::Block,
                    hashes: wanted.clone(),
                },
            })
            .await;

        match outbound.recv().await.unwrap() {
            Message::GetData { inv_type, hashes } => {
                assert_eq!(inv_type, InvType::FilteredBlock);
                assert_eq!(hashes, wanted);
            }
            other => panic!("unexpected message {:?}", other),
        }

        // Re-announcing known hashes does not re-request them
        harness
            .syncer
            .handle_event(PeerEvent::Message {
                addr: PEER.to_string(),
                message: Message::Inv {
                    inv_type: InvType::Block,
                    hashes: wanted,
                },
            })
            .await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unconfirmed_tx_updated_on_inclusion() {
        let mut harness = harness().await;
        let address = Uint168::from_code(&[0x21, 0xAC], PREFIX_STANDARD);
        harness.watch(address);

        // Pushed by a peer before any block contains it
        let pay = payment(address, 10, 7);
        harness
            .syncer
            .handle_event(PeerEvent::Message {
                addr: PEER.to_string(),
                message: Message::Tx(pay.clone()),
            })
            .await;
        assert_eq!(
            harness.store.ledger().get_tx(&pay.hash()).unwrap().height,
            0
        );

        // A block includes it: the stored height moves from 0 to the
        // confirming height and the UTXO follows
        let (genesis, genesis_txs) = make_block(Uint256::default(), 0, 0, &[filler(0, 1)]);
        let genesis_hash = genesis.header.hash();
        harness.feed_block(genesis, genesis_txs).await;

        let (block, txs) = make_block(genesis_hash, 1, 1, &[(pay.clone(), true), filler(1, 2)]);
        harness.feed_block(block, txs).await;

        let stored = harness.store.ledger().get_tx(&pay.hash()).unwrap();
        assert_eq!(stored.height, 1);
        let utxos = harness.store.ledger().get_utxos(Some(&address)).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].height, 1);
    }
}
