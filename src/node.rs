//! The node: chain, mempool, miner and peers wired together.
//!
//! All ledger mutation goes through one `tokio::sync::Mutex<Ledger>`, so applying a
//! transaction, accepting a block and replacing the chain are serialized. Work that
//! does not need the ledger (proof-of-work, validating a peer's chain) runs on the
//! blocking pool without holding the lock.

use crate::blockchain::{Block, BlockRelation, Blockchain, ChainParams, ChainSummary, State, ValidatedChain};
use crate::config::Config;
use crate::crypto::{address_to_hex, short_hex, Address, KeyPair, Sha256Hash};
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::miner::mine_block;
use crate::network::{
    start_server, BoxFuture, Hello, Message, MessageHandler, Network, PeerError, PeerHandle,
    PROTOCOL_VERSION,
};
use crate::transaction::{Transaction, TransferTx};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed mining attempt before trying again.
const MINING_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The exclusively owned ledger: the canonical chain with its state, and the pool
/// of transfers waiting for a block.
#[derive(Debug)]
pub struct Ledger {
    pub chain: Blockchain,
    pub mempool: Mempool,
}

impl Ledger {
    pub fn new(params: ChainParams) -> Result<Self, ChainError> {
        Ok(Ledger {
            chain: Blockchain::new(params)?,
            mempool: Mempool::new(),
        })
    }

    /// Appends a block to the tip and evicts the transfers it settled.
    fn commit_block(&mut self, block: Block) -> Result<(), ChainError> {
        let included: Vec<Sha256Hash> = block.transfers().map(Transaction::hash).collect();
        self.chain.apply_block(block)?;
        self.mempool.remove(&included);
        self.mempool.prune_stale(self.chain.state());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub listen_address: Option<SocketAddr>,
    pub outbound: bool,
}

/// Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    ledger: tokio::sync::Mutex<Ledger>,
    params: ChainParams,
    genesis_hash: Sha256Hash,
    network_id: String,
    wallet: KeyPair,
    faucet: KeyPair,
    beneficiary: Address,
    network: Arc<Network>,
    listen_host: String,
    listen_port: u16,
    bootstrap_peers: Vec<String>,
    auto_connect: bool,
    local_listen: RwLock<Option<SocketAddr>>,
    server: Mutex<Option<JoinHandle<()>>>,
    mining_enabled: AtomicBool,
    mining_generation: AtomicU64,
    mining_jobs: Mutex<Vec<Arc<AtomicBool>>>,
}

impl Node {
    /// Builds a node from `config`, signing with `wallet`. Nothing runs until [`Node::start`].
    pub fn new(config: &Config, wallet: KeyPair) -> Result<Self, ChainError> {
        config.validate()?;
        let params = config.chain_params()?;
        let ledger = Ledger::new(params.clone())?;
        let genesis_hash = ledger.chain.genesis_hash();
        let beneficiary = config.beneficiary()?.unwrap_or_else(|| wallet.address());

        info!(
            network_id = %config.network.network_id,
            genesis = %short_hex(&genesis_hash),
            difficulty = params.difficulty,
            "node initialised"
        );

        Ok(Node {
            inner: Arc::new(NodeInner {
                ledger: tokio::sync::Mutex::new(ledger),
                params,
                genesis_hash,
                network_id: config.network.network_id.clone(),
                wallet,
                faucet: config.faucet_keypair()?,
                beneficiary,
                network: Arc::new(Network::new(config.network.max_peers)),
                listen_host: config.network.listen_host.clone(),
                listen_port: config.network.p2p_port,
                bootstrap_peers: config.network.bootstrap_peers.clone(),
                auto_connect: config.network.auto_connect,
                local_listen: RwLock::new(None),
                server: Mutex::new(None),
                mining_enabled: AtomicBool::new(false),
                mining_generation: AtomicU64::new(0),
                mining_jobs: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Binds the listener, dials the bootstrap peers and returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ChainError> {
        let inner = &self.inner;
        let listener =
            TcpListener::bind((inner.listen_host.as_str(), inner.listen_port)).await?;
        let bound = listener.local_addr()?;
        *inner.local_listen.write() = Some(bound);
        info!(address = %bound, "listening for peers");

        let server = start_server(listener, inner.network.clone(), inner.clone());
        if let Some(previous) = inner.server.lock().replace(server) {
            previous.abort();
        }

        for peer in &inner.bootstrap_peers {
            if let Err(e) = self.connect_to_peer(peer).await {
                warn!(peer = %peer, error = %e, "bootstrap peer unreachable");
            }
        }
        Ok(bound)
    }

    /// Stops mining, closes every connection and the listener.
    pub fn shutdown(&self) {
        self.stop_mining();
        if let Some(server) = self.inner.server.lock().take() {
            server.abort();
        }
        self.inner.network.disconnect_all("node shutting down");
        info!("node stopped");
    }

    pub fn params(&self) -> &ChainParams {
        &self.inner.params
    }

    /// Address of the node's wallet.
    pub fn local_address(&self) -> Address {
        self.inner.wallet.address()
    }

    pub fn wallet(&self) -> &KeyPair {
        &self.inner.wallet
    }

    pub fn beneficiary(&self) -> Address {
        self.inner.beneficiary
    }

    /// Address the peer listener is bound to, once started.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        *self.inner.local_listen.read()
    }

    /// Admits a transaction to the mempool and relays it.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Sha256Hash, ChainError> {
        self.inner.submit_transaction(tx, None).await
    }

    /// Signs a transfer from the node wallet and submits it.
    pub async fn transfer(&self, recipient: Address, amount: u64) -> Result<Sha256Hash, ChainError> {
        self.send_from(&self.inner.wallet, recipient, amount).await
    }

    /// Pays out of the treasury with the configured faucet key.
    pub async fn faucet(&self, recipient: Address, amount: u64) -> Result<Sha256Hash, ChainError> {
        self.send_from(&self.inner.faucet, recipient, amount).await
    }

    async fn send_from(
        &self,
        keypair: &KeyPair,
        recipient: Address,
        amount: u64,
    ) -> Result<Sha256Hash, ChainError> {
        // Nonce choice and admission happen under one lock so concurrent sends
        // from the same key never pick the same nonce.
        let mut ledger = self.inner.ledger.lock().await;
        let Ledger { chain, mempool } = &mut *ledger;
        let nonce = mempool.next_nonce(&keypair.address(), chain.state());
        let tx: Transaction = TransferTx::create(keypair, recipient, amount, nonce)?.into();
        let hash = mempool.add(tx.clone(), chain.state())?;
        drop(ledger);

        info!(
            tx = %short_hex(&hash),
            to = %short_hex(&recipient),
            amount,
            nonce,
            "transfer submitted"
        );
        self.inner.network.mark_seen(hash);
        self.inner.network.broadcast(&Message::NewTransaction(tx), None);
        Ok(hash)
    }

    pub async fn balance(&self, address: &Address) -> u64 {
        self.inner.ledger.lock().await.chain.get_balance(address)
    }

    pub async fn nonce(&self, address: &Address) -> u64 {
        self.inner.ledger.lock().await.chain.get_nonce(address)
    }

    pub async fn state(&self) -> State {
        self.inner.ledger.lock().await.chain.state().clone()
    }

    pub async fn height(&self) -> u64 {
        self.inner.ledger.lock().await.chain.height()
    }

    pub async fn chain_summary(&self) -> ChainSummary {
        self.inner.ledger.lock().await.chain.summary()
    }

    pub async fn blocks(&self) -> Vec<Block> {
        self.inner.ledger.lock().await.chain.blocks().to_vec()
    }

    pub async fn block(&self, index: u64) -> Option<Block> {
        self.inner.ledger.lock().await.chain.block(index).cloned()
    }

    pub async fn list_mempool(&self) -> Vec<Transaction> {
        self.inner.ledger.lock().await.mempool.transactions()
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .inner
            .network
            .peers()
            .into_iter()
            .map(|p| PeerInfo {
                address: p.address,
                listen_address: p.listen_address(),
                outbound: p.outbound,
            })
            .collect();
        peers.sort_by_key(|p| p.address);
        peers
    }

    /// Dials `address` ("host:port") and returns the connected socket address.
    pub async fn connect_to_peer(&self, address: &str) -> Result<SocketAddr, ChainError> {
        self.inner.clone().connect(address.to_string()).await
    }

    /// Mines one block on the current tip with pending transfers and submits it.
    pub async fn mine_once(&self) -> Result<Block, ChainError> {
        self.inner.clone().mine_once().await
    }

    /// Starts continuous mining in the background. Returns `false` if already running.
    pub fn start_mining(&self) -> bool {
        let inner = &self.inner;
        if inner.mining_enabled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let generation = inner.mining_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = inner.clone();

        tokio::spawn(async move {
            info!(beneficiary = %short_hex(&inner.beneficiary), "mining started");
            while inner.mining_active(generation) {
                match inner.clone().mine_once().await {
                    Ok(block) => info!(
                        height = block.index(),
                        hash = %short_hex(&block.hash()),
                        transactions = block.transactions.len(),
                        "mined block"
                    ),
                    Err(ChainError::MiningCancelled) => debug!("mining restarted on new tip"),
                    Err(e) => {
                        warn!(error = %e, "mining attempt failed");
                        tokio::time::sleep(MINING_RETRY_DELAY).await;
                    }
                }
            }
            info!("mining stopped");
        });
        true
    }

    pub fn stop_mining(&self) {
        let inner = &self.inner;
        inner.mining_enabled.store(false, Ordering::SeqCst);
        inner.mining_generation.fetch_add(1, Ordering::SeqCst);
        inner.cancel_mining_jobs();
    }

    pub fn is_mining(&self) -> bool {
        self.inner.mining_enabled.load(Ordering::SeqCst)
    }
}

impl NodeInner {
    fn mining_active(&self, generation: u64) -> bool {
        self.mining_enabled.load(Ordering::SeqCst)
            && self.mining_generation.load(Ordering::SeqCst) == generation
    }

    /// Aborts every in-flight proof-of-work search.
    fn cancel_mining_jobs(&self) {
        for job in self.mining_jobs.lock().drain(..) {
            job.store(true, Ordering::SeqCst);
        }
    }

    /// Appends a block that extends the tip and aborts every search on the old tip.
    fn accept_block(&self, ledger: &mut Ledger, block: Block) -> Result<(), ChainError> {
        ledger.commit_block(block)?;
        self.cancel_mining_jobs();
        Ok(())
    }

    fn hello(&self, height: u64) -> Message {
        Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            network_id: self.network_id.clone(),
            genesis_hash: self.genesis_hash,
            height,
            listen_port: self.local_listen.read().map(|a| a.port()).unwrap_or(0),
        })
    }

    fn is_own_listen_address(&self, address: &SocketAddr) -> bool {
        match *self.local_listen.read() {
            Some(local) => {
                local.port() == address.port()
                    && (address.ip() == local.ip()
                        || address.ip().is_loopback()
                        || address.ip().is_unspecified())
            }
            None => false,
        }
    }

    async fn connect(self: Arc<Self>, address: String) -> Result<SocketAddr, ChainError> {
        if let Ok(parsed) = address.parse::<SocketAddr>() {
            if self.is_own_listen_address(&parsed) {
                return Err(ChainError::PeerIo(format!("{} is this node", address)));
            }
            if self.network.is_connected_to(&parsed) {
                return Err(ChainError::PeerIo(format!("Already connected to {}", address)));
            }
        }

        let network = self.network.clone();
        let peer = network.connect(&address, self).await?;
        info!(peer = %peer.address, "outbound peer connected");
        Ok(peer.address)
    }

    async fn mine_once(self: Arc<Self>) -> Result<Block, ChainError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (previous, transactions) = {
            let ledger = self.ledger.lock().await;
            let transactions = ledger
                .mempool
                .take_for_block(ledger.chain.state(), self.params.max_transactions_per_block);
            // Registered under the ledger lock so no tip change can slip in unnoticed.
            self.mining_jobs.lock().push(cancel.clone());
            (ledger.chain.tip().clone(), transactions)
        };

        let params = self.params.clone();
        let beneficiary = self.beneficiary;
        let flag = cancel.clone();
        let mined = tokio::task::spawn_blocking(move || {
            mine_block(&previous, transactions, beneficiary, &params, &flag)
        })
        .await;
        self.mining_jobs.lock().retain(|job| !Arc::ptr_eq(job, &cancel));

        let block = mined.map_err(|e| ChainError::IoError(format!("Mining task failed: {}", e)))??;

        let mut ledger = self.ledger.lock().await;
        self.accept_block(&mut ledger, block.clone())?;
        drop(ledger);

        self.network.mark_seen(block.hash());
        self.network.broadcast(&Message::NewBlock(block.clone()), None);
        Ok(block)
    }

    async fn submit_transaction(
        &self,
        tx: Transaction,
        source: Option<&PeerHandle>,
    ) -> Result<Sha256Hash, ChainError> {
        let mut ledger = self.ledger.lock().await;
        let Ledger { chain, mempool } = &mut *ledger;
        let hash = mempool.add(tx.clone(), chain.state())?;
        drop(ledger);

        self.network.mark_seen(hash);
        self.network
            .broadcast(&Message::NewTransaction(tx), source.map(|p| &p.address));
        Ok(hash)
    }

    async fn handle_transaction(&self, peer: &PeerHandle, tx: Transaction) {
        let hash = tx.hash();
        if self.network.has_seen(&hash) {
            return;
        }
        // Marked seen only once accepted.
        match self.submit_transaction(tx, Some(peer)).await {
            Ok(_) => debug!(peer = %peer.address, tx = %short_hex(&hash), "transaction accepted"),
            Err(e) => {
                debug!(peer = %peer.address, tx = %short_hex(&hash), error = %e, "transaction dropped")
            }
        }
    }

    async fn handle_block(&self, peer: &PeerHandle, block: Block) -> Result<(), PeerError> {
        let hash = block.hash();
        if self.network.has_seen(&hash) {
            return Ok(());
        }

        let mut ledger = self.ledger.lock().await;
        let relation = ledger.chain.classify(&block);
        match relation {
            BlockRelation::Known => {
                self.network.mark_seen(hash);
                Ok(())
            }
            BlockRelation::ExtendsTip => {
                let index = block.index();
                let committed = self.accept_block(&mut ledger, block.clone());
                match committed {
                    Ok(()) => {
                        drop(ledger);
                        self.network.mark_seen(hash);
                        info!(peer = %peer.address, height = index, hash = %short_hex(&hash), "block accepted");
                        self.network
                            .broadcast(&Message::NewBlock(block), Some(&peer.address));
                    }
                    Err(e) => {
                        warn!(peer = %peer.address, height = index, error = %e, "block rejected")
                    }
                }
                Ok(())
            }
            BlockRelation::Ahead => {
                drop(ledger);
                debug!(peer = %peer.address, height = block.index(), "peer is ahead, requesting chain");
                peer.send(Message::GetChain).await
            }
            BlockRelation::Stale => {
                debug!(peer = %peer.address, height = block.index(), "ignoring stale block");
                Ok(())
            }
        }
    }

    async fn handle_chain(&self, peer: &PeerHandle, blocks: Vec<Block>) -> Result<(), ChainError> {
        let local_len = self.ledger.lock().await.chain.len();
        if blocks.len() <= local_len {
            return Err(ChainError::StalePeerData(format!(
                "Offered chain has {} blocks, local chain has {}",
                blocks.len(),
                local_len
            )));
        }

        let params = self.params.clone();
        let candidate = tokio::task::spawn_blocking(move || ValidatedChain::validate(blocks, &params))
            .await
            .map_err(|e| ChainError::IoError(format!("Chain validation task failed: {}", e)))??;

        let mut ledger = self.ledger.lock().await;
        let abandoned = ledger.chain.replace_chain(candidate)?;
        let Ledger { chain, mempool } = &mut *ledger;
        mempool.prune_stale(chain.state());
        let readmitted = mempool.readmit(
            abandoned.into_iter().flat_map(|b| b.transactions),
            chain.state(),
        );
        self.cancel_mining_jobs();
        let tip = chain.tip().clone();
        drop(ledger);

        info!(
            peer = %peer.address,
            height = tip.index(),
            tip = %short_hex(&tip.hash()),
            readmitted,
            "adopted longer chain"
        );
        self.network.mark_seen(tip.hash());
        peer.mark_known(tip.hash());
        self.network
            .broadcast(&Message::NewBlock(tip), Some(&peer.address));
        Ok(())
    }

    async fn handle_hello(&self, peer: &PeerHandle, hello: Hello) -> Result<(), PeerError> {
        if peer.is_handshaked() {
            return Err(PeerError::Handshake("duplicate hello".to_string()));
        }
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(PeerError::Handshake(format!(
                "protocol version {} unsupported",
                hello.protocol_version
            )));
        }
        if hello.network_id != self.network_id {
            return Err(PeerError::Handshake(format!(
                "peer is on network {}",
                hello.network_id
            )));
        }
        if hello.genesis_hash != self.genesis_hash {
            return Err(PeerError::Handshake(format!(
                "genesis mismatch: {}",
                short_hex(&hello.genesis_hash)
            )));
        }

        peer.complete_handshake(hello.listen_port);
        info!(peer = %peer.address, height = hello.height, "handshake complete");

        // Outbound peers were already asked for their chain on connect.
        if !peer.outbound && hello.height > self.ledger.lock().await.chain.height() {
            peer.send(Message::GetChain).await?;
        }
        if self.auto_connect {
            peer.send(Message::GetPeers).await?;
        }
        Ok(())
    }

    fn handle_peers(self: &Arc<Self>, addresses: Vec<SocketAddr>) {
        if !self.auto_connect {
            return;
        }
        for address in addresses {
            if self.network.peer_count() >= self.network.max_peers() {
                break;
            }
            if self.network.is_connected_to(&address) || self.is_own_listen_address(&address) {
                continue;
            }
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.connect(address.to_string()).await {
                    debug!(peer = %address, error = %e, "auto-connect failed");
                }
            });
        }
    }

    async fn dispatch(self: Arc<Self>, peer: PeerHandle, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Hello(hello) => self.handle_hello(&peer, hello).await,
            Message::NewTransaction(tx) => {
                self.handle_transaction(&peer, tx).await;
                Ok(())
            }
            Message::NewBlock(block) => self.handle_block(&peer, block).await,
            Message::GetChain => {
                let blocks = self.ledger.lock().await.chain.blocks().to_vec();
                peer.send(Message::Chain(blocks)).await
            }
            Message::Chain(blocks) => {
                match self.handle_chain(&peer, blocks).await {
                    Ok(()) => {}
                    Err(e @ ChainError::StalePeerData(_)) => {
                        debug!(peer = %peer.address, error = %e, "kept local chain")
                    }
                    Err(e) => warn!(peer = %peer.address, error = %e, "rejected peer chain"),
                }
                Ok(())
            }
            Message::GetPeers => {
                let addresses = self.network.listen_addresses(Some(&peer.address));
                peer.send(Message::Peers(addresses)).await
            }
            Message::Peers(addresses) => {
                self.handle_peers(addresses);
                Ok(())
            }
        }
    }
}

impl MessageHandler for NodeInner {
    fn on_connect(self: Arc<Self>, peer: PeerHandle) -> BoxFuture<'static, Result<(), PeerError>> {
        Box::pin(async move {
            let height = self.ledger.lock().await.chain.height();
            peer.send(self.hello(height)).await?;
            if peer.outbound {
                peer.send(Message::GetChain).await?;
            }
            Ok(())
        })
    }

    fn on_message(
        self: Arc<Self>,
        peer: PeerHandle,
        message: Message,
    ) -> BoxFuture<'static, Result<(), PeerError>> {
        Box::pin(self.dispatch(peer, message))
    }

    fn on_disconnect(&self, peer: &PeerHandle, _reason: &PeerError) {
        if let Some(listen) = peer.listen_address() {
            debug!(peer = %peer.address, listen = %listen, "peer removed");
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &address_to_hex(&self.inner.wallet.address()))
            .field("network_id", &self.inner.network_id)
            .field("listen", &self.listen_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn unstarted_node(difficulty: u32) -> Node {
        let mut config = Config::default();
        config.network.listen_host = "127.0.0.1".to_string();
        config.network.p2p_port = 0;
        config.chain.difficulty = difficulty;
        Node::new(&config, KeyPair::generate()).unwrap()
    }

    #[tokio::test]
    async fn test_incoming_block_cancels_search_on_old_tip() {
        timeout(Duration::from_secs(60), async {
            let node = unstarted_node(16);
            let genesis = node.block(0).await.unwrap();
            let params = node.params().clone();
            let rival = KeyPair::generate().address();
            let incoming = tokio::task::spawn_blocking(move || {
                mine_block(&genesis, vec![], rival, &params, &AtomicBool::new(false))
            })
            .await
            .unwrap()
            .unwrap();

            let miner = node.clone();
            let search = tokio::spawn(async move { miner.mine_once().await });
            while node.inner.mining_jobs.lock().is_empty() {
                tokio::task::yield_now().await;
            }

            let mut ledger = node.inner.ledger.lock().await;
            node.inner.accept_block(&mut ledger, incoming.clone()).unwrap();
            drop(ledger);

            assert!(matches!(search.await.unwrap(), Err(ChainError::MiningCancelled)));
            assert_eq!(node.height().await, 1);
            assert_eq!(node.chain_summary().await.tip_hash, incoming.hash());
            assert_eq!(node.balance(&node.beneficiary()).await, 0);
            assert!(node.inner.mining_jobs.lock().is_empty());
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn test_stop_mining_cancels_search() {
        timeout(Duration::from_secs(10), async {
            // Far beyond what can be solved while the test runs.
            let node = unstarted_node(64);
            let miner = node.clone();
            let search = tokio::spawn(async move { miner.mine_once().await });
            while node.inner.mining_jobs.lock().is_empty() {
                tokio::task::yield_now().await;
            }

            node.stop_mining();
            assert!(matches!(search.await.unwrap(), Err(ChainError::MiningCancelled)));
            assert_eq!(node.height().await, 0);
        })
        .await
        .expect("test timed out");
    }
}
