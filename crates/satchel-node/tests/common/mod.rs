//! In-process transport and chain fixtures for engine tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use satchel_core::address::Address;
use satchel_core::constants::{CoinType, Network};
use satchel_core::error::NetworkError;
use satchel_core::types::{
    Block, BlockHeader, Hash256, OutPoint, Script, Transaction, TxInput, TxOutput, merkle_root,
};
use satchel_network::{
    Multiaddr, NetworkMessage, PeerId, PeerTransport, TransportEvent, VersionMessage, WalletRequest,
    WalletResponse,
};
use satchel_node_lib::{NodeConfig, WalletEngine, WalletEvent, WalletStorage};
use satchel_wallet::keychain::DEFAULT_LOOKAHEAD;
use satchel_wallet::{KeyChain, Seed};

pub const COIN: u64 = 100_000_000;

pub fn seed() -> Seed {
    Seed::from_bytes([0x42; 64])
}

/// A key chain over the same seed as the engine, for computing expected addresses.
pub fn mirror_keychain() -> KeyChain {
    KeyChain::new(seed(), Network::Regtest, CoinType::Testnet, DEFAULT_LOOKAHEAD).unwrap()
}

pub fn receive_address(index: u32) -> Address {
    let mut kc = mirror_keychain();
    let mut address = kc.next_receive_address().unwrap().0;
    for _ in 0..index {
        address = kc.next_receive_address().unwrap().0;
    }
    address
}

/// An address the wallet does not own.
pub fn foreign_address() -> Address {
    Address::from_pubkey_hash([0xbb; 20], Network::Regtest)
}

pub fn config(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::for_network(Network::Regtest);
    config.data_dir = dir.to_path_buf();
    config.send_timeout = Duration::from_secs(5);
    config.shutdown_grace = Duration::from_secs(5);
    config.p2p.request_timeout = Duration::from_secs(5);
    config.p2p.backoff_base = Duration::from_millis(20);
    config.p2p.backoff_cap = Duration::from_millis(100);
    // The manual peer is unreachable unless a test sets a dial target.
    config.p2p.max_retries = None;
    config
}

pub async fn start_engine(config: NodeConfig, transport: Arc<MockTransport>) -> Arc<WalletEngine> {
    std::fs::create_dir_all(config.wallet_dir()).unwrap();
    let storage = Arc::new(WalletStorage::open(config.db_path(), config.network).unwrap());
    WalletEngine::start(config, seed(), transport, storage).await.unwrap()
}

/// Next event matching `pred`, failing the test after ten seconds.
pub async fn wait_for(
    sub: &mut satchel_node_lib::Subscription,
    pred: impl Fn(&WalletEvent) -> bool,
) -> WalletEvent {
    let wait = async {
        loop {
            match sub.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => {}
                None => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for event")
}

/// Every event up to and including the next sync-complete.
pub async fn collect_until_synced(sub: &mut satchel_node_lib::Subscription) -> Vec<WalletEvent> {
    let wait = async {
        let mut seen = Vec::new();
        while let Some(event) = sub.recv().await {
            let done = matches!(event, WalletEvent::SyncComplete { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("event bus closed");
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for sync")
}

pub fn coinbase(height: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: height.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput { value: 50 * COIN, script_pubkey: Script::p2pkh(&[0xee; 20]) }],
        lock_time: 0,
    }
}

/// A transaction paying `value` to `address` from an output the wallet does not know.
pub fn payment(to: &Address, value: u64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([tag; 32]), 0))],
        outputs: vec![TxOutput { value, script_pubkey: to.script_pubkey() }],
        lock_time: 0,
    }
}

pub fn make_block(prev_hash: Hash256, height: u64, extra: Vec<Transaction>) -> Block {
    let mut transactions = vec![coinbase(height)];
    transactions.extend(extra);
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: merkle_root(&txids),
            timestamp: 1_700_000_000 + height * 600,
            bits: 0x207f_ffff,
            nonce: height as u32,
        },
        transactions,
    }
}

/// Linked chain of `len` blocks; `payments` maps heights to extra transactions.
pub fn build_chain(len: u64, mut payments: HashMap<u64, Vec<Transaction>>) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    for height in 0..len {
        let prev = blocks.last().map_or(Hash256::ZERO, Block::hash);
        blocks.push(make_block(prev, height, payments.remove(&height).unwrap_or_default()));
    }
    blocks
}

/// Block extending `chain` with `extra` transactions.
pub fn next_block(chain: &[Block], extra: Vec<Transaction>) -> Block {
    let prev = chain.last().map_or(Hash256::ZERO, Block::hash);
    make_block(prev, chain.len() as u64, extra)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitBehaviour {
    Accept,
    Reject(String),
    Hang,
}

struct MockPeer {
    chain: Vec<Block>,
    submit: SubmitBehaviour,
    /// Heights served once with a tampered body.
    tamper: HashSet<u64>,
    /// Heights answered once with the next block instead.
    swap: HashSet<u64>,
    hang_blocks: bool,
    network: Network,
    /// Best height claimed in the handshake instead of the real tip.
    announced_height: Option<u64>,
}

/// Serves chain data and records submissions, without sockets.
pub struct MockTransport {
    local: PeerId,
    events: broadcast::Sender<TransportEvent>,
    peers: Mutex<HashMap<PeerId, MockPeer>>,
    connected: Mutex<HashSet<PeerId>>,
    dial_target: Mutex<Option<PeerId>>,
    submitted: Mutex<Vec<(PeerId, Transaction)>>,
    broadcasts: Mutex<Vec<NetworkMessage>>,
    block_requests: Mutex<HashMap<Hash256, usize>>,
    shut_down: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            local: PeerId::random(),
            events,
            peers: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            dial_target: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            block_requests: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn add_peer(&self, chain: Vec<Block>) -> PeerId {
        let peer = PeerId::random();
        self.peers.lock().insert(
            peer,
            MockPeer {
                chain,
                submit: SubmitBehaviour::Accept,
                tamper: HashSet::new(),
                swap: HashSet::new(),
                hang_blocks: false,
                network: Network::Regtest,
                announced_height: None,
            },
        );
        peer
    }

    /// Report an inbound connection from `peer`.
    pub fn connect(&self, peer: PeerId) {
        self.connected.lock().insert(peer);
        let _ = self.events.send(TransportEvent::Connected { peer });
    }

    /// The peer a dial to any address reaches.
    pub fn set_dial_target(&self, peer: PeerId) {
        *self.dial_target.lock() = Some(peer);
    }

    pub fn set_submit(&self, peer: PeerId, behaviour: SubmitBehaviour) {
        self.with_peer(peer, |p| p.submit = behaviour);
    }

    pub fn set_network(&self, peer: PeerId, network: Network) {
        self.with_peer(peer, |p| p.network = network);
    }

    pub fn announce_height(&self, peer: PeerId, height: u64) {
        self.with_peer(peer, |p| p.announced_height = Some(height));
    }

    pub fn tamper_once(&self, peer: PeerId, height: u64) {
        self.with_peer(peer, |p| {
            p.tamper.insert(height);
        });
    }

    pub fn swap_once(&self, peer: PeerId, height: u64) {
        self.with_peer(peer, |p| {
            p.swap.insert(height);
        });
    }

    pub fn hang_block_requests(&self, peer: PeerId) {
        self.with_peer(peer, |p| p.hang_blocks = true);
    }

    /// Append `block` to the peer's chain and announce it over gossip.
    pub fn mine(&self, peer: PeerId, block: Block) {
        self.with_peer(peer, |p| p.chain.push(block.clone()));
        self.gossip(peer, NetworkMessage::NewBlock(block));
    }

    pub fn gossip(&self, peer: PeerId, message: NetworkMessage) {
        let _ = self.events.send(TransportEvent::Gossip { peer, message });
    }

    pub fn submitted(&self) -> Vec<(PeerId, Transaction)> {
        self.submitted.lock().clone()
    }

    pub fn broadcasts(&self) -> Vec<NetworkMessage> {
        self.broadcasts.lock().clone()
    }

    pub fn block_requests(&self, hash: &Hash256) -> usize {
        self.block_requests.lock().get(hash).copied().unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn with_peer(&self, peer: PeerId, f: impl FnOnce(&mut MockPeer)) {
        let mut peers = self.peers.lock();
        f(peers.get_mut(&peer).expect("unknown mock peer"));
    }

    /// Synchronous part of a request. `None` means never answer.
    fn respond(&self, peer: PeerId, request: WalletRequest) -> Option<Result<WalletResponse, NetworkError>> {
        let mut peers = self.peers.lock();
        let Some(state) = peers.get_mut(&peer) else {
            return Some(Err(NetworkError::PeerDisconnected("unknown peer".into())));
        };
        let response = match request {
            WalletRequest::Handshake(_) => {
                let mut version = VersionMessage::local(state.network);
                if let Some(tip) = state.chain.last() {
                    version.best_height = state.chain.len() as u64 - 1;
                    version.best_hash = tip.hash();
                }
                if let Some(height) = state.announced_height {
                    version.best_height = height;
                }
                WalletResponse::Handshake(version)
            }
            WalletRequest::GetHeaders { locator } => {
                let start = locator
                    .iter()
                    .find_map(|hash| state.chain.iter().position(|b| b.hash() == *hash))
                    .map_or(0, |i| i + 1);
                WalletResponse::Headers(state.chain[start..].iter().map(|b| b.header.clone()).collect())
            }
            WalletRequest::GetBlock(hash) => {
                *self.block_requests.lock().entry(hash).or_default() += 1;
                if state.hang_blocks {
                    return None;
                }
                let Some(height) = state.chain.iter().position(|b| b.hash() == hash) else {
                    return Some(Ok(WalletResponse::Block(None)));
                };
                let height_u64 = height as u64;
                let mut block = state.chain[height].clone();
                if state.swap.remove(&height_u64) {
                    if let Some(next) = state.chain.get(height + 1) {
                        block = next.clone();
                    }
                } else if state.tamper.remove(&height_u64) {
                    block.transactions[0].outputs[0].value += 1;
                }
                WalletResponse::Block(Some(block))
            }
            WalletRequest::SubmitTransaction(tx) => {
                let txid = tx.txid();
                match state.submit.clone() {
                    SubmitBehaviour::Accept => {
                        self.submitted.lock().push((peer, tx));
                        WalletResponse::TxAccepted(txid)
                    }
                    SubmitBehaviour::Reject(reason) => WalletResponse::TxRejected { txid, reason },
                    SubmitBehaviour::Hang => {
                        self.submitted.lock().push((peer, tx));
                        return None;
                    }
                }
            }
        };
        Some(Ok(response))
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn dial(&self, _addr: Multiaddr) -> Result<PeerId, NetworkError> {
        let target = *self.dial_target.lock();
        match target {
            Some(peer) => {
                self.connect(peer);
                Ok(peer)
            }
            None => Err(NetworkError::Transport("connection refused".into())),
        }
    }

    async fn request(&self, peer: PeerId, request: WalletRequest) -> Result<WalletResponse, NetworkError> {
        match self.respond(peer, request) {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    fn broadcast(&self, message: NetworkMessage) -> Result<(), NetworkError> {
        self.broadcasts.lock().push(message);
        Ok(())
    }

    fn disconnect(&self, peer: PeerId) {
        if self.connected.lock().remove(&peer) {
            let _ = self.events.send(TransportEvent::Disconnected { peer, reason: "closed locally".into() });
        }
    }

    fn peer_count(&self) -> usize {
        self.connected.lock().len()
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
