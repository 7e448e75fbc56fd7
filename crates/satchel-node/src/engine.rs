//! Wallet engine composition and coordinator loop.
//!
//! [`WalletEngine`] is constructed once and shared by reference (RPC server,
//! observers, the daemon). It owns:
//!
//! - the key chain, behind a `parking_lot::Mutex`
//! - the [`WalletStore`], the only place wallet state is mutated
//! - RocksDB persistence
//! - a coordinator task that runs every peer lifecycle and the chain sync
//!
//! Lock order is key chain first, then store. Neither lock is held across an
//! `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use satchel_core::address::Address;
use satchel_core::constants::Network;
use satchel_core::error::NetworkError;
use satchel_core::types::{Block, Hash256, Transaction};
use satchel_network::{
    Backoff, BlockVerdict, HeadersOutcome, Multiaddr, NetworkConfig, NetworkMessage, PeerConnection, PeerId,
    PeerState, PeerTransport, SyncAction, SyncConfig, SyncManager, SyncProgress, TransportEvent, VersionMessage,
    WalletRequest, WalletResponse,
};
use satchel_wallet::{Balance, HistoryEntry, KeyChain, Seed, StoreError, TxEffect, WalletStore};

use crate::config::NodeConfig;
use crate::error::{EngineError, SendError};
use crate::events::{EventBus, Subscription, SubscriptionHandle, WalletEvent, WalletObserver};
use crate::sender::{SendPolicy, Sender, SubmittedTransaction};
use crate::storage::WalletStorage;

/// How often the coordinator re-plans when nothing else wakes it.
const TICK: Duration = Duration::from_millis(250);

/// Ready peers and their announced heights, shared with the sender.
#[derive(Debug, Default)]
pub(crate) struct PeerDirectory {
    ready: RwLock<BTreeMap<PeerId, u64>>,
}

impl PeerDirectory {
    fn insert(&self, peer: PeerId, best_height: u64) {
        self.ready.write().insert(peer, best_height);
    }

    fn remove(&self, peer: &PeerId) -> bool {
        self.ready.write().remove(peer).is_some()
    }

    fn observe(&self, peer: &PeerId, height: u64) {
        if let Some(best) = self.ready.write().get_mut(peer) {
            *best = (*best).max(height);
        }
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.ready.read().contains_key(peer)
    }

    pub(crate) fn count(&self) -> usize {
        self.ready.read().len()
    }

    /// Ready peer with the highest announced chain, lowest id on ties.
    pub(crate) fn best_ready(&self) -> Option<PeerId> {
        self.ready
            .read()
            .iter()
            .max_by(|(a_id, a), (b_id, b)| a.cmp(b).then(b_id.cmp(a_id)))
            .map(|(peer, _)| *peer)
    }
}

/// Write the wallet record and the key-chain cursors in one batch.
fn persist_wallet(
    storage: &WalletStorage,
    wallet_id: &str,
    keychain: &Mutex<KeyChain>,
    store: &WalletStore,
) -> Result<(), EngineError> {
    let cursors = keychain.lock().cursors();
    store.read(|state| storage.save_wallet(wallet_id, state, &cursors))
}

/// The running wallet.
pub struct WalletEngine {
    config: NodeConfig,
    keychain: Arc<Mutex<KeyChain>>,
    store: Arc<WalletStore>,
    storage: Arc<WalletStorage>,
    transport: Arc<dyn PeerTransport>,
    peers: Arc<PeerDirectory>,
    events: EventBus,
    progress: Arc<RwLock<SyncProgress>>,
    sender: Sender,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WalletEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletEngine")
            .field("network", &self.config.network)
            .field("wallet_id", &self.config.wallet_id)
            .field("peers", &self.peers.count())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl WalletEngine {
    /// Restore the wallet from `storage` and start the coordinator.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(
        config: NodeConfig,
        seed: Seed,
        transport: Arc<dyn PeerTransport>,
        storage: Arc<WalletStorage>,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate()?;

        let mut keychain = KeyChain::new(seed, config.network, config.coin_type, config.lookahead)?;
        if let Some(cursors) = storage.load_cursors(&config.wallet_id)? {
            keychain.restore(cursors)?;
        }
        let state = storage.load_wallet(&config.wallet_id)?.unwrap_or_default();
        let tip = state.tip();
        let headers = storage.load_headers()?;
        let sync = SyncManager::new(
            SyncConfig::from_network_config(&config.p2p),
            headers,
            tip.map(|t| t.height),
        );

        info!(
            data_dir = %config.data_dir.display(),
            network = %config.network,
            wallet = %config.wallet_id,
            tip = ?tip.map(|t| t.height),
            headers = ?sync.header_height(),
            "starting wallet engine"
        );

        let keychain = Arc::new(Mutex::new(keychain));
        let store = Arc::new(WalletStore::new(state));
        let peers = Arc::new(PeerDirectory::default());
        let events = EventBus::new();
        let progress = Arc::new(RwLock::new(sync.progress()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let manual = config.p2p.manual_peer()?.map(|addr| ManualPeer {
            addr,
            backoff: Backoff::from_config(&config.p2p),
            peer: None,
            pending: false,
            redial_at: None,
            exhausted: false,
        });

        let sender = Sender::new(
            SendPolicy {
                network: config.network,
                fee: config.fee,
                spend_unconfirmed: config.spend_unconfirmed,
                timeout: config.send_timeout,
            },
            Arc::clone(&keychain),
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&peers),
        );

        // Subscribe before spawning so no connection event is missed.
        let transport_events = transport.subscribe();
        let persisted_headers = sync.header_height().map_or(0, |h| h.saturating_add(1));
        let coordinator = Coordinator {
            network: config.network,
            p2p: config.p2p.clone(),
            wallet_id: config.wallet_id.clone(),
            keychain: Arc::clone(&keychain),
            store: Arc::clone(&store),
            storage: Arc::clone(&storage),
            transport: Arc::clone(&transport),
            peers: Arc::clone(&peers),
            events: events.clone(),
            progress: Arc::clone(&progress),
            sync,
            connections: HashMap::new(),
            manual,
            tasks: JoinSet::new(),
            persisted_headers,
            reservation_expiry_blocks: config.reservation_expiry_blocks,
            stopping: false,
        };
        let task = tokio::spawn(coordinator.run(shutdown_rx, transport_events));

        Ok(Arc::new(Self {
            config,
            keychain,
            store,
            storage,
            transport,
            peers,
            events,
            progress,
            sender,
            running: AtomicBool::new(true),
            shutdown,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn balance(&self) -> Balance {
        self.store.balance()
    }

    /// Transactions that touched the wallet, in the order they were observed.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.store.read(|state| state.history().to_vec())
    }

    pub fn sync_progress(&self) -> SyncProgress {
        self.progress.read().clone()
    }

    /// Peers past the handshake.
    pub fn peer_count(&self) -> usize {
        self.peers.count()
    }

    /// Hand out the next receive address and persist the cursor.
    pub fn new_receive_address(&self) -> Result<Address, EngineError> {
        let (address, origin) = self.keychain.lock().next_receive_address()?;
        persist_wallet(&self.storage, &self.config.wallet_id, &self.keychain, &self.store)?;
        debug!(%address, %origin, "receive address issued");
        Ok(address)
    }

    /// Pay `amount` (in coins, e.g. `"0.5"`) to `address`.
    pub async fn send(&self, address: &str, amount: &str) -> Result<SubmittedTransaction, SendError> {
        if !self.is_running() {
            return Err(SendError::Internal("engine is not running".into()));
        }
        let result = self.sender.send(address, amount).await;
        match &result {
            Err(SendError::AddressInvalid(_) | SendError::AmountInvalid(_) | SendError::InsufficientFunds(_)) => {}
            // A change address may have been handed out.
            _ => {
                if let Err(e) = persist_wallet(&self.storage, &self.config.wallet_id, &self.keychain, &self.store) {
                    error!("failed to persist wallet after send: {e}");
                }
            }
        }
        result
    }

    /// Pull-style event subscription.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Register a callback observer.
    pub fn observe(&self, observer: Arc<dyn WalletObserver>) -> SubscriptionHandle {
        self.events.observe(observer)
    }

    /// Stop within the configured grace period.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.stop_within(self.config.shutdown_grace).await
    }

    /// Ask the coordinator to wind down and wait up to `grace` for it.
    ///
    /// When the grace period elapses the coordinator is aborted, state is
    /// saved from the last consistent snapshot and `ShutdownTimeout` is returned.
    pub async fn stop_within(&self, grace: Duration) -> Result<(), EngineError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        info!(?grace, "stopping wallet engine");
        self.shutdown.send_replace(true);

        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return Ok(());
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("coordinator task failed: {e}");
                self.force_close().await;
                Err(EngineError::TaskFailed(e.to_string()))
            }
            Err(_) => {
                warn!(?grace, "shutdown grace period elapsed, forcing termination");
                task.abort();
                self.force_close().await;
                Err(EngineError::ShutdownTimeout(grace))
            }
        }
    }

    async fn force_close(&self) {
        if let Err(e) = persist_wallet(&self.storage, &self.config.wallet_id, &self.keychain, &self.store) {
            error!("failed to persist wallet: {e}");
        }
        if let Err(e) = self.storage.flush() {
            error!("failed to flush storage: {e}");
        }
        self.transport.shutdown().await;
    }
}

/// The configured peer of manual mode.
struct ManualPeer {
    addr: Multiaddr,
    backoff: Backoff,
    /// Identity once a dial succeeded and until the connection is lost.
    peer: Option<PeerId>,
    pending: bool,
    redial_at: Option<Instant>,
    exhausted: bool,
}

enum TaskOutput {
    Dialed(Result<PeerId, NetworkError>),
    Handshake { peer: PeerId, result: Result<WalletResponse, NetworkError> },
    Headers { peer: PeerId, result: Result<WalletResponse, NetworkError> },
    Block { peer: PeerId, hash: Hash256, result: Result<WalletResponse, NetworkError> },
}

/// Single owner of peer lifecycles and the sync planner.
struct Coordinator {
    network: Network,
    p2p: NetworkConfig,
    wallet_id: String,
    keychain: Arc<Mutex<KeyChain>>,
    store: Arc<WalletStore>,
    storage: Arc<WalletStorage>,
    transport: Arc<dyn PeerTransport>,
    peers: Arc<PeerDirectory>,
    events: EventBus,
    progress: Arc<RwLock<SyncProgress>>,
    sync: SyncManager,
    connections: HashMap<PeerId, PeerConnection>,
    manual: Option<ManualPeer>,
    tasks: JoinSet<TaskOutput>,
    /// Headers below this height are already in storage.
    persisted_headers: u64,
    /// Blocks an unseen send keeps its inputs reserved.
    reservation_expiry_blocks: u64,
    stopping: bool,
}

impl Coordinator {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>, mut events: broadcast::Receiver<TransportEvent>) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.on_transport_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "lagged behind on transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("transport event channel closed");
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(output) => self.on_task_output(output),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!("engine task failed: {e}"),
                },
                _ = tick.tick() => {}
            }
            self.drive(Instant::now());
        }

        self.shutdown().await;
    }

    /// Apply what arrived, then plan and issue the next requests.
    fn drive(&mut self, now: Instant) {
        if self.stopping {
            return;
        }
        self.redial_if_due(now);
        self.connect_blocks();
        for action in self.sync.next_actions(now.into_std()) {
            self.execute(action);
        }
        self.refresh_peer_states();
        self.persist_headers();
        *self.progress.write() = self.sync.progress();
    }

    fn execute(&mut self, action: SyncAction) {
        match action {
            SyncAction::RequestHeaders { peer, locator } => {
                debug!(%peer, locator = locator.len(), "requesting headers");
                self.spawn_request(peer, WalletRequest::GetHeaders { locator }, move |result| {
                    TaskOutput::Headers { peer, result }
                });
            }
            SyncAction::RequestBlock { peer, hash } => {
                self.spawn_request(peer, WalletRequest::GetBlock(hash), move |result| TaskOutput::Block {
                    peer,
                    hash,
                    result,
                });
            }
            SyncAction::DropPeer { peer, reason } => {
                warn!(%peer, reason, "disconnecting peer");
                self.transport.disconnect(peer);
                self.peer_lost(peer, &reason, Instant::now());
            }
            SyncAction::SyncComplete { height } => {
                info!(?height, "blockchain sync complete");
                self.events.publish(WalletEvent::SyncComplete { height });
            }
        }
    }

    fn spawn_request(
        &mut self,
        peer: PeerId,
        request: WalletRequest,
        wrap: impl FnOnce(Result<WalletResponse, NetworkError>) -> TaskOutput + Send + 'static,
    ) {
        let transport = Arc::clone(&self.transport);
        self.tasks.spawn(async move { wrap(transport.request(peer, request).await) });
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer } => self.on_connected(peer),
            TransportEvent::Disconnected { peer, reason } => self.peer_lost(peer, &reason, Instant::now()),
            TransportEvent::Gossip { peer, message } => {
                if !self.peers.contains(&peer) {
                    debug!(%peer, "ignoring gossip from peer without handshake");
                    return;
                }
                match message {
                    NetworkMessage::NewBlock(block) => self.accept_block(peer, block, None),
                    NetworkMessage::NewTransaction(tx) => self.on_transaction(tx),
                }
            }
        }
    }

    fn on_task_output(&mut self, output: TaskOutput) {
        match output {
            TaskOutput::Dialed(result) => self.on_dialed(result),
            TaskOutput::Handshake { peer, result } => self.on_handshake(peer, result),
            TaskOutput::Headers { peer, result } => match result {
                Ok(WalletResponse::Headers(headers)) => match self.sync.on_headers(&peer, headers) {
                    HeadersOutcome::Extended { from_height, count } => {
                        debug!(%peer, from_height, count, "headers received");
                        if let Some(tip) = self.sync.header_height() {
                            self.peers.observe(&peer, tip);
                        }
                    }
                    HeadersOutcome::UpToDate => debug!(%peer, "peer has no newer headers"),
                    HeadersOutcome::NonLinking => {}
                },
                Ok(_) => {
                    warn!(%peer, "unexpected response to headers request");
                    self.sync.on_headers_failed(&peer);
                }
                Err(e) => {
                    warn!(%peer, "headers request failed: {e}");
                    self.sync.on_headers_failed(&peer);
                }
            },
            TaskOutput::Block { peer, hash, result } => match result {
                Ok(WalletResponse::Block(Some(block))) => self.accept_block(peer, block, Some(hash)),
                Ok(WalletResponse::Block(None)) => {
                    debug!(%peer, %hash, "peer does not have block");
                    self.sync.on_block_failed(&peer, &hash);
                }
                Ok(_) => {
                    warn!(%peer, %hash, "unexpected response to block request");
                    self.sync.on_block_failed(&peer, &hash);
                }
                Err(e) => {
                    warn!(%peer, %hash, "block request failed: {e}");
                    self.sync.on_block_failed(&peer, &hash);
                }
            },
        }
    }

    fn on_connected(&mut self, peer: PeerId) {
        if self.stopping || peer == self.transport.local_peer_id() {
            return;
        }
        let conn = self
            .connections
            .entry(peer)
            .or_insert_with(|| PeerConnection::new(Backoff::from_config(&self.p2p)));
        if conn.state() != PeerState::Disconnected {
            return;
        }
        if conn.is_exhausted() {
            debug!(%peer, attempts = conn.failed_attempts(), "refusing peer with spent retry budget");
            self.transport.disconnect(peer);
            return;
        }
        if let Err(e) = conn
            .transition(PeerState::Connecting)
            .and_then(|()| conn.transition(PeerState::Handshaking))
        {
            warn!(%peer, "{e}");
            return;
        }
        debug!(%peer, "handshaking");
        let version = VersionMessage::local(self.network);
        self.spawn_request(peer, WalletRequest::Handshake(version), move |result| TaskOutput::Handshake {
            peer,
            result,
        });
    }

    fn on_handshake(&mut self, peer: PeerId, result: Result<WalletResponse, NetworkError>) {
        let network = self.network;
        let version = match result {
            Ok(WalletResponse::Handshake(version)) => version.check_compatible(network).map(|()| version),
            Ok(_) => Err(NetworkError::Rejected("unexpected response to handshake".into())),
            Err(e) => Err(e),
        };
        let version = match version {
            Ok(version) => version,
            Err(e) => {
                warn!(%peer, "handshake failed: {e}");
                self.transport.disconnect(peer);
                self.peer_lost(peer, &e.to_string(), Instant::now());
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        if conn.state() != PeerState::Handshaking {
            // Lost while the handshake was in flight.
            return;
        }
        let best_height = (!version.best_hash.is_zero()).then_some(version.best_height);
        if let Err(e) = conn.on_handshake(version) {
            warn!(%peer, "{e}");
            return;
        }

        self.sync.on_peer_ready(peer, best_height);
        self.peers.insert(peer, best_height.unwrap_or(0));
        if let Some(manual) = self.manual.as_mut().filter(|m| m.peer == Some(peer)) {
            manual.backoff.reset();
        }
        let peers = self.peers.count();
        info!(peer = %peer, peers, best_height = ?best_height, "peer connected");
        self.events.publish(WalletEvent::PeerConnected { peer, peers });
    }

    /// Connection to `peer` ended, for any reason. Idempotent.
    fn peer_lost(&mut self, peer: PeerId, reason: &str, now: Instant) {
        self.sync.on_peer_disconnected(&peer);
        let was_ready = self.peers.remove(&peer);
        if let Some(conn) = self.connections.get_mut(&peer) {
            if conn.state() != PeerState::Disconnected {
                conn.on_failure();
            }
        }

        if was_ready {
            let peers = self.peers.count();
            info!(peer = %peer, peers, reason, "peer disconnected");
            self.events.publish(WalletEvent::PeerDisconnected { peer, peers });
        } else {
            debug!(%peer, reason, "connection closed");
        }

        let is_manual = self.manual.as_ref().is_some_and(|m| m.peer == Some(peer));
        if is_manual && !self.stopping {
            self.schedule_redial(now);
        }
    }

    fn on_dialed(&mut self, result: Result<PeerId, NetworkError>) {
        let Some(manual) = self.manual.as_mut() else {
            return;
        };
        manual.pending = false;
        match result {
            Ok(peer) => {
                debug!(%peer, addr = %manual.addr, "dial succeeded");
                manual.peer = Some(peer);
                // The connection event may have been consumed already.
                self.on_connected(peer);
            }
            Err(e) => {
                warn!(addr = %manual.addr, attempt = manual.backoff.attempts() + 1, "dial failed: {e}");
                if !self.stopping {
                    self.schedule_redial(Instant::now());
                }
            }
        }
    }

    fn schedule_redial(&mut self, now: Instant) {
        let Some(manual) = self.manual.as_mut() else {
            return;
        };
        manual.peer = None;
        if manual.pending || manual.redial_at.is_some() || manual.exhausted {
            return;
        }
        match manual.backoff.next_delay() {
            Some(delay) => {
                info!(addr = %manual.addr, ?delay, attempt = manual.backoff.attempts(), "will redial peer");
                manual.redial_at = Some(now + delay);
            }
            None => {
                manual.exhausted = true;
                error!(addr = %manual.addr, attempts = manual.backoff.attempts(), "peer unreachable, giving up");
                self.events.publish(WalletEvent::PeersExhausted);
            }
        }
    }

    fn redial_if_due(&mut self, now: Instant) {
        let Some(manual) = self.manual.as_mut() else {
            return;
        };
        if manual.pending || manual.exhausted || manual.peer.is_some() {
            return;
        }
        if manual.redial_at.is_some_and(|at| at > now) {
            return;
        }
        manual.redial_at = None;
        manual.pending = true;
        let addr = manual.addr.clone();
        info!(%addr, "dialing peer");

        let transport = Arc::clone(&self.transport);
        let timeout = self.p2p.connect_timeout;
        self.tasks.spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.dial(addr)).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout),
            };
            TaskOutput::Dialed(result)
        });
    }

    fn accept_block(&mut self, peer: PeerId, block: Block, requested: Option<Hash256>) {
        let hash = block.hash();
        match self.sync.on_block(&peer, block, requested) {
            BlockVerdict::Accepted { height } => {
                debug!(%peer, %hash, height, "block queued");
                self.peers.observe(&peer, height);
            }
            BlockVerdict::Duplicate => debug!(%peer, %hash, "duplicate block"),
            BlockVerdict::Rejected { reason } => warn!(%peer, %hash, reason, "block rejected"),
            BlockVerdict::Orphan => debug!(%peer, %hash, "block with unknown parent, fetching headers"),
        }
    }

    fn on_transaction(&mut self, tx: Transaction) {
        let effect = {
            let mut keychain = self.keychain.lock();
            if let Err(e) = keychain.observe(std::slice::from_ref(&tx)) {
                warn!(txid = %tx.txid(), "address window not extended: {e}");
            }
            self.store.update(|state| state.apply_transaction(&tx, None, None, &*keychain))
        };
        let effect = match effect {
            Ok(effect) => effect,
            Err(e) => {
                warn!(txid = %tx.txid(), "unconfirmed transaction not applied: {e}");
                return;
            }
        };
        if effect.is_new() {
            debug!(txid = %effect.txid, "unconfirmed transaction observed");
            self.save_wallet();
            self.publish_coins(&[effect]);
        }
    }

    /// Apply every downloaded block that extends the wallet tip, in height order.
    fn connect_blocks(&mut self) {
        let mut connected = 0usize;
        while let Some((height, block)) = self.sync.take_connectable() {
            let hash = block.hash();
            let result = {
                let mut keychain = self.keychain.lock();
                if let Err(e) = keychain.observe(&block.transactions) {
                    warn!(height, "address window not extended: {e}");
                }
                self.store.update(|state| state.apply_block(&block, height, &*keychain))
            };
            match result {
                Ok(effects) => {
                    connected += 1;
                    self.sync.block_applied(height);
                    self.save_wallet();
                    let remaining = self.sync.blocks_remaining();
                    info!(hash = %hash, height, remaining, "block received");
                    self.events.publish(WalletEvent::BlockReceived { hash, height, blocks_remaining: remaining });
                    self.publish_coins(&effects);
                }
                Err(StoreError::NonLinkingBlock { expected, got }) if got < expected => {
                    debug!(height, "block already in wallet");
                    self.sync.block_applied(height);
                }
                Err(e) => {
                    warn!(hash = %hash, height, "block not applied: {e}");
                    self.sync.block_failed(height);
                    break;
                }
            }
        }
        if connected > 0 {
            self.settle_reservations();
        }
    }

    /// Release sends that went unseen for too long, and relay the rest again
    /// once caught up.
    fn settle_reservations(&mut self) {
        let expiry = self.reservation_expiry_blocks;
        let (expired, pending) =
            self.store.update(|state| (state.expire_reservations(expiry), state.pending_transactions()));
        if !expired.is_empty() {
            for id in &expired {
                warn!(reservation = %id, blocks = expiry, "send never seen on the network; inputs released");
            }
            self.save_wallet();
        }
        if self.stopping || self.sync.blocks_remaining() > 0 {
            return;
        }
        for tx in pending {
            let txid = tx.txid();
            debug!(%txid, "relaying unconfirmed send again");
            if let Err(e) = self.transport.broadcast(NetworkMessage::NewTransaction(tx)) {
                debug!(%txid, "relay failed: {e}");
            }
        }
    }

    fn publish_coins(&self, effects: &[TxEffect]) {
        let balance = self.store.balance().total();
        for effect in effects.iter().filter(|e| e.is_new()) {
            let txid = effect.txid;
            if effect.received > effect.sent {
                let amount = effect.received - effect.sent;
                info!(txid = %txid, amount, balance, "coins received");
                self.events.publish(WalletEvent::CoinsReceived { txid, amount, balance });
            } else if effect.sent > effect.received {
                let amount = effect.sent - effect.received;
                info!(txid = %txid, amount, balance, "coins sent");
                self.events.publish(WalletEvent::CoinsSent { txid, amount, balance });
            }
        }
    }

    fn refresh_peer_states(&mut self) {
        for (peer, conn) in self.connections.iter_mut() {
            if !conn.state().is_usable() {
                continue;
            }
            let next = if self.sync.is_busy(peer) { PeerState::Syncing } else { PeerState::Idle };
            if conn.state() != next {
                if let Err(e) = conn.transition(next) {
                    debug!(%peer, "{e}");
                }
            }
        }
    }

    fn save_wallet(&self) {
        if let Err(e) = persist_wallet(&self.storage, &self.wallet_id, &self.keychain, &self.store) {
            error!("failed to persist wallet: {e}");
        }
    }

    fn persist_headers(&mut self) {
        let Some(tip) = self.sync.header_height() else {
            return;
        };
        if self.persisted_headers > tip {
            return;
        }
        let from = self.persisted_headers;
        match self.storage.put_headers(from, self.sync.headers_from(from)) {
            Ok(()) => self.persisted_headers = tip.saturating_add(1),
            Err(e) => error!(from, "failed to persist headers: {e}"),
        }
    }

    /// Stop issuing work, close connections and let in-flight requests settle.
    async fn shutdown(mut self) {
        self.stopping = true;
        for (peer, conn) in &self.connections {
            if conn.state() != PeerState::Disconnected {
                self.transport.disconnect(*peer);
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(output @ (TaskOutput::Block { .. } | TaskOutput::Headers { .. })) => self.on_task_output(output),
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("engine task failed: {e}"),
            }
        }
        self.connect_blocks();
        self.persist_headers();
        self.save_wallet();
        if let Err(e) = self.storage.flush() {
            error!("failed to flush storage: {e}");
        }
        *self.progress.write() = self.sync.progress();
        self.transport.shutdown().await;
        info!(applied = ?self.sync.applied_height(), "wallet engine stopped");
    }
}
