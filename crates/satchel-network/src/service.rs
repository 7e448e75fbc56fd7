//! libp2p implementation of [`PeerTransport`].
//!
//! Uses a command-channel architecture: [`NetworkNode`] sends commands over
//! an mpsc channel to a background task that owns the swarm. Dials and
//! requests carry a oneshot sender that the task completes when the swarm
//! reports the outcome.

use crate::behaviour::{SatchelBehaviour, SatchelBehaviourEvent};
use crate::config::NetworkConfig;
use crate::protocol::{
    BLOCKS_TOPIC, NetworkMessage, TXS_TOPIC, VersionMessage, WalletRequest, WalletResponse,
};
use crate::transport::{PeerTransport, TransportEvent};
use async_trait::async_trait;
use libp2p::futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{Multiaddr, PeerId, Swarm, SwarmBuilder, identify, mdns};
use satchel_core::constants::Network;
use satchel_core::error::NetworkError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Capacity of the transport event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connections with no open streams are closed after this long.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

type Reply<T> = oneshot::Sender<Result<T, NetworkError>>;

#[derive(Debug)]
enum Command {
    Dial { addr: Multiaddr, reply: Reply<PeerId> },
    Request { peer: PeerId, request: WalletRequest, reply: Reply<WalletResponse> },
    Publish { topic: &'static str, data: Vec<u8> },
    Disconnect(PeerId),
    Shutdown { done: oneshot::Sender<()> },
}

/// Shared atomic state between the [`NetworkNode`] handle and the swarm task.
struct SharedState {
    peer_count: AtomicUsize,
    running: AtomicBool,
}

/// Handle to the background swarm task.
pub struct NetworkNode {
    command_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TransportEvent>,
    state: Arc<SharedState>,
    local_peer_id: PeerId,
    network: Network,
}

impl std::fmt::Debug for NetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkNode")
            .field("peer_id", &self.local_peer_id)
            .field("network", &self.network)
            .field("peer_count", &self.state.peer_count.load(Ordering::Relaxed))
            .field("running", &self.state.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Load an Ed25519 identity from `path`, or generate one and save it there.
///
/// The file holds the raw 32-byte secret so the peer id survives restarts.
/// On Unix it is created with mode `0o600`.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, NetworkError> {
    let io_err = |what: &str, e: std::io::Error| {
        NetworkError::Transport(format!("{what} '{}': {e}", path.display()))
    };

    if path.exists() {
        let bytes = std::fs::read(path).map_err(|e| io_err("failed to read node key", e))?;
        let keypair = Keypair::ed25519_from_bytes(bytes).map_err(|e| {
            NetworkError::Transport(format!("invalid node key in '{}': {e}", path.display()))
        })?;
        info!(path = %path.display(), "loaded existing node identity key");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| io_err("failed to create directory for", e))?;
    }
    let secret: Vec<u8> = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| NetworkError::Transport(format!("keypair is not Ed25519: {e}")))?
        .secret()
        .as_ref()
        .to_vec();
    std::fs::write(path, &secret).map_err(|e| io_err("failed to write node key", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| io_err("failed to set permissions on", e))?;
    }

    info!(path = %path.display(), "generated new node identity key");
    Ok(keypair)
}

impl NetworkNode {
    /// Build the swarm, start listening and spawn the event loop.
    ///
    /// In discovery mode the bootstrap peers are dialed immediately and
    /// mDNS-discovered peers are dialed as they appear. In manual mode
    /// nothing is dialed here; the caller dials the configured peer.
    pub async fn start(config: &NetworkConfig, network: Network) -> Result<Self, NetworkError> {
        config.validate(network)?;

        let keypair = match &config.node_key_path {
            Some(path) => load_or_generate_keypair(path)?,
            None => Keypair::generate_ed25519(),
        };
        let local_peer_id = PeerId::from(keypair.public());
        let (bootstrap_peers, enable_mdns) = config.discovery();
        info!(%local_peer_id, %network, mdns = enable_mdns, "starting network node");

        let behaviour = SatchelBehaviour::new(
            &keypair,
            config.gossipsub_heartbeat,
            config.request_timeout,
            enable_mdns,
        )?;

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| NetworkError::Transport(format!("TCP transport error: {e}")))?
            .with_dns()
            .map_err(|e| NetworkError::Transport(format!("DNS transport error: {e}")))?
            .with_behaviour(|_| Ok(behaviour))
            .map_err(|e| NetworkError::Transport(format!("behaviour error: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        for topic in [BLOCKS_TOPIC, TXS_TOPIC] {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic))
                .map_err(|e| NetworkError::Transport(format!("subscribe {topic}: {e}")))?;
        }

        let listen_addr: Multiaddr = config
            .listen_multiaddr()
            .parse()
            .map_err(|e| NetworkError::Config(format!("invalid listen addr: {e}")))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NetworkError::Transport(format!("listen error: {e}")))?;

        for peer_addr in bootstrap_peers {
            let Ok(addr) = peer_addr.parse::<Multiaddr>() else {
                warn!(peer = %peer_addr, "ignoring unparsable bootstrap peer");
                continue;
            };
            if let Some(Protocol::P2p(peer_id)) = addr.iter().last() {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
            }
            if let Err(e) = swarm.dial(addr) {
                debug!("bootstrap dial error: {e}");
            }
        }
        if !bootstrap_peers.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                debug!("kademlia bootstrap: {e}");
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(SharedState {
            peer_count: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });

        let task = SwarmTask {
            swarm,
            network,
            dial_discovered: enable_mdns,
            events: events.clone(),
            state: Arc::clone(&state),
            pending_dials: HashMap::new(),
            pending_requests: HashMap::new(),
        };
        tokio::spawn(task.run(command_rx));

        Ok(Self { command_tx, events, state, local_peer_id, network })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Whether the background swarm event loop is still running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    fn send(&self, cmd: Command) -> Result<(), NetworkError> {
        self.command_tx.send(cmd).map_err(|_| NetworkError::ChannelClosed)
    }
}

#[async_trait]
impl PeerTransport for NetworkNode {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn dial(&self, addr: Multiaddr) -> Result<PeerId, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial { addr, reply })?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    async fn request(&self, peer: PeerId, request: WalletRequest) -> Result<WalletResponse, NetworkError> {
        request.validate()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Request { peer, request, reply })?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    fn broadcast(&self, message: NetworkMessage) -> Result<(), NetworkError> {
        let data = message.encode(self.network)?;
        self.send(Command::Publish { topic: message.topic(), data })
    }

    fn disconnect(&self, peer: PeerId) {
        let _ = self.send(Command::Disconnect(peer));
    }

    fn peer_count(&self) -> usize {
        self.state.peer_count.load(Ordering::Relaxed)
    }

    async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// State owned by the background swarm task.
struct SwarmTask {
    swarm: Swarm<SatchelBehaviour>,
    network: Network,
    dial_discovered: bool,
    events: broadcast::Sender<TransportEvent>,
    state: Arc<SharedState>,
    pending_dials: HashMap<ConnectionId, Reply<PeerId>>,
    pending_requests: HashMap<OutboundRequestId, Reply<WalletResponse>>,
}

impl SwarmTask {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Shutdown { done }) => {
                        self.stop();
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.stop();
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }
    }

    fn stop(&mut self) {
        info!("shutting down swarm event loop");
        self.state.running.store(false, Ordering::Relaxed);
        let peers: Vec<PeerId> = self.swarm.connected_peers().copied().collect();
        for peer in peers {
            let _ = self.swarm.disconnect_peer_id(peer);
        }
        // Dropping the pending senders fails their waiters with ChannelClosed.
        self.pending_dials.clear();
        self.pending_requests.clear();
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { addr, reply } => {
                let opts = DialOpts::unknown_peer_id().address(addr.clone()).build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        debug!(%addr, "dialing");
                        self.pending_dials.insert(connection_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::Transport(format!("dial {addr}: {e}"))));
                    }
                }
            }
            Command::Request { peer, request, reply } => {
                debug!(%peer, kind = request.kind(), "sending request");
                let id = self.swarm.behaviour_mut().request_response.send_request(&peer, request);
                self.pending_requests.insert(id, reply);
            }
            Command::Publish { topic, data } => {
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(IdentTopic::new(topic), data) {
                    debug!(topic, "gossipsub publish error: {e}");
                }
            }
            Command::Disconnect(peer) => {
                let _ = self.swarm.disconnect_peer_id(peer);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<SatchelBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(SatchelBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => match NetworkMessage::decode(&message.data, self.network) {
                Some(message) => self.emit(TransportEvent::Gossip { peer: propagation_source, message }),
                None => debug!(peer = %propagation_source, "failed to decode gossip message"),
            },

            SwarmEvent::Behaviour(SatchelBehaviourEvent::RequestResponse(event)) => {
                self.on_request_response(event)
            }

            SwarmEvent::Behaviour(SatchelBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    debug!(%peer_id, %addr, "mDNS discovered peer");
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                    if self.dial_discovered && !self.swarm.is_connected(&peer_id) {
                        let _ = self.swarm.dial(addr);
                    }
                }
            }

            SwarmEvent::Behaviour(SatchelBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(%peer_id, agent = %info.agent_version, "identify received");
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }

            SwarmEvent::ConnectionEstablished { peer_id, connection_id, num_established, .. } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }
                if num_established.get() == 1 {
                    let count = self.state.peer_count.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(%peer_id, count, "connection established");
                    self.emit(TransportEvent::Connected { peer: peer_id });
                }
            }

            SwarmEvent::OutgoingConnectionError { connection_id, peer_id, error } => {
                debug!(?peer_id, %error, "outgoing connection failed");
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NetworkError::Transport(error.to_string())));
                }
            }

            SwarmEvent::ConnectionClosed { peer_id, num_established, cause, .. } => {
                if num_established == 0 {
                    let _ = self.state.peer_count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                        Some(n.saturating_sub(1))
                    });
                    let reason = cause.map_or_else(|| "closed".to_string(), |c| c.to_string());
                    debug!(%peer_id, %reason, "connection closed");
                    self.emit(TransportEvent::Disconnected { peer: peer_id, reason });
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => info!(%address, "listening on"),

            SwarmEvent::ListenerError { error, .. } => error!(%error, "listener error"),

            _ => {}
        }
    }

    fn on_request_response(&mut self, event: request_response::Event<WalletRequest, WalletResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    // A wallet answers the handshake and nothing else.
                    let response = match request {
                        WalletRequest::Handshake(_) => {
                            WalletResponse::Handshake(VersionMessage::local(self.network))
                        }
                        other => {
                            debug!(%peer, kind = other.kind(), "refusing inbound request");
                            WalletResponse::Error("wallet does not serve chain data".into())
                        }
                    };
                    if self.swarm.behaviour_mut().request_response.send_response(channel, response).is_err() {
                        debug!(%peer, "response channel closed");
                    }
                }
                request_response::Message::Response { request_id, response } => {
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure { peer, request_id, error, .. } => {
                warn!(%peer, %error, "outbound request failed");
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Err(map_outbound_failure(&peer, error)));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, %error, "inbound request failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}

fn map_outbound_failure(peer: &PeerId, error: OutboundFailure) -> NetworkError {
    match error {
        OutboundFailure::Timeout => NetworkError::Timeout,
        OutboundFailure::ConnectionClosed | OutboundFailure::DialFailure => {
            NetworkError::PeerDisconnected(peer.to_string())
        }
        other => NetworkError::Transport(other.to_string()),
    }
}
