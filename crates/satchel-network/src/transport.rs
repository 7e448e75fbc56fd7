//! The seam between the sync engine and the wire.
//!
//! [`crate::NetworkNode`] is the libp2p implementation. The engine only sees
//! this trait, so tests can drive it with an in-process transport.

use crate::protocol::{NetworkMessage, WalletRequest, WalletResponse};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use satchel_core::error::NetworkError;
use tokio::sync::broadcast;

/// Connection-level events a transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First connection to `peer` is up, whoever initiated it.
    Connected { peer: PeerId },
    /// Last connection to `peer` closed.
    Disconnected { peer: PeerId, reason: String },
    /// A gossip announcement relayed by `peer`.
    Gossip { peer: PeerId, message: NetworkMessage },
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// A new receiver for connection and gossip events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Open a connection to `addr` and return the remote identity.
    async fn dial(&self, addr: Multiaddr) -> Result<PeerId, NetworkError>;

    /// Send one request and wait for its response.
    async fn request(&self, peer: PeerId, request: WalletRequest) -> Result<WalletResponse, NetworkError>;

    /// Publish an announcement to every subscribed peer.
    fn broadcast(&self, message: NetworkMessage) -> Result<(), NetworkError>;

    /// Close every connection to `peer`.
    fn disconnect(&self, peer: PeerId);

    fn peer_count(&self) -> usize;

    /// Stop the transport. Outstanding requests fail with [`NetworkError::ChannelClosed`].
    async fn shutdown(&self);
}
