//! # satchel-network — peer transport and chain sync for the satchel wallet.
//!
//! # Modules
//!
//! - [`config`] — discovery or manual peer mode, timeouts and backoff
//! - [`protocol`] — gossip messages, the wallet request/response protocol and its codec
//! - [`behaviour`] — composite libp2p behaviour (gossipsub, kademlia, identify, mdns, request-response)
//! - [`service`] — [`NetworkNode`], the swarm driver behind [`PeerTransport`]
//! - [`transport`] — the transport trait the engine is written against
//! - [`peer`] — per-peer lifecycle and reconnect backoff
//! - [`sync`] — header-first sync planner

pub mod behaviour;
pub mod config;
pub mod peer;
pub mod protocol;
pub mod service;
pub mod sync;
pub mod transport;

pub use config::{NetworkConfig, PeerMode};
pub use libp2p::{Multiaddr, PeerId};
pub use peer::{Backoff, InvalidTransition, PeerConnection, PeerState, Retry};
pub use protocol::{
    BLOCKS_TOPIC, NetworkMessage, REQ_RESP_PROTOCOL, SatchelCodec, TXS_TOPIC, VersionMessage, WalletRequest,
    WalletResponse,
};
pub use service::{NetworkNode, load_or_generate_keypair};
pub use sync::{BlockVerdict, HeadersOutcome, SyncAction, SyncConfig, SyncManager, SyncPhase, SyncProgress};
pub use transport::{PeerTransport, TransportEvent};
