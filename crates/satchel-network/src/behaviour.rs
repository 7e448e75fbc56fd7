//! Composite libp2p [`NetworkBehaviour`] for the satchel wallet.
//!
//! Gossipsub carries block/tx announcements, request-response carries the
//! handshake and header/block downloads. Kademlia, Identify and optional mDNS
//! are only useful in discovery mode but are always present so the swarm type
//! is the same in both modes.

use crate::protocol::{MAX_MESSAGE_SIZE, REQ_RESP_PROTOCOL, SatchelCodec};
use libp2p::gossipsub;
use libp2p::identity::Keypair;
use libp2p::kad;
use libp2p::request_response;
use libp2p::swarm::NetworkBehaviour;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::{PeerId, StreamProtocol, identify, mdns};
use satchel_core::error::NetworkError;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Protocol version string used in Identify.
pub const IDENTIFY_PROTOCOL: &str = "/satchel/1.0.0";

/// Kademlia protocol name.
pub const KAD_PROTOCOL: &str = "/satchel/kad/1.0.0";

#[derive(NetworkBehaviour)]
pub struct SatchelBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub request_response: request_response::Behaviour<SatchelCodec>,
}

impl SatchelBehaviour {
    pub fn new(
        keypair: &Keypair,
        heartbeat: Duration,
        request_timeout: Duration,
        enable_mdns: bool,
    ) -> Result<Self, NetworkError> {
        let local_peer_id = PeerId::from(keypair.public());

        let kad_config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
        let kademlia = kad::Behaviour::with_config(
            local_peer_id,
            kad::store::MemoryStore::new(local_peer_id),
            kad_config,
        );

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let mdns = if enable_mdns {
            Some(
                mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                    .map_err(|e| NetworkError::Transport(format!("mDNS error: {e}")))?,
            )
        } else {
            None
        };

        let request_response = request_response::Behaviour::with_codec(
            SatchelCodec,
            [(StreamProtocol::new(REQ_RESP_PROTOCOL), request_response::ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(request_timeout),
        );

        Ok(Self {
            gossipsub: build_gossipsub(keypair, heartbeat)?,
            kademlia,
            identify,
            mdns: mdns.into(),
            request_response,
        })
    }
}

/// Build a gossipsub behaviour with content-addressed message IDs.
///
/// Messages are signed with the node identity and deduplicated by the
/// SHA-256 of their payload.
pub fn build_gossipsub(keypair: &Keypair, heartbeat: Duration) -> Result<gossipsub::Behaviour, NetworkError> {
    let message_id_fn = |message: &gossipsub::Message| {
        gossipsub::MessageId::from(Sha256::digest(&message.data).to_vec())
    };

    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(heartbeat)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(MAX_MESSAGE_SIZE)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|e| NetworkError::Transport(format!("gossipsub config error: {e}")))?;

    gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(keypair.clone()), config)
        .map_err(|e| NetworkError::Transport(format!("gossipsub behaviour error: {e}")))
}
