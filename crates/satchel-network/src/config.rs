//! Network configuration for the satchel peer layer.

use libp2p::Multiaddr;
use satchel_core::constants::Network;
use satchel_core::error::NetworkError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How the wallet finds its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PeerMode {
    /// Dial bootstrap peers and accept whatever mDNS/Kademlia turns up.
    Discovery {
        /// Bootstrap peer multiaddresses dialed on startup.
        bootstrap_peers: Vec<String>,
        /// Enable mDNS discovery on the local link.
        enable_mdns: bool,
    },
    /// Talk to exactly one configured peer, redialing with backoff.
    Manual { host: String, port: u16 },
}

/// Configuration for the wallet's network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IP address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on. Zero picks an ephemeral port.
    pub listen_port: u16,
    pub peer_mode: PeerMode,
    /// Gossipsub heartbeat interval.
    pub gossipsub_heartbeat: Duration,
    /// Bound on a single outbound dial, including the noise handshake.
    pub connect_timeout: Duration,
    /// First redial delay after a failed connection.
    pub backoff_base: Duration,
    /// Upper bound on the redial delay.
    pub backoff_cap: Duration,
    /// Consecutive failed dials before the manual peer is given up on.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    /// Bound on a single request-response round trip.
    pub request_timeout: Duration,
    /// Maximum block requests outstanding to one peer.
    pub max_in_flight: usize,
    /// Persisted libp2p identity. A fresh identity is generated per run when unset.
    pub node_key_path: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::testnet()
    }
}

impl NetworkConfig {
    fn base(peer_mode: PeerMode) -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 0,
            peer_mode,
            gossipsub_heartbeat: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
            max_retries: Some(10),
            request_timeout: Duration::from_secs(30),
            max_in_flight: 16,
            node_key_path: None,
        }
    }

    /// Mainnet preset: discovery through bootstrap peers, mDNS off.
    pub fn mainnet() -> Self {
        Self::base(PeerMode::Discovery { bootstrap_peers: Vec::new(), enable_mdns: false })
    }

    /// Testnet preset: discovery with mDNS on.
    pub fn testnet() -> Self {
        Self::base(PeerMode::Discovery { bootstrap_peers: Vec::new(), enable_mdns: true })
    }

    /// Regtest preset: one manual peer on the local regtest port.
    pub fn regtest() -> Self {
        Self::base(PeerMode::Manual {
            host: "127.0.0.1".to_string(),
            port: Network::Regtest.default_p2p_port(),
        })
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// Set a manual peer, replacing any discovery settings.
    pub fn with_manual_peer(mut self, host: impl Into<String>, port: u16) -> Self {
        self.peer_mode = PeerMode::Manual { host: host.into(), port };
        self
    }

    /// Reject configurations the target network cannot honour.
    pub fn validate(&self, network: Network) -> Result<(), NetworkError> {
        match &self.peer_mode {
            PeerMode::Discovery { .. } if !network.supports_discovery() => Err(NetworkError::Config(
                format!("{network} has no peer discovery; configure a manual peer"),
            )),
            PeerMode::Manual { host, .. } if host.trim().is_empty() => {
                Err(NetworkError::Config("manual peer host is empty".into()))
            }
            PeerMode::Manual { port: 0, .. } => {
                Err(NetworkError::Config("manual peer port is zero".into()))
            }
            _ if self.max_in_flight == 0 => {
                Err(NetworkError::Config("max_in_flight must be at least 1".into()))
            }
            _ if self.backoff_base > self.backoff_cap => {
                Err(NetworkError::Config("backoff_base exceeds backoff_cap".into()))
            }
            _ => Ok(()),
        }
    }

    /// Build the libp2p multiaddr string for the configured listen address and port.
    pub fn listen_multiaddr(&self) -> String {
        format!("/ip4/{}/tcp/{}", self.listen_addr, self.listen_port)
    }

    /// Multiaddr of the manual peer, if one is configured.
    ///
    /// IP literals map to `/ip4` or `/ip6`; anything else is resolved through `/dns`.
    pub fn manual_peer(&self) -> Result<Option<Multiaddr>, NetworkError> {
        let PeerMode::Manual { host, port } = &self.peer_mode else {
            return Ok(None);
        };
        let text = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => format!("/ip4/{ip}/tcp/{port}"),
            Ok(IpAddr::V6(ip)) => format!("/ip6/{ip}/tcp/{port}"),
            Err(_) => format!("/dns/{host}/tcp/{port}"),
        };
        text.parse()
            .map(Some)
            .map_err(|e| NetworkError::Config(format!("invalid manual peer {host}:{port}: {e}")))
    }

    /// Bootstrap peers and the mDNS flag, empty and off in manual mode.
    pub fn discovery(&self) -> (&[String], bool) {
        match &self.peer_mode {
            PeerMode::Discovery { bootstrap_peers, enable_mdns } => (bootstrap_peers, *enable_mdns),
            PeerMode::Manual { .. } => (&[], false),
        }
    }
}
