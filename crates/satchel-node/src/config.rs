//! Wallet daemon configuration.
//!
//! [`NodeConfig`] starts from per-network defaults, then layers an optional
//! TOML/JSON file and `SATCHEL_*` environment variables on top through the
//! `config` crate. Nested keys use a double underscore, e.g.
//! `SATCHEL_P2P__LISTEN_PORT=18555`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use satchel_core::constants::{CoinType, DEFAULT_FEE, Network};
use satchel_network::NetworkConfig;
use satchel_wallet::keychain::DEFAULT_LOOKAHEAD;

use crate::error::EngineError;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SATCHEL";

/// Configuration for one wallet daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: Network,
    /// BIP-44 coin type. Defaults from the network.
    pub coin_type: CoinType,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Key of the wallet record in storage.
    pub wallet_id: String,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    pub rpc_port: u16,
    /// Fixed fee attached to every send, in base units.
    pub fee: u64,
    /// Let sends spend outputs that are not yet in a block.
    pub spend_unconfirmed: bool,
    /// How long `send` waits for local acceptance.
    pub send_timeout: Duration,
    /// Blocks after which a send never seen on the network gives its inputs back.
    pub reservation_expiry_blocks: u64,
    /// How long `stop` waits for in-flight work.
    pub shutdown_grace: Duration,
    /// Unused addresses watched past the last used one.
    pub lookahead: u32,
    /// Peer layer settings.
    pub p2p: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_network(Network::default())
    }
}

/// Just enough of a config source to pick the right defaults.
#[derive(Deserialize)]
struct NetworkProbe {
    network: Option<Network>,
}

impl NodeConfig {
    pub fn for_network(network: Network) -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("satchel");

        Self {
            network,
            coin_type: network.default_coin_type(),
            data_dir,
            wallet_id: "default".to_string(),
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: network.default_rpc_port(),
            fee: DEFAULT_FEE,
            spend_unconfirmed: false,
            send_timeout: Duration::from_secs(30),
            reservation_expiry_blocks: 6,
            shutdown_grace: Duration::from_secs(30),
            lookahead: DEFAULT_LOOKAHEAD,
            p2p: NetworkConfig::for_network(network),
        }
    }

    /// Load from defaults, an optional file and the environment.
    ///
    /// An explicit `network` wins over the file and the environment.
    pub fn load(path: Option<&Path>, network: Option<Network>) -> Result<Self, EngineError> {
        let probe: NetworkProbe = Self::layered(None, path, network)?
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let network = network.or(probe.network).unwrap_or_default();

        let defaults = Self::for_network(network);
        let config: Self = Self::layered(Some(&defaults), path, Some(network))?
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn layered(
        defaults: Option<&Self>,
        path: Option<&Path>,
        network: Option<Network>,
    ) -> Result<config::Config, EngineError> {
        let mut builder = config::Config::builder();
        if let Some(defaults) = defaults {
            builder = builder.add_source(
                config::Config::try_from(defaults).map_err(|e| EngineError::Config(e.to_string()))?,
            );
        }
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        if let Some(network) = network {
            builder = builder
                .set_override("network", network.name())
                .map_err(|e| EngineError::Config(e.to_string()))?;
        }
        builder.build().map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.p2p.validate(self.network)?;
        if self.wallet_id.trim().is_empty() {
            return Err(EngineError::Config("wallet_id is empty".into()));
        }
        if self.lookahead == 0 {
            return Err(EngineError::Config("lookahead must be at least 1".into()));
        }
        if self.send_timeout.is_zero() {
            return Err(EngineError::Config("send_timeout must be positive".into()));
        }
        if self.reservation_expiry_blocks == 0 {
            return Err(EngineError::Config("reservation_expiry_blocks must be at least 1".into()));
        }
        Ok(())
    }

    /// Per-network wallet directory, `<data_dir>/wallet-data-<network>`.
    pub fn wallet_dir(&self) -> PathBuf {
        self.data_dir.join(format!("wallet-data-{}", self.network.name()))
    }

    /// RocksDB directory.
    pub fn db_path(&self) -> PathBuf {
        self.wallet_dir().join("db")
    }

    /// Encrypted keystore file of this wallet.
    pub fn keystore_path(&self) -> PathBuf {
        self.wallet_dir().join(format!("{}.keystore", self.wallet_id))
    }

    /// Persisted libp2p identity, unless the p2p config names another file.
    pub fn node_key_path(&self) -> PathBuf {
        self.p2p
            .node_key_path
            .clone()
            .unwrap_or_else(|| self.wallet_dir().join("node_key"))
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_network::PeerMode;
    use std::io::Write;

    #[test]
    fn defaults_follow_network() {
        let main = NodeConfig::for_network(Network::Mainnet);
        assert_eq!(main.rpc_port, 8432);
        assert_eq!(main.coin_type, CoinType::Bitcoin);

        let test = NodeConfig::for_network(Network::Testnet);
        assert_eq!(test.rpc_port, 18432);
        assert_eq!(test.coin_type, CoinType::Testnet);

        let reg = NodeConfig::for_network(Network::Regtest);
        assert_eq!(reg.rpc_port, 28432);
        assert!(matches!(reg.p2p.peer_mode, PeerMode::Manual { port: 18444, .. }));
    }

    #[test]
    fn default_policy_values() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.fee, 10_000);
        assert!(!cfg.spend_unconfirmed);
        assert_eq!(cfg.send_timeout, Duration::from_secs(30));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
        assert_eq!(cfg.lookahead, 20);
        assert_eq!(cfg.reservation_expiry_blocks, 6);
        assert!(cfg.data_dir.ends_with("satchel"));
    }

    #[test]
    fn wallet_paths_are_per_network() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/satchel-test"),
            wallet_id: "alice".into(),
            ..NodeConfig::for_network(Network::Regtest)
        };
        assert_eq!(cfg.wallet_dir(), PathBuf::from("/tmp/satchel-test/wallet-data-regtest"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/satchel-test/wallet-data-regtest/db"));
        assert_eq!(
            cfg.keystore_path(),
            PathBuf::from("/tmp/satchel-test/wallet-data-regtest/alice.keystore")
        );
        assert_eq!(cfg.rpc_addr(), "127.0.0.1:28432");
    }

    #[test]
    fn file_overrides_defaults_for_its_network() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
network = "regtest"
fee = 2500
spend_unconfirmed = true
reservation_expiry_blocks = 12

[p2p.peer_mode]
mode = "manual"
host = "10.0.0.7"
port = 19000
"#
        )
        .unwrap();

        let cfg = NodeConfig::load(Some(file.path()), None).unwrap();
        assert_eq!(cfg.network, Network::Regtest);
        assert_eq!(cfg.rpc_port, 28432);
        assert_eq!(cfg.coin_type, CoinType::Testnet);
        assert_eq!(cfg.fee, 2500);
        assert!(cfg.spend_unconfirmed);
        assert_eq!(cfg.reservation_expiry_blocks, 12);
        assert_eq!(
            cfg.p2p.peer_mode,
            PeerMode::Manual { host: "10.0.0.7".into(), port: 19000 }
        );
    }

    #[test]
    fn explicit_network_wins_over_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "network = \"testnet\"\nlookahead = 5").unwrap();
        let cfg = NodeConfig::load(Some(file.path()), Some(Network::Mainnet)).unwrap();
        assert_eq!(cfg.network, Network::Mainnet);
        assert_eq!(cfg.rpc_port, 8432);
        assert_eq!(cfg.lookahead, 5);
    }

    #[test]
    fn discovery_on_regtest_is_rejected() {
        let cfg = NodeConfig {
            p2p: NetworkConfig::testnet(),
            ..NodeConfig::for_network(Network::Regtest)
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Network(_))));
    }

    #[test]
    fn zero_lookahead_is_rejected() {
        let cfg = NodeConfig { lookahead: 0, ..NodeConfig::default() };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn zero_reservation_expiry_is_rejected() {
        let cfg = NodeConfig { reservation_expiry_blocks: 0, ..NodeConfig::default() };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }
}
