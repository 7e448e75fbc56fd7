//! Satchel wallet daemon.
//!
//! Unlocks the wallet keystore, connects to the peer network, keeps the
//! wallet in sync and serves JSON-RPC until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use zeroize::Zeroizing;

use satchel_core::constants::Network;
use satchel_network::{NetworkNode, PeerTransport};
use satchel_node_lib::{NodeConfig, WalletEngine, WalletStorage, start_rpc_server};
use satchel_wallet::Keystore;

/// Environment variable read before prompting for the keystore password.
const PASSWORD_ENV: &str = "SATCHEL_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "satchel-node", version, about = "Satchel HD light wallet daemon")]
struct Args {
    /// Configuration file (TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for wallet data
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Wallet to open
    #[arg(long)]
    wallet_id: Option<String>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Talk only to this peer (host:port)
    #[arg(long)]
    peer: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Use the public test network.
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Use a local regression-test network. Requires a reachable manual peer.
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,
}

impl Args {
    fn network(&self) -> Option<Network> {
        if self.regtest {
            Some(Network::Regtest)
        } else if self.testnet {
            Some(Network::Testnet)
        } else {
            None
        }
    }

    /// Load the layered config, then apply command-line overrides.
    fn load_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref(), self.network())
            .context("failed to load configuration")?;

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(id) = &self.wallet_id {
            config.wallet_id = id.clone();
        }
        if let Some(bind) = &self.rpc_bind {
            config.rpc_bind = bind.clone();
        }
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(peer) = &self.peer {
            let (host, port) = parse_host_port(peer)?;
            config.p2p = config.p2p.with_manual_peer(host, port);
        }
        config.p2p.node_key_path = Some(config.node_key_path());
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("peer '{s}' is not host:port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("peer '{s}' has an empty host");
    }
    let port = port
        .parse()
        .with_context(|| format!("peer '{s}' has an invalid port"))?;
    Ok((host.to_string(), port))
}

fn read_password() -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password));
    }
    rpassword::prompt_password("Keystore password: ")
        .map(Zeroizing::new)
        .context("failed to read password")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let mut config = args.load_config()?;

    info!("Satchel wallet daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(network = %config.network, data_dir = %config.data_dir.display(), rpc = %config.rpc_addr(), "configuration loaded");

    std::fs::create_dir_all(config.wallet_dir())
        .with_context(|| format!("failed to create {}", config.wallet_dir().display()))?;

    let keystore_path = config.keystore_path();
    if !keystore_path.exists() {
        bail!(
            "no keystore at {}; create one with `satchel-cli keystore create`",
            keystore_path.display()
        );
    }
    let password = read_password()?;
    let path = keystore_path.clone();
    let (keystore, seed) = tokio::task::spawn_blocking(move || {
        let keystore = Keystore::load(&path, password.as_bytes())?;
        let seed = keystore.seed()?;
        Ok::<_, satchel_wallet::WalletError>((keystore, seed))
    })
    .await
    .context("keystore task panicked")?
    .with_context(|| format!("failed to unlock {}", keystore_path.display()))?;

    if keystore.network() != config.network {
        bail!(
            "keystore belongs to {}, daemon is configured for {}",
            keystore.network(),
            config.network
        );
    }
    if keystore.coin_type() != config.coin_type {
        warn!(configured = ?config.coin_type, keystore = ?keystore.coin_type(), "using the keystore's coin type");
        config.coin_type = keystore.coin_type();
    }
    drop(keystore);

    let storage = Arc::new(WalletStorage::open(config.db_path(), config.network).context("failed to open wallet database")?);
    let node = NetworkNode::start(&config.p2p, config.network)
        .await
        .context("failed to start network")?;
    let transport: Arc<dyn PeerTransport> = Arc::new(node);

    let engine = WalletEngine::start(config.clone(), seed, transport, storage)
        .await
        .context("failed to start wallet engine")?;
    let rpc = start_rpc_server(&config.rpc_addr(), engine.clone())
        .await
        .context("failed to start RPC server")?;
    info!(addr = %config.rpc_addr(), "RPC server listening");
    info!("satchel running (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("shutdown signal received");

    rpc.stop().ok();
    rpc.stopped().await;
    engine.stop().await.context("wallet engine did not stop cleanly")?;
    info!("satchel shutdown complete");
    Ok(())
}

/// Initialize tracing with the given level and output format.
///
/// `RUST_LOG` takes precedence over `level_str`.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(parse_host_port("127.0.0.1:18444").unwrap(), ("127.0.0.1".into(), 18444));
        assert_eq!(parse_host_port("node.example:8333").unwrap(), ("node.example".into(), 8333));
        assert_eq!(parse_host_port("[::1]:18444").unwrap(), ("::1".into(), 18444));
        assert!(parse_host_port("nohost").is_err());
        assert!(parse_host_port(":18444").is_err());
        assert!(parse_host_port("host:notaport").is_err());
    }

    #[test]
    fn command_line_overrides_config() {
        let dir = std::env::temp_dir().join("satchel-args-test");
        let args = Args::parse_from([
            "satchel-node",
            "--regtest",
            "--data-dir",
            dir.to_str().unwrap(),
            "--rpc-port",
            "1234",
            "--peer",
            "10.0.0.2:18444",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.rpc_port, 1234);
        assert_eq!(config.data_dir, dir);
        assert_eq!(
            config.p2p.manual_peer().unwrap().unwrap().to_string(),
            "/ip4/10.0.0.2/tcp/18444"
        );
        assert_eq!(config.p2p.node_key_path, Some(config.wallet_dir().join("node_key")));
    }
}
