//! satchel-cli — command-line tools for the satchel wallet.
//!
//! Offline commands work on mnemonics and the encrypted keystore directly.
//! Everything else talks to a running `satchel-node` over JSON-RPC.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use jsonrpsee::core::ClientError;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use satchel_core::constants::Network;
use satchel_node_lib::NodeConfig;
use satchel_node_lib::rpc::{BalanceJson, HistoryJson, SendResultJson, SyncProgressJson};
use satchel_wallet::hd::derive_addresses;
use satchel_wallet::mnemonic::{generate_mnemonic, validate_mnemonic};
use satchel_wallet::{Chain, DerivationPath, KeyChain, Keystore, Mnemonic};

#[derive(Parser)]
#[command(name = "satchel-cli", version, about = "Satchel wallet command-line tools")]
struct Cli {
    /// Network: mainnet, testnet or regtest
    #[arg(short, long, global = true, default_value = "mainnet")]
    network: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mnemonic phrase tools.
    Mnemonic {
        #[command(subcommand)]
        action: MnemonicAction,
    },
    /// List addresses of the wallet in a keystore.
    Addresses(AddressesArgs),
    /// Encrypted keystore management.
    Keystore {
        #[command(subcommand)]
        action: KeystoreAction,
    },
    /// Wallet balance.
    Balance(RpcArgs),
    /// Transaction history.
    History(RpcArgs),
    /// Sync progress of the daemon.
    Sync(RpcArgs),
    /// Pay an amount to an address.
    Send(SendArgs),
    /// Next receive address.
    Newaddress(RpcArgs),
}

#[derive(Subcommand)]
enum MnemonicAction {
    /// Generate a new 12-word phrase.
    New,
    /// Validate a phrase's words and checksum.
    Check {
        /// The phrase. Prompted for when omitted.
        phrase: Option<String>,
    },
}

#[derive(Subcommand)]
enum KeystoreAction {
    /// Create a keystore from a new or restored phrase.
    Create(KeystoreCreateArgs),
    /// Print the first receive address of a keystore.
    ShowAddress(KeystoreArgs),
}

#[derive(Args)]
struct KeystoreArgs {
    /// Keystore file (default: <data-dir>/wallet-data-<network>/<wallet-id>.keystore)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Root data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Wallet id.
    #[arg(long, default_value = "default")]
    wallet_id: String,
}

#[derive(Args)]
struct KeystoreCreateArgs {
    #[command(flatten)]
    keystore: KeystoreArgs,

    /// Restore from an existing phrase instead of generating one.
    #[arg(long)]
    restore: bool,

    /// Prompt for an optional BIP-39 passphrase.
    #[arg(long)]
    with_passphrase: bool,
}

#[derive(Args)]
struct AddressesArgs {
    #[command(flatten)]
    keystore: KeystoreArgs,

    /// How many addresses to list.
    #[arg(short, long, default_value_t = 10)]
    count: usize,

    /// List the change chain instead of the receive chain.
    #[arg(long)]
    change: bool,
}

#[derive(Args)]
struct RpcArgs {
    /// RPC endpoint URL (default: http://127.0.0.1:<network rpc port>)
    #[arg(short, long)]
    rpc_url: Option<String>,
}

#[derive(Args)]
struct SendArgs {
    /// Recipient address.
    address: String,

    /// Amount in coins, e.g. 0.5
    amount: String,

    #[command(flatten)]
    rpc: RpcArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let network: Network = cli
        .network
        .parse()
        .with_context(|| format!("invalid network '{}'", cli.network))?;

    match cli.command {
        Commands::Mnemonic { action } => match action {
            MnemonicAction::New => mnemonic_new(),
            MnemonicAction::Check { phrase } => mnemonic_check(phrase),
        },
        Commands::Addresses(args) => addresses(network, args).await,
        Commands::Keystore { action } => match action {
            KeystoreAction::Create(args) => keystore_create(network, args).await,
            KeystoreAction::ShowAddress(args) => keystore_show_address(network, args).await,
        },
        Commands::Balance(args) => balance(network, args).await,
        Commands::History(args) => history(network, args).await,
        Commands::Sync(args) => sync(network, args).await,
        Commands::Send(args) => send(network, args).await,
        Commands::Newaddress(args) => new_address(network, args).await,
    }
}

fn mnemonic_new() -> Result<()> {
    let mnemonic = generate_mnemonic().context("failed to generate mnemonic")?;
    println!("{}", mnemonic.phrase());
    Ok(())
}

fn mnemonic_check(phrase: Option<String>) -> Result<()> {
    let phrase = match phrase {
        Some(p) => Zeroizing::new(p),
        None => prompt_password("Mnemonic phrase")?,
    };
    match validate_mnemonic(&phrase) {
        Ok(()) => {
            println!("valid");
            Ok(())
        }
        Err(e) => bail!("invalid mnemonic: {e}"),
    }
}

async fn keystore_create(network: Network, args: KeystoreCreateArgs) -> Result<()> {
    let path = resolve_keystore_path(network, &args.keystore);
    if path.exists() {
        bail!("keystore already exists: {}", path.display());
    }

    let (mnemonic, generated) = if args.restore {
        let phrase = prompt_password("Mnemonic phrase")?;
        (Mnemonic::parse(&phrase).context("invalid mnemonic")?, false)
    } else {
        (generate_mnemonic().context("failed to generate mnemonic")?, true)
    };
    let passphrase = if args.with_passphrase {
        prompt_password("BIP-39 passphrase")?
    } else {
        Zeroizing::new(String::new())
    };

    let password = prompt_password("Keystore password")?;
    let confirm = prompt_password("Confirm password")?;
    if password != confirm {
        bail!("passwords do not match");
    }

    let coin_type = network.default_coin_type();
    let keystore = Keystore::new(mnemonic, &passphrase, network, coin_type);
    let save_path = path.clone();
    let keystore = tokio::task::spawn_blocking(move || {
        keystore.save(&save_path, password.as_bytes()).map(|()| keystore)
    })
    .await
    .context("keystore task panicked")?
    .context("failed to save keystore")?;

    if generated {
        println!("Recovery phrase (write it down, it will not be shown again):");
        println!("  {}", keystore.mnemonic().phrase());
    }
    println!("Network: {network}");
    println!("Keystore saved to {}", path.display());
    Ok(())
}

async fn keystore_show_address(network: Network, args: KeystoreArgs) -> Result<()> {
    let keystore = unlock(network, &args).await?;
    let seed = keystore.seed().context("failed to derive seed")?;
    let mut keychain = KeyChain::new(seed, keystore.network(), keystore.coin_type(), 1)
        .context("failed to derive keys")?;
    let (address, _) = keychain.next_receive_address().context("failed to derive address")?;
    println!("{}", address.encode());
    Ok(())
}

async fn addresses(network: Network, args: AddressesArgs) -> Result<()> {
    let keystore = unlock(network, &args.keystore).await?;
    let seed = keystore.seed().context("failed to derive seed")?;
    let chain = if args.change { Chain::Internal } else { Chain::External };
    let path = DerivationPath::bip44_chain(keystore.coin_type(), 0, chain.index())?;
    let batch = derive_addresses(&seed, &path, args.count, keystore.network())
        .context("failed to derive addresses")?;
    for derived in &batch.addresses {
        println!("{path}/{}  {}", derived.index, derived.address.encode());
    }
    for skipped in &batch.skipped {
        eprintln!("skipped invalid child {}", skipped.index.index());
    }
    Ok(())
}

async fn balance(network: Network, args: RpcArgs) -> Result<()> {
    let b: BalanceJson = call(&client(network, &args)?, "getbalance", rpc_params![]).await?;
    println!("Balance:       {}", b.balance);
    println!("Confirmed:     {}", b.confirmed);
    println!("Unconfirmed:   {}", b.unconfirmed);
    println!("Pending spent: {}", b.pending_spent);
    Ok(())
}

async fn history(network: Network, args: RpcArgs) -> Result<()> {
    let h: HistoryJson = call(&client(network, &args)?, "listtransactions", rpc_params![]).await?;
    if h.lines.is_empty() {
        println!("no transactions");
    }
    for line in &h.lines {
        println!("{line}");
    }
    Ok(())
}

async fn sync(network: Network, args: RpcArgs) -> Result<()> {
    let p: SyncProgressJson = call(&client(network, &args)?, "getsyncprogress", rpc_params![]).await?;
    println!("State:            {}", p.state);
    println!("Peers:            {}", p.peers);
    match p.tip_height {
        Some(h) => println!("Tip height:       {h}"),
        None => println!("Tip height:       none"),
    }
    println!("Blocks remaining: {}", p.blocks_remaining);
    Ok(())
}

async fn send(network: Network, args: SendArgs) -> Result<()> {
    let params = rpc_params![args.address, args.amount];
    let r: SendResultJson = call(&client(network, &args.rpc)?, "send", params).await?;
    println!("Sent {}", r.amount);
    println!("TxID: {}", r.txid);
    Ok(())
}

async fn new_address(network: Network, args: RpcArgs) -> Result<()> {
    let address: String = call(&client(network, &args)?, "getnewaddress", rpc_params![]).await?;
    println!("{address}");
    Ok(())
}

fn client(network: Network, args: &RpcArgs) -> Result<HttpClient> {
    let url = args
        .rpc_url
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", network.default_rpc_port()));
    HttpClientBuilder::default()
        .build(&url)
        .with_context(|| format!("invalid RPC endpoint {url}"))
}

/// Call `method`, surfacing the wallet's error code string on failure.
async fn call<R: DeserializeOwned>(
    client: &HttpClient,
    method: &str,
    params: jsonrpsee::core::params::ArrayParams,
) -> Result<R> {
    match client.request(method, params).await {
        Ok(r) => Ok(r),
        Err(ClientError::Call(e)) => {
            let code = e
                .data()
                .and_then(|d| serde_json::from_str::<String>(d.get()).ok())
                .unwrap_or_else(|| e.code().to_string());
            bail!("{code}: {}", e.message())
        }
        Err(e) => Err(e).with_context(|| format!("RPC {method} failed")),
    }
}

async fn unlock(network: Network, args: &KeystoreArgs) -> Result<Keystore> {
    let path = resolve_keystore_path(network, args);
    let password = prompt_password("Keystore password")?;
    let load_path = path.clone();
    tokio::task::spawn_blocking(move || Keystore::load(&load_path, password.as_bytes()))
        .await
        .context("keystore task panicked")?
        .with_context(|| format!("failed to unlock {} (check password)", path.display()))
}

fn resolve_keystore_path(network: Network, args: &KeystoreArgs) -> PathBuf {
    if let Some(file) = &args.file {
        return file.clone();
    }
    let mut config = NodeConfig::for_network(network);
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    config.wallet_id = args.wallet_id.clone();
    config.keystore_path()
}

/// Prompt without echo.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    rpassword::prompt_password(format!("{prompt}: "))
        .map(Zeroizing::new)
        .context("failed to read input")
}
