//! Protocol constants. All monetary values in satoshis (1 coin = 10^8 satoshis).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;

pub const COIN: u64 = 100_000_000;

/// Number of decimal places in a coin amount.
pub const COIN_DECIMALS: usize = 8;

/// Ticker used in friendly amount strings.
pub const TICKER: &str = "BTC";

/// Fixed fee attached to every outbound transaction unless the caller overrides it.
pub const DEFAULT_FEE: u64 = 10_000;

/// Outputs below this value are folded into the fee instead of creating change.
pub const DUST_LIMIT: u64 = 546;

/// Wire protocol version exchanged during the peer handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum number of headers a peer returns for a single request.
pub const MAX_HEADERS_PER_REQUEST: usize = 2_000;

/// Maximum serialized block size accepted from a peer.
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Highest chain height a peer may claim in its handshake.
pub const MAX_PLAUSIBLE_HEIGHT: u64 = u32::MAX as u64;

/// BIP-44 purpose field.
pub const BIP44_PURPOSE: u32 = 44;

/// Target network.
///
/// Controls address version bytes, wire magic, default ports and the
/// default BIP-44 coin type.
///
/// # Examples
///
/// ```
/// use satchel_core::constants::{CoinType, Network};
/// assert_eq!(Network::default(), Network::Testnet);
/// assert_eq!(Network::Mainnet.default_coin_type(), CoinType::Bitcoin);
/// assert_eq!(Network::Regtest.p2pkh_version(), 0x6f);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    Mainnet,
    /// Public test network.
    #[default]
    Testnet,
    /// Isolated regression-test network. Has no discovery; peers are configured by hand.
    Regtest,
}

impl Network {
    /// Lowercase identifier used in directory names and config files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }

    /// Base58Check version byte for pay-to-pubkey-hash addresses.
    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Self::Mainnet => 0x00,
            Self::Testnet | Self::Regtest => 0x6f,
        }
    }

    /// Four-byte network identifier prepended to all P2P messages.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xF9, 0xBE, 0xB4, 0xD9],
            Self::Testnet => [0x0B, 0x11, 0x09, 0x07],
            Self::Regtest => [0xFA, 0xBF, 0xB5, 0xDA],
        }
    }

    /// Default TCP port of a peer on this network.
    pub fn default_p2p_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8333,
            Self::Testnet => 18333,
            Self::Regtest => 18444,
        }
    }

    /// Default TCP port for the wallet's JSON-RPC server.
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8432,
            Self::Testnet => 18432,
            Self::Regtest => 28432,
        }
    }

    /// Whether peers can be found automatically on this network.
    pub fn supports_discovery(&self) -> bool {
        !matches!(self, Self::Regtest)
    }

    /// Coin type used when the configuration does not name one explicitly.
    pub fn default_coin_type(&self) -> CoinType {
        match self {
            Self::Mainnet => CoinType::Bitcoin,
            Self::Testnet | Self::Regtest => CoinType::Testnet,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(AddressError::UnknownNetwork(other.to_string())),
        }
    }
}

/// BIP-44 coin type, the second segment of the derivation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinType {
    /// Production coin (`m/44'/0'`).
    Bitcoin,
    /// Shared by every test network (`m/44'/1'`).
    Testnet,
}

impl CoinType {
    /// Unhardened path index of this coin type.
    pub fn index(&self) -> u32 {
        match self {
            Self::Bitcoin => 0,
            Self::Testnet => 1,
        }
    }
}
