//! Pay-to-pubkey-hash addresses.
//!
//! An address is Base58Check over `version || hash160(compressed pubkey)`.
//! The version byte names the network family: `0x00` for mainnet and
//! `0x6f` for testnet and regtest. Parsing always happens against the
//! wallet's configured network, so a testnet address is rejected by a
//! mainnet wallet and vice versa.

use serde::{Serialize, Serializer};
use std::fmt;

use crate::constants::Network;
use crate::error::AddressError;
use crate::types::Script;

const PAYLOAD_LEN: usize = 21;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    pubkey_hash: [u8; 20],
}

impl Address {
    pub fn from_pubkey_hash(pubkey_hash: [u8; 20], network: Network) -> Self {
        Self { network, pubkey_hash }
    }

    pub fn pubkey_hash(&self) -> &[u8; 20] {
        &self.pubkey_hash
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Locking script paying this address.
    pub fn script_pubkey(&self) -> Script {
        Script::p2pkh(&self.pubkey_hash)
    }

    /// Encode this address as a Base58Check string.
    pub fn encode(&self) -> String {
        bs58::encode(self.pubkey_hash)
            .with_check_version(self.network.p2pkh_version())
            .into_string()
    }

    /// Parse an address string that must belong to `network`.
    ///
    /// Testnet and regtest share a version byte, so an address parsed for one
    /// is valid for the other.
    pub fn parse(s: &str, network: Network) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let payload = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| AddressError::InvalidEncoding(e.to_string()))?;
        if payload.len() != PAYLOAD_LEN {
            return Err(AddressError::InvalidLength(payload.len()));
        }
        if payload[0] != network.p2pkh_version() {
            return Err(AddressError::WrongNetwork {
                found: payload[0],
                network: network.to_string(),
            });
        }
        let mut pubkey_hash = [0u8; 20];
        pubkey_hash.copy_from_slice(&payload[1..]);
        Ok(Self { network, pubkey_hash })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}
