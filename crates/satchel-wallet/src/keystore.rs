//! Encrypted keystore file holding the wallet mnemonic.
//!
//! # File format
//! ```text
//! header_len (4 bytes LE) || header_json || sealed_payload
//! ```
//! The header is plain JSON carrying the magic string and format version.
//! The payload is JSON (mnemonic, passphrase, network, coin type) sealed by
//! [`encryption`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

use satchel_core::constants::{CoinType, Network};

use crate::encryption;
use crate::error::WalletError;
use crate::mnemonic::{Mnemonic, Seed};

/// Magic string identifying a satchel keystore.
pub const KEYSTORE_MAGIC: &str = "SATK";

/// Current keystore format version.
pub const KEYSTORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct KeystoreHeader {
    magic: String,
    version: u32,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeystorePayload {
    mnemonic: String,
    passphrase: String,
    #[zeroize(skip)]
    network: Network,
    #[zeroize(skip)]
    coin_type: CoinType,
}

/// Decrypted keystore contents.
pub struct Keystore {
    mnemonic: Mnemonic,
    passphrase: zeroize::Zeroizing<String>,
    network: Network,
    coin_type: CoinType,
}

impl Keystore {
    pub fn new(mnemonic: Mnemonic, passphrase: &str, network: Network, coin_type: CoinType) -> Self {
        Self {
            mnemonic,
            passphrase: zeroize::Zeroizing::new(passphrase.to_string()),
            network,
            coin_type,
        }
    }

    pub fn mnemonic(&self) -> &Mnemonic {
        &self.mnemonic
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn coin_type(&self) -> CoinType {
        self.coin_type
    }

    /// Derive the wallet seed. Runs the BIP-39 KDF, so it blocks.
    pub fn seed(&self) -> Result<Seed, WalletError> {
        Ok(self.mnemonic.to_seed(&self.passphrase)?)
    }

    /// Seal and write the keystore to `path`.
    pub fn save(&self, path: &Path, password: &[u8]) -> Result<(), WalletError> {
        let header = KeystoreHeader {
            magic: KEYSTORE_MAGIC.to_string(),
            version: KEYSTORE_VERSION,
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| WalletError::Serialization(e.to_string()))?;

        let payload = KeystorePayload {
            mnemonic: self.mnemonic.phrase().to_string(),
            passphrase: (*self.passphrase).clone(),
            network: self.network,
            coin_type: self.coin_type,
        };
        let payload_json = zeroize::Zeroizing::new(
            serde_json::to_vec(&payload).map_err(|e| WalletError::Serialization(e.to_string()))?,
        );
        let sealed = encryption::encrypt(&payload_json, password)?;

        let header_len = header_json.len() as u32;
        let mut file_data = Vec::with_capacity(4 + header_json.len() + sealed.len());
        file_data.extend_from_slice(&header_len.to_le_bytes());
        file_data.extend_from_slice(&header_json);
        file_data.extend_from_slice(&sealed);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| WalletError::IoError(e.to_string()))?;
        }
        std::fs::write(path, &file_data).map_err(|e| WalletError::IoError(e.to_string()))
    }

    /// Read and open a keystore. Runs argon2, so async callers use a blocking thread.
    pub fn load(path: &Path, password: &[u8]) -> Result<Self, WalletError> {
        let file_data = std::fs::read(path).map_err(|e| WalletError::IoError(e.to_string()))?;

        let (len_bytes, rest) = file_data
            .split_first_chunk::<4>()
            .ok_or_else(|| WalletError::CorruptedFile("file too short".into()))?;
        let header_len = u32::from_le_bytes(*len_bytes) as usize;
        if rest.len() < header_len {
            return Err(WalletError::CorruptedFile("header truncated".into()));
        }
        let (header_json, sealed) = rest.split_at(header_len);

        let header: KeystoreHeader = serde_json::from_slice(header_json)
            .map_err(|e| WalletError::CorruptedFile(format!("invalid header: {e}")))?;
        if header.magic != KEYSTORE_MAGIC {
            return Err(WalletError::CorruptedFile("invalid magic".into()));
        }
        if header.version != KEYSTORE_VERSION {
            return Err(WalletError::CorruptedFile(format!(
                "unsupported version: {}",
                header.version
            )));
        }

        let payload_json = encryption::decrypt(sealed, password)?;
        let payload: KeystorePayload = serde_json::from_slice(&payload_json)
            .map_err(|e| WalletError::CorruptedFile(format!("invalid payload: {e}")))?;

        Ok(Self {
            mnemonic: Mnemonic::parse(&payload.mnemonic)?,
            passphrase: zeroize::Zeroizing::new(payload.passphrase.clone()),
            network: payload.network,
            coin_type: payload.coin_type,
        })
    }
}

impl fmt::Debug for Keystore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystore")
            .field("network", &self.network)
            .field("coin_type", &self.coin_type)
            .finish_non_exhaustive()
    }
}
