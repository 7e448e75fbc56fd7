//! BIP-39 mnemonic phrases and seed derivation.
//!
//! New wallets get 128 bits of OS entropy, which encodes to 12 English words.
//! Restores accept any standard BIP-39 length. The seed is PBKDF2-HMAC-SHA512
//! over the normalized phrase, salted with `"mnemonic" || passphrase`, 2048
//! rounds, 64 bytes. It is slow on purpose, so callers inside an async
//! runtime run it on a blocking thread.

use bip39::Language;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::MnemonicError;

/// Entropy drawn for a new phrase (128 bits).
pub const ENTROPY_BYTES: usize = 16;

/// Word count of a freshly generated phrase.
pub const WORD_COUNT: usize = 12;

/// Length of a derived seed.
pub const SEED_LEN: usize = 64;

/// A 64-byte BIP-39 seed.
///
/// Secret material is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: [u8; SEED_LEN],
}

impl Seed {
    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Self { bytes }
    }

    /// Get the raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed").field("bytes", &"[REDACTED]").finish()
    }
}

/// A validated, normalized mnemonic phrase.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct Mnemonic {
    phrase: String,
}

impl Mnemonic {
    /// Validate and normalize a phrase.
    pub fn parse(phrase: &str) -> Result<Self, MnemonicError> {
        let normalized = normalize(phrase);
        bip39::Mnemonic::parse_in_normalized(Language::English, &normalized)
            .map_err(|e| MnemonicError::InvalidMnemonic(e.to_string()))?;
        Ok(Self { phrase: normalized })
    }

    /// The normalized phrase. Handle with care.
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn word_count(&self) -> usize {
        self.phrase.split(' ').count()
    }

    /// Run the BIP-39 KDF. Blocks for the PBKDF2 rounds.
    pub fn to_seed(&self, passphrase: &str) -> Result<Seed, MnemonicError> {
        let m = bip39::Mnemonic::parse_in_normalized(Language::English, &self.phrase)
            .map_err(|e| MnemonicError::InvalidMnemonic(e.to_string()))?;
        Ok(Seed::from_bytes(m.to_seed_normalized(passphrase)))
    }
}

impl fmt::Debug for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mnemonic")
            .field("words", &self.word_count())
            .finish_non_exhaustive()
    }
}

/// Generate a new 12-word phrase from 128 bits of OS entropy.
pub fn generate_mnemonic() -> Result<Mnemonic, MnemonicError> {
    let mut entropy = [0u8; ENTROPY_BYTES];
    rand::rngs::OsRng
        .try_fill_bytes(&mut entropy)
        .map_err(|e| MnemonicError::EntropySource(e.to_string()))?;
    let result = mnemonic_from_entropy(&entropy);
    entropy.zeroize();
    result
}

/// Encode raw entropy as a phrase. Entropy must be 16 to 32 bytes in steps of 4.
pub fn mnemonic_from_entropy(entropy: &[u8]) -> Result<Mnemonic, MnemonicError> {
    let m = bip39::Mnemonic::from_entropy_in(Language::English, entropy)
        .map_err(|e| MnemonicError::InvalidMnemonic(e.to_string()))?;
    Ok(Mnemonic { phrase: m.to_string() })
}

/// Check word membership, word count and checksum.
pub fn validate_mnemonic(phrase: &str) -> Result<(), MnemonicError> {
    Mnemonic::parse(phrase).map(|_| ())
}

/// Validate `phrase`, then derive its 64-byte seed. Deterministic in both inputs.
pub fn derive_seed(phrase: &str, passphrase: &str) -> Result<Seed, MnemonicError> {
    Mnemonic::parse(phrase)?.to_seed(passphrase)
}

/// Collapse whitespace and lowercase.
fn normalize(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
