//! Wallet error types.

use satchel_core::error::{AddressError, CryptoError};
use satchel_core::types::{Hash256, OutPoint};
use thiserror::Error;

/// Failures of the mnemonic/seed module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MnemonicError {
    /// The OS random source could not supply entropy.
    #[error("entropy source unavailable: {0}")]
    EntropySource(String),

    /// Unknown word, bad checksum, or unsupported word count.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
}

/// Failures of BIP-32 derivation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    /// The seed or an intermediate step produced an invalid secp256k1 key.
    #[error("invalid key at depth {depth}")]
    InvalidKey { depth: u8 },

    /// Child index skipped because it yields an invalid key; the caller should use the next one.
    #[error("child index {index} skipped: derived key is invalid")]
    ChildIndexSkipped { index: u32 },

    #[error("hardened derivation requires a private key")]
    HardenedFromPublic,

    #[error("child index out of range: {0}")]
    IndexOutOfRange(u32),

    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("maximum depth exceeded")]
    DepthExceeded,
}

/// Rejections from the wallet state store. None of them leave a partial update behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// UTXO is unknown to the wallet or already reserved by another spend.
    #[error("UTXO unavailable: {0}")]
    UtxoUnavailable(OutPoint),

    /// Block does not extend the wallet's tip.
    #[error("block does not link: expected height {expected}, got {got}")]
    NonLinkingBlock { expected: u64, got: u64 },

    /// Block header names a different predecessor than the wallet's tip.
    #[error("block at height {height} does not extend tip {tip}")]
    WrongParent { height: u64, tip: Hash256 },

    /// Owned outputs of the transaction would push the balance past `u64::MAX`.
    #[error("transaction {txid} overflows the wallet balance")]
    ValueOverflow { txid: Hash256 },

    #[error("balance {balance} does not match UTXO total {utxo_total}")]
    InvariantViolated { balance: u128, utxo_total: u128 },
}

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },

    #[error("no UTXOs available")]
    NoUtxos,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("encryption: {0}")]
    Encryption(String),

    #[error("decryption: {0}")]
    Decryption(String),

    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("build error: {0}")]
    BuildError(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Mnemonic(#[from] MnemonicError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
