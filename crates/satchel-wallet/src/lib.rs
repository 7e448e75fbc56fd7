//! # satchel-wallet — HD keys, wallet state and transaction building.
//!
//! # Modules
//!
//! - [`error`] — `MnemonicError`, `DerivationError`, `StoreError`, `WalletError`
//! - [`mnemonic`] — BIP-39 phrase generation/validation and PBKDF2 seed derivation
//! - [`hd`] — BIP-32 extended keys, derivation paths and address enumeration
//! - [`keychain`] — receive/change chains with gap-limit lookahead
//! - [`store`] — UTXO set, balance, history and pending-spent marks
//! - [`coin_selection`] — largest-first UTXO selection
//! - [`builder`] — transaction construction and on-demand signing
//! - [`encryption`] / [`keystore`] — password-protected mnemonic at rest

pub mod builder;
pub mod coin_selection;
pub mod encryption;
pub mod error;
pub mod hd;
pub mod keychain;
pub mod keystore;
pub mod mnemonic;
pub mod store;

pub use builder::{TransactionBuilder, UnsignedTransaction};
pub use coin_selection::{CoinSelection, CoinSelector};
pub use error::{DerivationError, MnemonicError, StoreError, WalletError};
pub use hd::{AddressBatch, ChildIndex, ChildIndexSkipped, DerivationPath, DerivedAddress, ExtendedKey};
pub use keychain::{Chain, KeyChain, KeyChainCursors, KeyOrigin, ScriptOwner};
pub use keystore::Keystore;
pub use mnemonic::{Mnemonic, Seed};
pub use store::{
    Balance, ChainTip, HistoryEntry, Reservation, TxEffect, TxStatus, WalletState, WalletStore, WalletUtxo,
};
