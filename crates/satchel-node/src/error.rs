//! Engine and send error types.

use satchel_core::error::NetworkError;
use satchel_wallet::{DerivationError, WalletError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("storage: {0}")]
    Storage(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("engine is not running")]
    Stopped,
}

/// Failure of [`crate::WalletEngine::send`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("invalid address: {0}")]
    AddressInvalid(String),

    #[error("invalid amount: {0}")]
    AmountInvalid(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// No local acceptance within the bound. The transaction may still propagate.
    #[error("no acceptance within {0:?}; the transaction may still propagate")]
    Timeout(Duration),

    #[error("submission failed: {0}")]
    Submission(NetworkError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SendError {
    /// Stable code string reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AddressInvalid(_) => "ADDRESS_INVALID",
            Self::AmountInvalid(_) => "AMOUNT_INVALID",
            Self::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            Self::Timeout(_) => "TIMEOUT",
            Self::Submission(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<WalletError> for SendError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::InsufficientFunds { .. } | WalletError::NoUtxos => {
                Self::InsufficientFunds(e.to_string())
            }
            WalletError::InvalidAmount(msg) => Self::AmountInvalid(msg),
            WalletError::Address(e) => Self::AddressInvalid(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
