//! Error types for satchel chain primitives.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")] Empty,
    #[error("invalid base58check encoding: {0}")] InvalidEncoding(String),
    #[error("invalid length: {0}")] InvalidLength(usize),
    #[error("version byte {found:#04x} does not belong to {network}")] WrongNetwork { found: u8, network: String },
    #[error("unknown network: {0}")] UnknownNetwork(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")] Empty,
    #[error("invalid amount format: {0}")] InvalidFormat(String),
    #[error("too many decimal places (max {max})")] TooPrecise { max: usize },
    #[error("amount must be greater than zero")] NotPositive,
    #[error("amount overflow")] Overflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret key bytes")] InvalidSecretKey,
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("pubkey hash does not match expected")] PubkeyHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error("no connected peers")] NoPeers,
    #[error("message too large: {size}")] MessageTooLarge { size: usize },
    #[error("locator too large: {size} > {max}")] LocatorTooLarge { size: usize, max: usize },
    #[error("incompatible peer: {0}")] Incompatible(String),
    #[error("transaction rejected: {0}")] Rejected(String),
    #[error("transport: {0}")] Transport(String),
    #[error("channel closed")] ChannelClosed,
    #[error("timeout")] Timeout,
    #[error("invalid network config: {0}")] Config(String),
}

#[derive(Error, Debug)]
pub enum SatchelError {
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Amount(#[from] AmountError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error("serialization: {0}")] Serialization(String),
    #[error("storage: {0}")] Storage(String),
}
