//! secp256k1 signing and the hash functions used by addresses and txids.
//!
//! # Signing scheme
//!
//! Transaction inputs are signed using a **sighash** that commits to:
//! - Transaction version and lock_time
//! - All input outpoints (txid + index)
//! - All outputs (value + script)
//! - The index of the input being signed
//!
//! Signatures and public keys are excluded from the sighash, so inputs can be
//! signed independently and in any order.

use ripemd::Ripemd160;
use secp256k1::{Message, PublicKey, SECP256K1, SecretKey, ecdsa::Signature};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::CryptoError;
use crate::types::Transaction;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 applied twice.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// RIPEMD-160 of SHA-256, the pubkey hash carried by P2PKH scripts and addresses.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(sha256(data)).into()
}

/// A secp256k1 private key used for exactly one signing operation.
///
/// The secret is erased on drop. Callers derive a fresh `KeyPair` for each
/// signature instead of holding one.
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { secret })
    }

    pub fn from_secret_key(secret: SecretKey) -> Self {
        Self { secret }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key(SECP256K1)
    }

    /// Compressed public key (33 bytes).
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key().serialize()
    }

    /// hash160 of the compressed public key.
    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key_bytes())
    }

    /// Sign a 32-byte digest, returning a DER-encoded low-S ECDSA signature.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Vec<u8> {
        let msg = Message::from_digest(*digest);
        SECP256K1.sign_ecdsa(&msg, &self.secret).serialize_der().to_vec()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verify a DER signature over `digest` with a compressed or uncompressed public key.
pub fn verify_digest(public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> Result<(), CryptoError> {
    let pk = PublicKey::from_slice(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_der(signature).map_err(|_| CryptoError::InvalidSignature)?;
    let msg = Message::from_digest(*digest);
    SECP256K1
        .verify_ecdsa(&msg, &sig, &pk)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Compute the signing hash (sighash) for a transaction input.
pub fn signing_hash(tx: &Transaction, input_index: usize) -> Result<[u8; 32], CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let mut data = Vec::new();
    data.extend_from_slice(&tx.version.to_le_bytes());

    data.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for input in &tx.inputs {
        data.extend_from_slice(input.previous_output.txid.as_bytes());
        data.extend_from_slice(&input.previous_output.index.to_le_bytes());
    }

    data.extend_from_slice(&(tx.outputs.len() as u32).to_le_bytes());
    for output in &tx.outputs {
        data.extend_from_slice(&output.value.to_le_bytes());
        data.extend_from_slice(&(output.script_pubkey.0.len() as u32).to_le_bytes());
        data.extend_from_slice(&output.script_pubkey.0);
    }

    data.extend_from_slice(&tx.lock_time.to_le_bytes());
    data.extend_from_slice(&(input_index as u32).to_le_bytes());

    Ok(sha256d(&data))
}

/// Sign a transaction input in place, writing the signature and compressed public key.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    let sighash = signing_hash(tx, input_index)?;
    let signature = keypair.sign_digest(&sighash);
    tx.inputs[input_index].signature = signature;
    tx.inputs[input_index].public_key = keypair.public_key_bytes().to_vec();
    Ok(())
}

/// Verify a transaction input's signature against the pubkey hash of the output it spends.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    expected_pubkey_hash: &[u8; 20],
) -> Result<(), CryptoError> {
    let input = tx.inputs.get(input_index).ok_or(CryptoError::InputIndexOutOfBounds {
        index: input_index,
        len: tx.inputs.len(),
    })?;
    if hash160(&input.public_key) != *expected_pubkey_hash {
        return Err(CryptoError::PubkeyHashMismatch);
    }
    let sighash = signing_hash(tx, input_index)?;
    verify_digest(&input.public_key, &sighash, &input.signature)
}
