//! BIP-32 hierarchical deterministic key derivation over secp256k1.
//!
//! The master key is `HMAC-SHA512(key = "Bitcoin seed", seed)`: the left half
//! is the secret key and the right half the chain code. Each child step runs
//! HMAC-SHA512 over the chain code, feeding in either the parent's private key
//! (hardened) or its compressed public key (normal). Addresses are enumerated
//! below a BIP-44 account chain, `m/44'/coin'/account'/chain/i`.
//!
//! A child whose tweak is out of range or produces the point at infinity is
//! invalid. This happens with probability below 2^-127. [`derive_addresses`]
//! then moves on to the next index and reports a [`ChildIndexSkipped`] for
//! the gap. The skip is deterministic, so restarts yield the same sequence.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, SECP256K1, Scalar, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::fmt;
use std::str::FromStr;

use satchel_core::address::Address;
use satchel_core::constants::{BIP44_PURPOSE, CoinType, Network};
use satchel_core::crypto::{KeyPair, hash160};

use crate::error::DerivationError;
use crate::mnemonic::Seed;

type HmacSha512 = Hmac<Sha512>;

/// Domain-separation key for the master key HMAC.
const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";

/// First hardened child index.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

const XPRV_MAINNET: [u8; 4] = [0x04, 0x88, 0xAD, 0xE4];
const XPUB_MAINNET: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];
const XPRV_TESTNET: [u8; 4] = [0x04, 0x35, 0x83, 0x94];
const XPUB_TESTNET: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];

/// One step of a derivation path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChildIndex {
    Normal(u32),
    Hardened(u32),
}

impl ChildIndex {
    pub fn normal(index: u32) -> Result<Self, DerivationError> {
        if index >= HARDENED_OFFSET {
            return Err(DerivationError::IndexOutOfRange(index));
        }
        Ok(Self::Normal(index))
    }

    pub fn hardened(index: u32) -> Result<Self, DerivationError> {
        if index >= HARDENED_OFFSET {
            return Err(DerivationError::IndexOutOfRange(index));
        }
        Ok(Self::Hardened(index))
    }

    /// Decode the 32-bit wire form.
    pub fn from_raw(raw: u32) -> Self {
        if raw >= HARDENED_OFFSET {
            Self::Hardened(raw - HARDENED_OFFSET)
        } else {
            Self::Normal(raw)
        }
    }

    /// 32-bit wire form (hardened indices have the top bit set).
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Normal(i) => i,
            Self::Hardened(i) => i | HARDENED_OFFSET,
        }
    }

    pub fn is_hardened(self) -> bool {
        matches!(self, Self::Hardened(_))
    }

    /// Index without the hardened flag.
    pub fn index(self) -> u32 {
        match self {
            Self::Normal(i) | Self::Hardened(i) => i,
        }
    }
}

impl fmt::Display for ChildIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal(i) => write!(f, "{i}"),
            Self::Hardened(i) => write!(f, "{i}'"),
        }
    }
}

/// An ordered sequence of child indices starting at the master key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DerivationPath(Vec<ChildIndex>);

impl DerivationPath {
    pub fn master() -> Self {
        Self(Vec::new())
    }

    /// `m/44'/coin'/account'/chain`
    pub fn bip44_chain(coin_type: CoinType, account: u32, chain: u32) -> Result<Self, DerivationError> {
        Ok(Self(vec![
            ChildIndex::hardened(BIP44_PURPOSE)?,
            ChildIndex::hardened(coin_type.index())?,
            ChildIndex::hardened(account)?,
            ChildIndex::normal(chain)?,
        ]))
    }

    /// A new path with `child` appended.
    pub fn child(&self, child: ChildIndex) -> Self {
        let mut steps = self.0.clone();
        steps.push(child);
        Self(steps)
    }

    pub fn steps(&self) -> &[ChildIndex] {
        &self.0
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for step in &self.0 {
            write!(f, "/{step}")?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = DerivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        if parts.next() != Some("m") {
            return Err(DerivationError::InvalidPath(s.to_string()));
        }
        let mut steps = Vec::new();
        for part in parts {
            let (digits, hardened) = match part.strip_suffix(['\'', 'h', 'H']) {
                Some(d) => (d, true),
                None => (part, false),
            };
            let index: u32 = digits
                .parse()
                .map_err(|_| DerivationError::InvalidPath(s.to_string()))?;
            steps.push(if hardened {
                ChildIndex::hardened(index)?
            } else {
                ChildIndex::normal(index)?
            });
        }
        Ok(Self(steps))
    }
}

#[derive(Clone, Copy)]
enum KeyMaterial {
    Private(SecretKey),
    Public(PublicKey),
}

/// A key plus chain code and its position in the tree.
///
/// Values are immutable; deriving returns a new key.
#[derive(Clone)]
pub struct ExtendedKey {
    key: KeyMaterial,
    chain_code: [u8; 32],
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_index: ChildIndex,
}

impl ExtendedKey {
    /// Derive the master key from a seed.
    pub fn master(seed: &Seed) -> Result<Self, DerivationError> {
        let (il, ir) = hmac_sha512(MASTER_HMAC_KEY, &[&seed.as_bytes()[..]])?;
        let secret = SecretKey::from_slice(&il).map_err(|_| DerivationError::InvalidKey { depth: 0 })?;
        Ok(Self {
            key: KeyMaterial::Private(secret),
            chain_code: ir,
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_index: ChildIndex::Normal(0),
        })
    }

    /// One CKD step. Returns `ChildIndexSkipped` when the index yields an invalid key.
    pub fn derive_child(&self, index: ChildIndex) -> Result<Self, DerivationError> {
        let depth = self.depth.checked_add(1).ok_or(DerivationError::DepthExceeded)?;
        let raw = index.to_raw().to_be_bytes();
        let parent_pub = self.public_key().serialize();

        let (il, ir) = match (&self.key, index) {
            (KeyMaterial::Private(sk), ChildIndex::Hardened(_)) => {
                hmac_sha512(&self.chain_code, &[&[0u8][..], &sk.secret_bytes()[..], &raw[..]])?
            }
            (KeyMaterial::Public(_), ChildIndex::Hardened(_)) => {
                return Err(DerivationError::HardenedFromPublic);
            }
            (_, ChildIndex::Normal(_)) => hmac_sha512(&self.chain_code, &[&parent_pub[..], &raw[..]])?,
        };

        let skipped = || DerivationError::ChildIndexSkipped { index: index.index() };
        let tweak = Scalar::from_be_bytes(il).map_err(|_| skipped())?;
        let key = match self.key {
            KeyMaterial::Private(sk) => KeyMaterial::Private(sk.add_tweak(&tweak).map_err(|_| skipped())?),
            KeyMaterial::Public(pk) => {
                KeyMaterial::Public(pk.add_exp_tweak(SECP256K1, &tweak).map_err(|_| skipped())?)
            }
        };

        Ok(Self {
            key,
            chain_code: ir,
            depth,
            parent_fingerprint: fingerprint(&parent_pub),
            child_index: index,
        })
    }

    /// Walk every step of `path` from this key.
    pub fn derive_path(&self, path: &DerivationPath) -> Result<Self, DerivationError> {
        path.steps()
            .iter()
            .try_fold(self.clone(), |key, step| key.derive_child(*step))
    }

    /// The same position with the private half removed.
    pub fn to_public(&self) -> Self {
        Self {
            key: KeyMaterial::Public(self.public_key()),
            chain_code: self.chain_code,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_index: self.child_index,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self.key {
            KeyMaterial::Private(sk) => sk.public_key(SECP256K1),
            KeyMaterial::Public(pk) => pk,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self.key, KeyMaterial::Private(_))
    }

    /// hash160 of the compressed public key.
    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key().serialize())
    }

    pub fn address(&self, network: Network) -> Address {
        Address::from_pubkey_hash(self.pubkey_hash(), network)
    }

    /// Signing key for a single operation. Fails on a public-only key.
    pub fn keypair(&self) -> Result<KeyPair, DerivationError> {
        match self.key {
            KeyMaterial::Private(sk) => Ok(KeyPair::from_secret_key(sk)),
            KeyMaterial::Public(_) => Err(DerivationError::HardenedFromPublic),
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn child_index(&self) -> ChildIndex {
        self.child_index
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn fingerprint(&self) -> [u8; 4] {
        fingerprint(&self.public_key().serialize())
    }

    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    /// Base58Check `xprv`/`xpub` (mainnet) or `tprv`/`tpub` (test networks).
    pub fn encode(&self, network: Network) -> String {
        let mainnet = network == Network::Mainnet;
        let (version, key_data) = match self.key {
            KeyMaterial::Private(sk) => {
                let mut data = [0u8; 33];
                data[1..].copy_from_slice(&sk.secret_bytes());
                (if mainnet { XPRV_MAINNET } else { XPRV_TESTNET }, data)
            }
            KeyMaterial::Public(pk) => (if mainnet { XPUB_MAINNET } else { XPUB_TESTNET }, pk.serialize()),
        };
        let mut payload = Vec::with_capacity(78);
        payload.extend_from_slice(&version);
        payload.push(self.depth);
        payload.extend_from_slice(&self.parent_fingerprint);
        payload.extend_from_slice(&self.child_index.to_raw().to_be_bytes());
        payload.extend_from_slice(&self.chain_code);
        payload.extend_from_slice(&key_data);
        bs58::encode(payload).with_check().into_string()
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("public_key", &hex::encode(self.public_key().serialize()))
            .field("private", &self.is_private())
            .field("depth", &self.depth)
            .field("child_index", &self.child_index)
            .finish_non_exhaustive()
    }
}

impl Drop for ExtendedKey {
    fn drop(&mut self) {
        if let KeyMaterial::Private(sk) = &mut self.key {
            sk.non_secure_erase();
        }
    }
}

/// `masterKey(seed)`.
pub fn master_key(seed: &Seed) -> Result<ExtendedKey, DerivationError> {
    ExtendedKey::master(seed)
}

/// `deriveChild(parent, index)`.
pub fn derive_child(parent: &ExtendedKey, index: ChildIndex) -> Result<ExtendedKey, DerivationError> {
    parent.derive_child(index)
}

/// Signal that an index was passed over because its key was invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildIndexSkipped {
    pub index: ChildIndex,
}

/// One enumerated address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedAddress {
    /// Child index below the path prefix.
    pub index: u32,
    pub address: Address,
    pub pubkey_hash: [u8; 20],
}

/// Result of [`derive_addresses`]: addresses in index order plus any skipped indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressBatch {
    pub addresses: Vec<DerivedAddress>,
    pub skipped: Vec<ChildIndexSkipped>,
}

/// Enumerate `count` addresses below `path_prefix`, starting at index 0.
///
/// The prefix is walked with the private key. The enumerated children are
/// normal indices derived from the prefix's public key, so a longer `count`
/// always reproduces a shorter one's output as its prefix.
pub fn derive_addresses(
    seed: &Seed,
    path_prefix: &DerivationPath,
    count: usize,
    network: Network,
) -> Result<AddressBatch, DerivationError> {
    let chain = master_key(seed)?.derive_path(path_prefix)?.to_public();
    derive_addresses_from(&chain, 0, count, network)
}

/// Enumerate `count` addresses from a chain-level key, starting at `start`.
pub fn derive_addresses_from(
    chain: &ExtendedKey,
    start: u32,
    count: usize,
    network: Network,
) -> Result<AddressBatch, DerivationError> {
    let mut batch = AddressBatch {
        addresses: Vec::with_capacity(count),
        skipped: Vec::new(),
    };
    let mut index = start;
    while batch.addresses.len() < count {
        let child_index = ChildIndex::normal(index)?;
        match chain.derive_child(child_index) {
            Ok(child) => {
                let pubkey_hash = child.pubkey_hash();
                batch.addresses.push(DerivedAddress {
                    index,
                    address: Address::from_pubkey_hash(pubkey_hash, network),
                    pubkey_hash,
                });
            }
            Err(DerivationError::ChildIndexSkipped { .. }) => {
                tracing::warn!(index, "derived key invalid, skipping child index");
                batch.skipped.push(ChildIndexSkipped { index: child_index });
            }
            Err(e) => return Err(e),
        }
        index = index.checked_add(1).ok_or(DerivationError::IndexOutOfRange(index))?;
    }
    Ok(batch)
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<([u8; 32], [u8; 32]), DerivationError> {
    let mut mac = HmacSha512::new_from_slice(key).map_err(|_| DerivationError::InvalidKey { depth: 0 })?;
    for part in parts {
        mac.update(part);
    }
    let out = mac.finalize().into_bytes();
    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&out[..32]);
    ir.copy_from_slice(&out[32..]);
    Ok((il, ir))
}

fn fingerprint(compressed_pubkey: &[u8; 33]) -> [u8; 4] {
    let h = hash160(compressed_pubkey);
    [h[0], h[1], h[2], h[3]]
}
