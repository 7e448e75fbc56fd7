//! Receive and change chains with a gap-limit lookahead.
//!
//! The key chain caches only public data: the two chain-level public keys
//! (`m/44'/coin'/account'/0` and `.../1`) and the pubkey hashes derived below
//! them. Signing keys are re-derived from the seed for each signature and
//! dropped right after.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use satchel_core::address::Address;
use satchel_core::constants::{CoinType, Network};
use satchel_core::crypto::KeyPair;
use satchel_core::types::{Script, Transaction};

use crate::error::DerivationError;
use crate::hd::{ChildIndex, DerivationPath, ExtendedKey, master_key};
use crate::mnemonic::Seed;

/// Default number of unused addresses watched past the last used one.
pub const DEFAULT_LOOKAHEAD: u32 = 20;

/// BIP-44 chain within an account.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub enum Chain {
    /// Receive addresses (`.../0/i`).
    External,
    /// Change addresses (`.../1/i`).
    Internal,
}

impl Chain {
    pub fn index(self) -> u32 {
        match self {
            Self::External => 0,
            Self::Internal => 1,
        }
    }

    fn slot(self) -> usize {
        self.index() as usize
    }
}

/// Position of a wallet key: chain plus child index.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct KeyOrigin {
    pub chain: Chain,
    pub index: u32,
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain.index(), self.index)
    }
}

/// Persisted progress of both chains.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct KeyChainCursors {
    /// Next index handed out per chain (external, internal).
    pub next: [u32; 2],
    /// Highest index seen paid on-chain per chain.
    pub highest_used: [Option<u32>; 2],
}

/// Anything that can tell whether a script pays the wallet.
pub trait ScriptOwner {
    fn owner_of(&self, script: &Script) -> Option<KeyOrigin>;
}

pub struct KeyChain {
    seed: Seed,
    network: Network,
    coin_type: CoinType,
    account: u32,
    lookahead: u32,
    /// Public chain-level keys, indexed by [`Chain::slot`].
    chains: [ExtendedKey; 2],
    /// Next raw child index to derive per chain.
    derived_upto: [u32; 2],
    watched: HashMap<[u8; 20], KeyOrigin>,
    cursors: KeyChainCursors,
}

impl KeyChain {
    /// Build the chain keys for account 0 and derive the initial lookahead window.
    pub fn new(
        seed: Seed,
        network: Network,
        coin_type: CoinType,
        lookahead: u32,
    ) -> Result<Self, DerivationError> {
        let account = 0;
        let master = master_key(&seed)?;
        let external = master
            .derive_path(&DerivationPath::bip44_chain(coin_type, account, Chain::External.index())?)?
            .to_public();
        let internal = master
            .derive_path(&DerivationPath::bip44_chain(coin_type, account, Chain::Internal.index())?)?
            .to_public();
        drop(master);

        let mut keychain = Self {
            seed,
            network,
            coin_type,
            account,
            lookahead: lookahead.max(1),
            chains: [external, internal],
            derived_upto: [0, 0],
            watched: HashMap::new(),
            cursors: KeyChainCursors::default(),
        };
        keychain.fill_window(Chain::External)?;
        keychain.fill_window(Chain::Internal)?;
        Ok(keychain)
    }

    /// Restore persisted cursors and re-derive the matching window.
    pub fn restore(&mut self, cursors: KeyChainCursors) -> Result<(), DerivationError> {
        self.cursors = cursors;
        self.fill_window(Chain::External)?;
        self.fill_window(Chain::Internal)
    }

    pub fn cursors(&self) -> KeyChainCursors {
        self.cursors
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn coin_type(&self) -> CoinType {
        self.coin_type
    }

    /// Number of pubkey hashes currently watched across both chains.
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    pub fn owns(&self, pubkey_hash: &[u8; 20]) -> Option<KeyOrigin> {
        self.watched.get(pubkey_hash).copied()
    }

    /// Hand out the next unused receive address.
    pub fn next_receive_address(&mut self) -> Result<(Address, KeyOrigin), DerivationError> {
        self.next_address(Chain::External)
    }

    /// Hand out a never-before-used change address.
    pub fn fresh_change_address(&mut self) -> Result<(Address, KeyOrigin), DerivationError> {
        self.next_address(Chain::Internal)
    }

    /// Address of a known origin, derived from public data.
    pub fn address_of(&self, origin: KeyOrigin) -> Result<Address, DerivationError> {
        let child = self.chains[origin.chain.slot()].derive_child(ChildIndex::normal(origin.index)?)?;
        Ok(child.address(self.network))
    }

    /// Derive the private key for `origin` from the seed. Nothing is cached.
    pub fn signing_key(&self, origin: KeyOrigin) -> Result<KeyPair, DerivationError> {
        let path = DerivationPath::bip44_chain(self.coin_type, self.account, origin.chain.index())?
            .child(ChildIndex::normal(origin.index)?);
        master_key(&self.seed)?.derive_path(&path)?.keypair()
    }

    /// Record that `origin` was paid on-chain and widen its window if needed.
    ///
    /// Returns true when new addresses were added to the watched set.
    pub fn mark_used(&mut self, origin: KeyOrigin) -> Result<bool, DerivationError> {
        let slot = origin.chain.slot();
        let highest = &mut self.cursors.highest_used[slot];
        if highest.is_none_or(|h| origin.index > h) {
            *highest = Some(origin.index);
        }
        let next = &mut self.cursors.next[slot];
        if *next <= origin.index {
            *next = origin.index.saturating_add(1);
        }
        let before = self.watched.len();
        self.fill_window(origin.chain)?;
        Ok(self.watched.len() > before)
    }

    /// Mark every wallet output in `txs` as used, repeating until the window
    /// stops growing so an output past the initial lookahead is still found.
    pub fn observe(&mut self, txs: &[Transaction]) -> Result<Vec<KeyOrigin>, DerivationError> {
        let mut used = Vec::new();
        loop {
            let mut grew = false;
            for tx in txs {
                for output in &tx.outputs {
                    if let Some(origin) = self.owner_of(&output.script_pubkey) {
                        if !used.contains(&origin) {
                            used.push(origin);
                        }
                        grew |= self.mark_used(origin)?;
                    }
                }
            }
            if !grew {
                return Ok(used);
            }
        }
    }

    fn next_address(&mut self, chain: Chain) -> Result<(Address, KeyOrigin), DerivationError> {
        let slot = chain.slot();
        let mut index = self.cursors.next[slot];
        loop {
            match self.chains[slot].derive_child(ChildIndex::normal(index)?) {
                Ok(child) => {
                    self.cursors.next[slot] = index.saturating_add(1);
                    self.fill_window(chain)?;
                    return Ok((child.address(self.network), KeyOrigin { chain, index }));
                }
                Err(DerivationError::ChildIndexSkipped { .. }) => {
                    tracing::warn!(chain = chain.index(), index, "skipping invalid child index");
                    index = index.checked_add(1).ok_or(DerivationError::IndexOutOfRange(index))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Derive until the watched window covers `max(next, highest_used + 1) + lookahead`.
    fn fill_window(&mut self, chain: Chain) -> Result<(), DerivationError> {
        let slot = chain.slot();
        let used_end = self.cursors.highest_used[slot].map_or(0, |h| h.saturating_add(1));
        let target = self.cursors.next[slot].max(used_end).saturating_add(self.lookahead);
        while self.derived_upto[slot] < target {
            let index = self.derived_upto[slot];
            match self.chains[slot].derive_child(ChildIndex::normal(index)?) {
                Ok(child) => {
                    let origin = KeyOrigin { chain, index };
                    if let Some(existing) = self.watched.insert(child.pubkey_hash(), origin) {
                        tracing::error!(%existing, %origin, "pubkey hash derived at two paths");
                        self.watched.insert(child.pubkey_hash(), existing);
                    }
                }
                Err(DerivationError::ChildIndexSkipped { .. }) => {
                    tracing::warn!(chain = chain.index(), index, "skipping invalid child index");
                }
                Err(e) => return Err(e),
            }
            self.derived_upto[slot] = index.saturating_add(1);
        }
        Ok(())
    }
}

impl ScriptOwner for KeyChain {
    fn owner_of(&self, script: &Script) -> Option<KeyOrigin> {
        script.p2pkh_hash().and_then(|h| self.owns(&h))
    }
}

impl ScriptOwner for HashMap<[u8; 20], KeyOrigin> {
    fn owner_of(&self, script: &Script) -> Option<KeyOrigin> {
        script.p2pkh_hash().and_then(|h| self.get(&h).copied())
    }
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyChain")
            .field("network", &self.network)
            .field("coin_type", &self.coin_type)
            .field("cursors", &self.cursors)
            .field("watched", &self.watched.len())
            .finish_non_exhaustive()
    }
}
