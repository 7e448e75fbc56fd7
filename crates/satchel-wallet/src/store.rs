//! Wallet state: UTXO set, balance, history and pending-spent marks.
//!
//! [`WalletState`] is a plain value that applies transactions and blocks.
//! [`WalletStore`] wraps it in a single `RwLock` so a whole block is applied
//! under one write guard and readers never observe half of it.
//!
//! The running `confirmed + unconfirmed` balance always equals the sum of the
//! values in the UTXO set. Pending-spent UTXOs stay in the set (and in the
//! balance) until the spending transaction is observed on the network; they
//! are only excluded from selection. A reservation whose transaction is never
//! seen can be expired after a number of blocks.
//!
//! A transaction or block whose owned outputs would push the balance past
//! `u64::MAX` is rejected before anything changes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use satchel_core::amount::format_signed;
use satchel_core::types::{Block, Hash256, OutPoint, Script, Transaction};

use crate::error::StoreError;
use crate::keychain::{KeyOrigin, ScriptOwner};

/// An output owned by one of the wallet's addresses.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct WalletUtxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Script,
    /// Key that can spend it.
    pub origin: KeyOrigin,
    /// Block height, or `None` while unconfirmed.
    pub height: Option<u64>,
}

impl WalletUtxo {
    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }
}

/// One observed transaction that touched the wallet.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct HistoryEntry {
    pub txid: Hash256,
    /// Net effect on the wallet in base units: received minus sent.
    pub delta: i64,
    pub received: u64,
    pub sent: u64,
    pub height: Option<u64>,
    /// Block timestamp when confirmed.
    pub timestamp: Option<u64>,
}

impl HistoryEntry {
    /// `TXID: <hex> | Value: <signed friendly amount>`
    pub fn display_line(&self) -> String {
        format!("TXID: {} | Value: {}", self.txid, format_signed(self.delta))
    }
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u64,
}

/// Balance figures in base units.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
    /// Portion of `confirmed + unconfirmed` locked by in-flight sends.
    pub pending_spent: u64,
}

impl Balance {
    /// Sum of every tracked UTXO.
    pub fn total(&self) -> u64 {
        self.confirmed.saturating_add(self.unconfirmed)
    }
}

/// How a transaction changed the wallet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// Neither pays nor spends anything of ours.
    Irrelevant,
    /// First sighting.
    New,
    /// Seen unconfirmed earlier and now included in a block.
    Confirmed,
    /// Already recorded at this confirmation level.
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxEffect {
    pub txid: Hash256,
    pub status: TxStatus,
    pub received: u64,
    pub sent: u64,
}

impl TxEffect {
    /// True for a first sighting that moved coins in or out.
    pub fn is_new(&self) -> bool {
        self.status == TxStatus::New
    }
}

/// An in-flight send holding some UTXOs.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Reservation {
    /// Signed transaction, once there is one.
    pub tx: Option<Transaction>,
    /// Wallet's next block height when the inputs were reserved.
    pub reserved_at: u64,
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct WalletState {
    utxos: BTreeMap<OutPoint, WalletUtxo>,
    /// Reserved outpoint → id of the send that reserved it.
    pending_spent: BTreeMap<OutPoint, Hash256>,
    reservations: BTreeMap<Hash256, Reservation>,
    history: Vec<HistoryEntry>,
    history_index: BTreeMap<Hash256, usize>,
    confirmed: u64,
    unconfirmed: u64,
    tip: Option<ChainTip>,
}

impl WalletState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<ChainTip> {
        self.tip
    }

    /// Height the next applied block must have.
    pub fn next_height(&self) -> u64 {
        self.tip.map_or(0, |t| t.height.saturating_add(1))
    }

    pub fn utxos(&self) -> impl Iterator<Item = &WalletUtxo> {
        self.utxos.values()
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Option<&WalletUtxo> {
        self.utxos.get(outpoint)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn is_pending(&self, outpoint: &OutPoint) -> bool {
        self.pending_spent.contains_key(outpoint)
    }

    pub fn balance(&self) -> Balance {
        let pending_spent = self
            .pending_spent
            .keys()
            .filter_map(|op| self.utxos.get(op))
            .fold(0u64, |acc, u| acc.saturating_add(u.value));
        Balance {
            confirmed: self.confirmed,
            unconfirmed: self.unconfirmed,
            pending_spent,
        }
    }

    /// UTXOs a new send may select, ordered by outpoint.
    pub fn spendable_utxos(&self, include_unconfirmed: bool) -> Vec<WalletUtxo> {
        self.utxos
            .values()
            .filter(|u| include_unconfirmed || u.is_confirmed())
            .filter(|u| !self.pending_spent.contains_key(&u.outpoint))
            .cloned()
            .collect()
    }

    pub fn spendable_balance(&self, include_unconfirmed: bool) -> u64 {
        self.utxos
            .values()
            .filter(|u| include_unconfirmed || u.is_confirmed())
            .filter(|u| !self.pending_spent.contains_key(&u.outpoint))
            .fold(0u64, |acc, u| acc.saturating_add(u.value))
    }

    /// Apply one transaction. `height` is `None` for a mempool sighting.
    ///
    /// Inputs that spend tracked UTXOs remove them; outputs paying `owner` add
    /// new ones. A transaction already recorded is not counted twice. A later
    /// confirmation of an unconfirmed one only moves its outputs between the
    /// unconfirmed and confirmed figures.
    ///
    /// Fails with [`StoreError::ValueOverflow`], leaving the state untouched,
    /// when the owned outputs would overflow the balance.
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        height: Option<u64>,
        timestamp: Option<u64>,
        owner: &dyn ScriptOwner,
    ) -> Result<TxEffect, StoreError> {
        self.check_credit(std::slice::from_ref(tx), owner)?;
        Ok(self.apply_checked(tx, height, timestamp, owner))
    }

    fn apply_checked(
        &mut self,
        tx: &Transaction,
        height: Option<u64>,
        timestamp: Option<u64>,
        owner: &dyn ScriptOwner,
    ) -> TxEffect {
        let txid = tx.txid();

        if let Some(&idx) = self.history_index.get(&txid) {
            let entry = &self.history[idx];
            let (received, sent) = (entry.received, entry.sent);
            if entry.height.is_some() || height.is_none() {
                return TxEffect { txid, status: TxStatus::Duplicate, received, sent };
            }
            self.confirm_outputs(txid, tx.outputs.len(), height);
            let entry = &mut self.history[idx];
            entry.height = height;
            entry.timestamp = timestamp;
            return TxEffect { txid, status: TxStatus::Confirmed, received, sent };
        }

        let mut sent = 0u64;
        for input in &tx.inputs {
            let op = input.previous_output;
            if let Some(spent) = self.utxos.remove(&op) {
                self.debit(&spent);
                if let Some(reservation) = self.pending_spent.remove(&op) {
                    self.forget_if_settled(&reservation);
                }
                sent = sent.saturating_add(spent.value);
            }
        }

        let mut received = 0u64;
        for (vout, output) in tx.outputs.iter().enumerate() {
            let Some(origin) = owner.owner_of(&output.script_pubkey) else {
                continue;
            };
            let outpoint = OutPoint::new(txid, vout as u32);
            if self.utxos.contains_key(&outpoint) {
                continue;
            }
            let utxo = WalletUtxo {
                outpoint,
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                origin,
                height,
            };
            self.credit(&utxo);
            self.utxos.insert(outpoint, utxo);
            received = received.saturating_add(output.value);
        }

        if sent == 0 && received == 0 {
            return TxEffect { txid, status: TxStatus::Irrelevant, received, sent };
        }

        let delta = (received as i128 - sent as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        self.history_index.insert(txid, self.history.len());
        self.history.push(HistoryEntry { txid, delta, received, sent, height, timestamp });
        TxEffect { txid, status: TxStatus::New, received, sent }
    }

    /// Apply a block at `height` on top of the current tip.
    ///
    /// The block must extend the tip exactly: the next height and, once a tip
    /// exists, the tip's hash as predecessor. The first block sets the tip at
    /// whatever height it carries. Returns the relevant effects in block order.
    /// A block that would overflow the balance is rejected as a whole.
    pub fn apply_block(
        &mut self,
        block: &Block,
        height: u64,
        owner: &dyn ScriptOwner,
    ) -> Result<Vec<TxEffect>, StoreError> {
        if let Some(tip) = self.tip {
            // Nothing follows the top height.
            let expected = tip
                .height
                .checked_add(1)
                .ok_or(StoreError::NonLinkingBlock { expected: tip.height, got: height })?;
            if height != expected {
                return Err(StoreError::NonLinkingBlock { expected, got: height });
            }
            if !block.header.links_to(&tip.hash) {
                return Err(StoreError::WrongParent { height, tip: tip.hash });
            }
        }

        self.check_credit(&block.transactions, owner)?;

        let timestamp = Some(block.header.timestamp);
        let effects = block
            .transactions
            .iter()
            .map(|tx| self.apply_checked(tx, Some(height), timestamp, owner))
            .filter(|e| e.status != TxStatus::Irrelevant)
            .collect();
        self.tip = Some(ChainTip { hash: block.hash(), height });
        Ok(effects)
    }

    /// Mark `outpoints` pending-spent by the send `id`. All or nothing.
    pub fn reserve(&mut self, outpoints: &[OutPoint], id: Hash256) -> Result<(), StoreError> {
        for op in outpoints {
            if !self.utxos.contains_key(op) || self.pending_spent.contains_key(op) {
                return Err(StoreError::UtxoUnavailable(*op));
            }
        }
        for op in outpoints {
            self.pending_spent.insert(*op, id);
        }
        let reserved_at = self.next_height();
        self.reservations
            .entry(id)
            .or_insert(Reservation { tx: None, reserved_at });
        Ok(())
    }

    /// Attach the signed transaction to the send `id`. False if it holds nothing.
    pub fn record_transaction(&mut self, id: &Hash256, tx: Transaction) -> bool {
        match self.reservations.get_mut(id) {
            Some(reservation) => {
                reservation.tx = Some(tx);
                true
            }
            None => false,
        }
    }

    pub fn reservation(&self, id: &Hash256) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    /// Signed transactions of sends whose inputs are still reserved.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.reservations.values().filter_map(|r| r.tx.clone()).collect()
    }

    /// Drop every reservation held by the send `id`. Returns how many were released.
    pub fn release(&mut self, id: &Hash256) -> usize {
        let before = self.pending_spent.len();
        self.pending_spent.retain(|_, owner| owner != id);
        self.reservations.remove(id);
        before - self.pending_spent.len()
    }

    /// Release sends that have gone `after_blocks` blocks without their
    /// transaction being seen. Returns the ids released.
    pub fn expire_reservations(&mut self, after_blocks: u64) -> Vec<Hash256> {
        let now = self.next_height();
        let expired: Vec<Hash256> = self
            .reservations
            .iter()
            .filter(|(_, r)| now.saturating_sub(r.reserved_at) >= after_blocks)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.release(id);
        }
        expired
    }

    /// Verify that the balance equals the UTXO total.
    pub fn check_invariant(&self) -> Result<(), StoreError> {
        let utxo_total: u128 = self.utxos.values().map(|u| u128::from(u.value)).sum();
        let balance = u128::from(self.confirmed) + u128::from(self.unconfirmed);
        if utxo_total != balance || balance > u128::from(u64::MAX) {
            return Err(StoreError::InvariantViolated { balance, utxo_total });
        }
        Ok(())
    }

    /// Fail if crediting every owned output of the unseen transactions in
    /// `txs` would overflow the balance.
    fn check_credit(&self, txs: &[Transaction], owner: &dyn ScriptOwner) -> Result<(), StoreError> {
        let mut total = self.confirmed.saturating_add(self.unconfirmed);
        for tx in txs {
            let txid = tx.txid();
            if self.history_index.contains_key(&txid) {
                continue;
            }
            for output in tx.outputs.iter().filter(|o| owner.owner_of(&o.script_pubkey).is_some()) {
                total = total
                    .checked_add(output.value)
                    .ok_or(StoreError::ValueOverflow { txid })?;
            }
        }
        Ok(())
    }

    /// Drop the record of `id` once none of its inputs are still reserved.
    fn forget_if_settled(&mut self, id: &Hash256) {
        if !self.pending_spent.values().any(|owner| owner == id) {
            self.reservations.remove(id);
        }
    }

    fn confirm_outputs(&mut self, txid: Hash256, outputs: usize, height: Option<u64>) {
        for vout in 0..outputs {
            let op = OutPoint::new(txid, vout as u32);
            if let Some(utxo) = self.utxos.get_mut(&op) {
                if utxo.height.is_none() {
                    utxo.height = height;
                    self.unconfirmed = self.unconfirmed.saturating_sub(utxo.value);
                    self.confirmed = self.confirmed.saturating_add(utxo.value);
                }
            }
        }
    }

    fn credit(&mut self, utxo: &WalletUtxo) {
        let figure = if utxo.is_confirmed() { &mut self.confirmed } else { &mut self.unconfirmed };
        *figure = figure.saturating_add(utxo.value);
    }

    fn debit(&mut self, utxo: &WalletUtxo) {
        let figure = if utxo.is_confirmed() { &mut self.confirmed } else { &mut self.unconfirmed };
        *figure = figure.saturating_sub(utxo.value);
    }
}

/// Shared handle over [`WalletState`].
#[derive(Debug, Default)]
pub struct WalletStore {
    state: RwLock<WalletState>,
}

impl WalletStore {
    pub fn new(state: WalletState) -> Self {
        Self { state: RwLock::new(state) }
    }

    /// Run `f` against a consistent view.
    pub fn read<R>(&self, f: impl FnOnce(&WalletState) -> R) -> R {
        f(&self.state.read())
    }

    /// Run `f` under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut WalletState) -> R) -> R {
        let mut guard = self.state.write();
        let result = f(&mut guard);
        debug_assert!(guard.check_invariant().is_ok());
        result
    }

    pub fn snapshot(&self) -> WalletState {
        self.state.read().clone()
    }

    pub fn balance(&self) -> Balance {
        self.state.read().balance()
    }

    pub fn replace(&self, state: WalletState) {
        *self.state.write() = state;
    }
}
