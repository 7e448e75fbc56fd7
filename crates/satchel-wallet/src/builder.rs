//! Transaction builder and on-demand signing.
//!
//! 1. Add recipients (address + amount)
//! 2. Build an unsigned transaction (performs coin selection, adds change)
//! 3. Sign every input with a key derived from the seed just for that input

use satchel_core::address::Address;
use satchel_core::constants::DEFAULT_FEE;
use satchel_core::crypto::{sign_transaction_input, verify_transaction_input};
use satchel_core::types::{Transaction, TxInput, TxOutput};

use crate::coin_selection::{CoinSelection, CoinSelector};
use crate::error::WalletError;
use crate::keychain::{KeyChain, KeyOrigin};
use crate::store::WalletUtxo;

#[derive(Debug, Clone)]
pub struct Recipient {
    pub address: Address,
    pub amount: u64,
}

/// An unsigned transaction ready for signing.
#[derive(Debug)]
pub struct UnsignedTransaction {
    /// The transaction with empty signatures.
    pub tx: Transaction,
    pub selection: CoinSelection,
    /// Owning key of each input, in input order.
    pub input_origins: Vec<KeyOrigin>,
    /// Change output address, if the transaction has one.
    pub change_address: Option<Address>,
}

/// Builder for constructing and signing transactions.
///
/// ```ignore
/// let unsigned = TransactionBuilder::new()
///     .add_recipient(address, COIN / 2)
///     .build(&spendable, || keychain.fresh_change_address().map(|(a, _)| a).map_err(Into::into))?;
/// let signed = TransactionBuilder::sign(unsigned, &keychain)?;
/// ```
pub struct TransactionBuilder {
    recipients: Vec<Recipient>,
    fee: u64,
    lock_time: u32,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            recipients: Vec::new(),
            fee: DEFAULT_FEE,
            lock_time: 0,
        }
    }

    pub fn add_recipient(&mut self, address: Address, amount: u64) -> &mut Self {
        self.recipients.push(Recipient { address, amount });
        self
    }

    /// Override the fixed fee (default: [`DEFAULT_FEE`]).
    pub fn set_fee(&mut self, fee: u64) -> &mut Self {
        self.fee = fee;
        self
    }

    pub fn set_lock_time(&mut self, lock_time: u32) -> &mut Self {
        self.lock_time = lock_time;
        self
    }

    /// Select coins and lay out the outputs.
    ///
    /// `change_address` is called only when the selection leaves change, so a
    /// change index is consumed only for transactions that use it.
    pub fn build(
        &self,
        spendable: &[WalletUtxo],
        change_address: impl FnOnce() -> Result<Address, WalletError>,
    ) -> Result<UnsignedTransaction, WalletError> {
        if self.recipients.is_empty() {
            return Err(WalletError::BuildError("no recipients".into()));
        }

        let mut total_send: u64 = 0;
        for r in &self.recipients {
            if r.amount == 0 {
                return Err(WalletError::InvalidAmount("recipient amount is zero".into()));
            }
            total_send = total_send
                .checked_add(r.amount)
                .ok_or_else(|| WalletError::InvalidAmount("total amount overflow".into()))?;
        }

        let selection = CoinSelector::select(spendable, total_send, self.fee)?;

        let inputs = selection
            .selected
            .iter()
            .map(|u| TxInput::unsigned(u.outpoint))
            .collect();
        let input_origins = selection.selected.iter().map(|u| u.origin).collect();

        let mut outputs: Vec<TxOutput> = self
            .recipients
            .iter()
            .map(|r| TxOutput { value: r.amount, script_pubkey: r.address.script_pubkey() })
            .collect();

        let change_address = if selection.change > 0 {
            let addr = change_address()?;
            outputs.push(TxOutput { value: selection.change, script_pubkey: addr.script_pubkey() });
            Some(addr)
        } else {
            None
        };

        let tx = Transaction {
            version: 1,
            inputs,
            outputs,
            lock_time: self.lock_time,
        };

        Ok(UnsignedTransaction { tx, selection, input_origins, change_address })
    }

    /// Sign all inputs. Each key is derived from the seed, used once and dropped.
    pub fn sign(unsigned: UnsignedTransaction, keychain: &KeyChain) -> Result<Transaction, WalletError> {
        let mut tx = unsigned.tx;
        for (i, origin) in unsigned.input_origins.iter().enumerate() {
            let keypair = keychain.signing_key(*origin)?;
            sign_transaction_input(&mut tx, i, &keypair)?;
        }
        for (i, utxo) in unsigned.selection.selected.iter().enumerate() {
            let pkh = utxo
                .script_pubkey
                .p2pkh_hash()
                .ok_or_else(|| WalletError::BuildError(format!("input {i} is not P2PKH")))?;
            verify_transaction_input(&tx, i, &pkh)?;
        }
        Ok(tx)
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
