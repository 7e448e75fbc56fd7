//! Outbound payments.
//!
//! 1. Validate the request (address, amount) without touching any state.
//! 2. Under the key-chain lock and the store write lock: select coins, lay
//!    out outputs with a fresh change address and reserve the inputs.
//! 3. Sign with keys derived per input.
//! 4. Submit to one ready peer and wait a bounded time for acceptance.
//!
//! Reservations are released on a definite failure. They are kept on success
//! and on timeout, together with the signed transaction, until the spend is
//! seen on the network or the engine expires them after
//! `reservation_expiry_blocks` blocks. The submission runs on its own task, so
//! a caller timing out does not cancel it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use satchel_core::address::Address;
use satchel_core::amount::Amount;
use satchel_core::constants::Network;
use satchel_core::error::NetworkError;
use satchel_core::types::{Hash256, OutPoint, Transaction};
use satchel_network::{NetworkMessage, PeerId, PeerTransport, WalletRequest, WalletResponse};
use satchel_wallet::{KeyChain, TransactionBuilder, UnsignedTransaction, WalletStore};

use crate::engine::PeerDirectory;
use crate::error::SendError;

/// A validated send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub address: Address,
    pub amount: Amount,
}

impl SendRequest {
    /// Validate caller input. Checks run in a fixed order so the reported
    /// code is stable: empty address, empty amount, amount, address.
    pub fn parse(address: &str, amount: &str, network: Network) -> Result<Self, SendError> {
        if address.trim().is_empty() {
            return Err(SendError::AddressInvalid("address is empty".into()));
        }
        if amount.trim().is_empty() {
            return Err(SendError::AmountInvalid("amount is empty".into()));
        }
        let amount = Amount::parse_coins(amount).map_err(|e| SendError::AmountInvalid(e.to_string()))?;
        let address = Address::parse(address, network).map_err(|e| SendError::AddressInvalid(e.to_string()))?;
        Ok(Self { address, amount })
    }
}

/// Result of a send accepted by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransaction {
    pub txid: Hash256,
    pub amount: Amount,
    pub fee: u64,
    /// Peer that acknowledged the transaction.
    pub peer: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPolicy {
    pub network: Network,
    pub fee: u64,
    pub spend_unconfirmed: bool,
    pub timeout: Duration,
}

pub(crate) struct Sender {
    policy: SendPolicy,
    keychain: Arc<Mutex<KeyChain>>,
    store: Arc<WalletStore>,
    transport: Arc<dyn PeerTransport>,
    peers: Arc<PeerDirectory>,
}

impl Sender {
    pub(crate) fn new(
        policy: SendPolicy,
        keychain: Arc<Mutex<KeyChain>>,
        store: Arc<WalletStore>,
        transport: Arc<dyn PeerTransport>,
        peers: Arc<PeerDirectory>,
    ) -> Self {
        Self { policy, keychain, store, transport, peers }
    }

    pub(crate) async fn send(&self, address: &str, amount: &str) -> Result<SubmittedTransaction, SendError> {
        let request = SendRequest::parse(address, amount, self.policy.network)?;
        let (unsigned, reservation) = self.reserve(&request)?;
        let fee = unsigned.selection.fee;

        let tx = {
            let keychain = self.keychain.lock();
            TransactionBuilder::sign(unsigned, &keychain)
        };
        let tx = match tx {
            Ok(tx) => tx,
            Err(e) => {
                self.release(&reservation);
                return Err(SendError::Internal(e.to_string()));
            }
        };

        self.store.update(|state| state.record_transaction(&reservation, tx.clone()));

        let Some(peer) = self.peers.best_ready() else {
            self.release(&reservation);
            return Err(SendError::Submission(NetworkError::NoPeers));
        };

        let txid = tx.txid();
        info!(%txid, %peer, amount = %request.amount, fee, "submitting transaction");
        let submission = tokio::spawn(submit(
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            peer,
            tx,
            reservation,
            self.policy.timeout,
        ));

        match tokio::time::timeout(self.policy.timeout, submission).await {
            Ok(Ok(Ok(()))) => Ok(SubmittedTransaction { txid, amount: request.amount, fee, peer }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join)) => {
                self.release(&reservation);
                Err(SendError::Internal(format!("submission task failed: {join}")))
            }
            Err(_) => {
                warn!(%txid, timeout = ?self.policy.timeout, "no acceptance before timeout; inputs stay reserved");
                Err(SendError::Timeout(self.policy.timeout))
            }
        }
    }

    /// Select, lay out and reserve in one step so concurrent sends never pick
    /// the same outputs.
    fn reserve(&self, request: &SendRequest) -> Result<(UnsignedTransaction, Hash256), SendError> {
        let mut keychain = self.keychain.lock();
        self.store.update(|state| {
            let spendable = state.spendable_utxos(self.policy.spend_unconfirmed);
            let have = state.spendable_balance(self.policy.spend_unconfirmed);
            if have < request.amount.to_sat() {
                return Err(SendError::InsufficientFunds(format!(
                    "spendable {} is less than {}",
                    Amount::from_sat(have),
                    request.amount
                )));
            }

            let mut builder = TransactionBuilder::new();
            builder
                .add_recipient(request.address.clone(), request.amount.to_sat())
                .set_fee(self.policy.fee);
            let unsigned = builder.build(&spendable, || Ok(keychain.fresh_change_address()?.0))?;

            let reservation = unsigned.tx.txid();
            let outpoints: Vec<OutPoint> = unsigned.selection.selected.iter().map(|u| u.outpoint).collect();
            state
                .reserve(&outpoints, reservation)
                .map_err(|e| SendError::Internal(e.to_string()))?;
            debug!(%reservation, inputs = outpoints.len(), "inputs reserved");
            Ok((unsigned, reservation))
        })
    }

    fn release(&self, reservation: &Hash256) {
        let released = self.store.update(|state| state.release(reservation));
        debug!(%reservation, released, "reservation released");
    }
}

/// Ask `peer` to accept `tx`, then relay it over gossip.
async fn submit(
    transport: Arc<dyn PeerTransport>,
    store: Arc<WalletStore>,
    peer: PeerId,
    tx: Transaction,
    reservation: Hash256,
    timeout: Duration,
) -> Result<(), SendError> {
    let txid = tx.txid();
    let response = transport.request(peer, WalletRequest::SubmitTransaction(tx.clone())).await;
    let result = match response {
        Ok(WalletResponse::TxAccepted(accepted)) if accepted == txid => Ok(()),
        Ok(WalletResponse::TxAccepted(other)) => Err(SendError::Submission(NetworkError::Rejected(
            format!("peer acknowledged {other} instead of {txid}"),
        ))),
        Ok(WalletResponse::TxRejected { reason, .. }) if reason.to_ascii_lowercase().contains("insufficient") => {
            Err(SendError::InsufficientFunds(reason))
        }
        Ok(WalletResponse::TxRejected { reason, .. }) | Ok(WalletResponse::Error(reason)) => {
            Err(SendError::Submission(NetworkError::Rejected(reason)))
        }
        Ok(_) => Err(SendError::Submission(NetworkError::Rejected(
            "unexpected response to transaction submission".into(),
        ))),
        Err(NetworkError::Timeout) => Err(SendError::Timeout(timeout)),
        Err(e) => Err(SendError::Submission(e)),
    };

    match &result {
        Ok(()) => {
            info!(%txid, %peer, "transaction accepted");
            if let Err(e) = transport.broadcast(NetworkMessage::NewTransaction(tx)) {
                debug!(%txid, "gossip relay failed: {e}");
            }
        }
        Err(SendError::Timeout(_)) => {
            warn!(%txid, %peer, "transaction submission timed out; inputs stay reserved");
        }
        Err(e) => {
            let released = store.update(|state| state.release(&reservation));
            warn!(%txid, %peer, code = e.code(), released, "transaction not accepted: {e}");
        }
    }
    result
}
