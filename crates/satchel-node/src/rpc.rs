//! JSON-RPC server for the wallet daemon.
//!
//! Uses jsonrpsee 0.24. Send failures carry their stable code string in the
//! error object's `data` field, next to a numeric code in the server-error range.

use std::sync::Arc;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use satchel_core::amount::Amount;
use satchel_network::SyncProgress;
use satchel_wallet::{Balance, HistoryEntry};

use crate::engine::WalletEngine;
use crate::error::{EngineError, SendError};

pub const ADDRESS_INVALID_CODE: i32 = -32001;
pub const AMOUNT_INVALID_CODE: i32 = -32002;
pub const INSUFFICIENT_FUNDS_CODE: i32 = -32003;
pub const TIMEOUT_CODE: i32 = -32004;
pub const INTERNAL_ERROR_CODE: i32 = -32603;

/// Wallet balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceJson {
    /// Total as a friendly string, e.g. `"1.50 BTC"`.
    pub balance: String,
    pub confirmed: u64,
    pub unconfirmed: u64,
    /// Locked by sends that are not confirmed yet.
    pub pending_spent: u64,
}

impl From<Balance> for BalanceJson {
    fn from(b: Balance) -> Self {
        Self {
            balance: Amount::from_sat(b.total()).to_friendly_string(),
            confirmed: b.confirmed,
            unconfirmed: b.unconfirmed,
            pending_spent: b.pending_spent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntryJson {
    pub txid: String,
    /// Net effect in base units.
    pub delta: i64,
    pub received: u64,
    pub sent: u64,
    pub height: Option<u64>,
    /// RFC 3339 block time, once confirmed.
    pub time: Option<String>,
}

impl From<&HistoryEntry> for HistoryEntryJson {
    fn from(e: &HistoryEntry) -> Self {
        let time = e
            .timestamp
            .and_then(|ts| i64::try_from(ts).ok())
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|t| t.to_rfc3339());
        Self {
            txid: e.txid.to_string(),
            delta: e.delta,
            received: e.received,
            sent: e.sent,
            height: e.height,
            time,
        }
    }
}

/// Transaction history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryJson {
    /// `TXID: <hex> | Value: <amount>` per entry.
    pub lines: Vec<String>,
    pub entries: Vec<HistoryEntryJson>,
}

impl HistoryJson {
    pub fn from_entries(entries: &[HistoryEntry]) -> Self {
        Self {
            lines: entries.iter().map(HistoryEntry::display_line).collect(),
            entries: entries.iter().map(HistoryEntryJson::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgressJson {
    pub blocks_remaining: u64,
    /// Height of the last block applied to the wallet.
    pub tip_height: Option<u64>,
    pub peers: usize,
    pub state: String,
}

impl From<SyncProgress> for SyncProgressJson {
    fn from(p: SyncProgress) -> Self {
        Self {
            blocks_remaining: p.blocks_remaining,
            tip_height: p.applied_height,
            peers: p.peers,
            state: p.phase.as_str().to_string(),
        }
    }
}

/// Successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResultJson {
    pub txid: String,
    /// Amount paid, as a friendly string.
    pub amount: String,
}

/// Numeric JSON-RPC code for a send failure.
pub fn send_error_code(e: &SendError) -> i32 {
    match e {
        SendError::AddressInvalid(_) => ADDRESS_INVALID_CODE,
        SendError::AmountInvalid(_) => AMOUNT_INVALID_CODE,
        SendError::InsufficientFunds(_) => INSUFFICIENT_FUNDS_CODE,
        SendError::Timeout(_) => TIMEOUT_CODE,
        SendError::Submission(_) | SendError::Internal(_) => INTERNAL_ERROR_CODE,
    }
}

fn send_error(e: SendError) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(send_error_code(&e), e.to_string(), Some(e.code()))
}

fn internal_error(e: EngineError) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(INTERNAL_ERROR_CODE, e.to_string(), Some("INTERNAL_ERROR"))
}

/// The wallet JSON-RPC interface.
#[rpc(server)]
pub trait WalletRpc {
    /// Returns the wallet balance.
    #[method(name = "getbalance")]
    async fn get_balance(&self) -> Result<BalanceJson, ErrorObjectOwned>;

    /// Returns the transaction history, oldest first.
    #[method(name = "listtransactions")]
    async fn list_transactions(&self) -> Result<HistoryJson, ErrorObjectOwned>;

    /// Returns blocks remaining, tip height, peers and sync state.
    #[method(name = "getsyncprogress")]
    async fn get_sync_progress(&self) -> Result<SyncProgressJson, ErrorObjectOwned>;

    /// Returns the next receive address.
    #[method(name = "getnewaddress")]
    async fn get_new_address(&self) -> Result<String, ErrorObjectOwned>;

    /// Pays `amount` coins to `address`.
    #[method(name = "send")]
    async fn send(&self, address: String, amount: String) -> Result<SendResultJson, ErrorObjectOwned>;
}

pub struct RpcServerImpl {
    engine: Arc<WalletEngine>,
}

impl RpcServerImpl {
    pub fn new(engine: Arc<WalletEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl WalletRpcServer for RpcServerImpl {
    async fn get_balance(&self) -> Result<BalanceJson, ErrorObjectOwned> {
        Ok(self.engine.balance().into())
    }

    async fn list_transactions(&self) -> Result<HistoryJson, ErrorObjectOwned> {
        Ok(HistoryJson::from_entries(&self.engine.history()))
    }

    async fn get_sync_progress(&self) -> Result<SyncProgressJson, ErrorObjectOwned> {
        Ok(self.engine.sync_progress().into())
    }

    async fn get_new_address(&self) -> Result<String, ErrorObjectOwned> {
        let address = self.engine.new_receive_address().map_err(internal_error)?;
        Ok(address.encode())
    }

    async fn send(&self, address: String, amount: String) -> Result<SendResultJson, ErrorObjectOwned> {
        let submitted = self.engine.send(&address, &amount).await.map_err(send_error)?;
        Ok(SendResultJson {
            txid: submitted.txid.to_string(),
            amount: submitted.amount.to_friendly_string(),
        })
    }
}

/// Bind the RPC server to `addr` and start serving.
pub async fn start_rpc_server(addr: &str, engine: Arc<WalletEngine>) -> Result<ServerHandle, EngineError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| EngineError::Config(format!("RPC server error: {e}")))?;
    Ok(server.start(RpcServerImpl::new(engine).into_rpc()))
}
