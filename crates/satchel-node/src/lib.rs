//! # satchel-node — Wallet engine, persistence and RPC.
//!
//! Composes the wallet, sync and transport crates into a running light wallet:
//! - [`engine::WalletEngine`] — coordinator task, peer lifecycle, block application
//! - [`sender`] — coin selection, reservation, signing and bounded submission
//! - [`events`] — observer and channel subscriptions to wallet notifications
//! - [`storage::WalletStorage`] — wallet state, headers and cursors in RocksDB
//! - [`rpc`] — JSON-RPC server for external access
//! - [`config::NodeConfig`] — layered daemon configuration

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod rpc;
pub mod sender;
pub mod storage;

pub use config::NodeConfig;
pub use engine::WalletEngine;
pub use error::{EngineError, SendError};
pub use events::{EventBus, Subscription, SubscriptionHandle, WalletEvent, WalletObserver};
pub use rpc::start_rpc_server;
pub use sender::{SendRequest, SubmittedTransaction};
pub use storage::WalletStorage;
