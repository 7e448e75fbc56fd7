//! # satchel-core
//! Chain primitives shared by the satchel wallet crates: hashes, transactions,
//! block headers, P2PKH addresses, coin amounts and secp256k1 signing.

pub mod address;
pub mod amount;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;

pub use address::Address;
pub use amount::Amount;
pub use constants::{CoinType, Network};
pub use types::{Block, BlockHeader, Hash256, OutPoint, Script, Transaction, TxInput, TxOutput};
