//! RocksDB-backed wallet persistence.
//!
//! Column families:
//! - `wallet`: bincode [`WalletState`] keyed by wallet id
//! - `headers`: validated [`BlockHeader`]s keyed by big-endian height
//! - `meta`: key-chain cursors per wallet id, plus the network the database belongs to
//!
//! A wallet record and its cursors are written in one [`WriteBatch`].

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};

use satchel_core::constants::Network;
use satchel_core::types::BlockHeader;
use satchel_wallet::{KeyChainCursors, WalletState};

use crate::error::EngineError;

const CF_WALLET: &str = "wallet";
const CF_HEADERS: &str = "headers";
const CF_META: &str = "meta";

const ALL_CFS: &[&str] = &[CF_WALLET, CF_HEADERS, CF_META];

const META_NETWORK: &[u8] = b"network";
const META_CURSORS_PREFIX: &str = "cursors/";

fn storage_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(e.to_string())
}

pub struct WalletStorage {
    db: DB,
}

impl WalletStorage {
    /// Open or create the database at `path` for `network`.
    ///
    /// A database created for another network is refused.
    pub fn open(path: impl AsRef<Path>, network: Network) -> Result<Self, EngineError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(storage_err)?;
        let store = Self { db };
        store.check_network(network)?;
        Ok(store)
    }

    fn check_network(&self, network: Network) -> Result<(), EngineError> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_NETWORK).map_err(storage_err)? {
            Some(stored) if stored.as_slice() == network.name().as_bytes() => Ok(()),
            Some(stored) => Err(EngineError::Storage(format!(
                "database belongs to {}, not {network}",
                String::from_utf8_lossy(&stored)
            ))),
            None => self.db.put_cf(cf, META_NETWORK, network.name()).map_err(storage_err),
        }
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, EngineError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EngineError::Storage(format!("missing column family: {name}")))
    }

    fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, EngineError> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(storage_err)
    }

    fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, EngineError> {
        let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(storage_err)?;
        Ok(value)
    }

    fn cursors_key(wallet_id: &str) -> Vec<u8> {
        format!("{META_CURSORS_PREFIX}{wallet_id}").into_bytes()
    }

    /// Persist a wallet record and its key-chain cursors atomically.
    pub fn save_wallet(
        &self,
        wallet_id: &str,
        state: &WalletState,
        cursors: &KeyChainCursors,
    ) -> Result<(), EngineError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_WALLET)?, wallet_id.as_bytes(), Self::encode(state)?);
        batch.put_cf(self.cf_handle(CF_META)?, Self::cursors_key(wallet_id), Self::encode(cursors)?);
        self.db.write(batch).map_err(storage_err)
    }

    pub fn load_wallet(&self, wallet_id: &str) -> Result<Option<WalletState>, EngineError> {
        let cf = self.cf_handle(CF_WALLET)?;
        self.db
            .get_cf(cf, wallet_id.as_bytes())
            .map_err(storage_err)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    pub fn load_cursors(&self, wallet_id: &str) -> Result<Option<KeyChainCursors>, EngineError> {
        let cf = self.cf_handle(CF_META)?;
        self.db
            .get_cf(cf, Self::cursors_key(wallet_id))
            .map_err(storage_err)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    /// Write `headers` at consecutive heights starting at `from_height`.
    pub fn put_headers(&self, from_height: u64, headers: &[BlockHeader]) -> Result<(), EngineError> {
        if headers.is_empty() {
            return Ok(());
        }
        let cf = self.cf_handle(CF_HEADERS)?;
        let mut batch = WriteBatch::default();
        for (height, header) in (from_height..).zip(headers) {
            batch.put_cf(cf, height.to_be_bytes(), Self::encode(header)?);
        }
        self.db.write(batch).map_err(storage_err)
    }

    /// The stored header chain from height 0, stopping at the first gap.
    pub fn load_headers(&self) -> Result<Vec<BlockHeader>, EngineError> {
        let cf = self.cf_handle(CF_HEADERS)?;
        let mut headers = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            let height = <[u8; 8]>::try_from(key.as_ref())
                .map(u64::from_be_bytes)
                .map_err(|_| EngineError::Storage("invalid header key".into()))?;
            if height != headers.len() as u64 {
                tracing::warn!(height, expected = headers.len(), "gap in stored headers");
                break;
            }
            headers.push(Self::decode(&value)?);
        }
        Ok(headers)
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        self.db.flush().map_err(storage_err)
    }
}

impl std::fmt::Debug for WalletStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletStorage").field("path", &self.db.path()).finish()
    }
}
