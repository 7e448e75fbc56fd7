//! Wire message types for the satchel peer protocol.
//!
//! Gossip messages are the network's magic bytes followed by a bincode
//! payload. Point-to-point requests travel over libp2p request-response with
//! a 4-byte big-endian length prefix.

use libp2p::futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use satchel_core::constants::{
    MAX_BLOCK_SIZE, MAX_HEADERS_PER_REQUEST, MAX_PLAUSIBLE_HEIGHT, Network, PROTOCOL_VERSION,
};
use satchel_core::error::NetworkError;
use satchel_core::types::{Block, BlockHeader, Hash256, Transaction};
use std::io;

/// Gossipsub topic for block announcements.
pub const BLOCKS_TOPIC: &str = "/satchel/blocks/1";

/// Gossipsub topic for transaction announcements.
pub const TXS_TOPIC: &str = "/satchel/txs/1";

/// Protocol name for request-response.
pub const REQ_RESP_PROTOCOL: &str = "/satchel/wallet/1";

/// Maximum gossip message size (block size + overhead for framing).
pub const MAX_MESSAGE_SIZE: usize = MAX_BLOCK_SIZE + 1024;

/// Maximum number of hashes in a header locator.
pub const MAX_LOCATOR_SIZE: usize = 64;

/// Maximum request size. Transaction submission dominates.
pub const MAX_REQUEST_SIZE: usize = 256 * 1024;

/// Maximum response size (one full block, or a full batch of headers).
pub const MAX_RESPONSE_SIZE: usize = MAX_BLOCK_SIZE + 1024;

/// Client name sent in the handshake.
pub const USER_AGENT: &str = concat!("/satchel:", env!("CARGO_PKG_VERSION"), "/");

/// An unsolicited announcement relayed over gossipsub.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum NetworkMessage {
    NewBlock(Block),
    NewTransaction(Transaction),
}

impl NetworkMessage {
    /// Encode this message as the network's magic bytes + bincode payload.
    pub fn encode(&self, network: Network) -> Result<Vec<u8>, NetworkError> {
        let magic = network.magic_bytes();
        let payload = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| NetworkError::Transport(format!("encode error: {e}")))?;
        let total_size = magic.len() + payload.len();
        if total_size > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge { size: total_size });
        }
        let mut buf = Vec::with_capacity(total_size);
        buf.extend_from_slice(&magic);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a gossip payload.
    ///
    /// Returns `None` for oversized data, a foreign network's magic, or a
    /// payload that does not decode.
    pub fn decode(data: &[u8], network: Network) -> Option<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        let payload = data.strip_prefix(&network.magic_bytes()[..])?;
        let (msg, _): (Self, usize) =
            bincode::decode_from_slice(payload, bincode::config::standard()).ok()?;
        Some(msg)
    }

    /// Gossipsub topic this message is published to.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::NewBlock(_) => BLOCKS_TOPIC,
            Self::NewTransaction(_) => TXS_TOPIC,
        }
    }
}

/// Version and capability exchange, the first request on every connection.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub magic: [u8; 4],
    /// Height of the sender's best block.
    pub best_height: u64,
    pub best_hash: Hash256,
    pub user_agent: String,
}

impl VersionMessage {
    /// Our own version message. A wallet serves no chain data, so it reports an empty chain.
    pub fn local(network: Network) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            magic: network.magic_bytes(),
            best_height: 0,
            best_hash: Hash256::ZERO,
            user_agent: USER_AGENT.to_string(),
        }
    }

    /// Check that a peer speaks our protocol on our network and reports a
    /// chain height it could actually have.
    pub fn check_compatible(&self, network: Network) -> Result<(), NetworkError> {
        if self.magic != network.magic_bytes() {
            return Err(NetworkError::Incompatible(format!(
                "peer is not on {network} (magic {:02x?})",
                self.magic
            )));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(NetworkError::Incompatible(format!(
                "protocol version {} (ours {PROTOCOL_VERSION})",
                self.protocol_version
            )));
        }
        if self.best_height > MAX_PLAUSIBLE_HEIGHT {
            return Err(NetworkError::Incompatible(format!(
                "implausible best height {}",
                self.best_height
            )));
        }
        Ok(())
    }
}

/// Point-to-point requests the wallet sends to a peer.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WalletRequest {
    Handshake(VersionMessage),
    /// Headers following the first locator hash the peer recognises,
    /// or from genesis when none match.
    GetHeaders { locator: Vec<Hash256> },
    GetBlock(Hash256),
    /// Ask the peer to accept a transaction into its mempool and relay it.
    SubmitTransaction(Transaction),
}

impl WalletRequest {
    pub fn validate(&self) -> Result<(), NetworkError> {
        if let Self::GetHeaders { locator } = self {
            if locator.len() > MAX_LOCATOR_SIZE {
                return Err(NetworkError::LocatorTooLarge {
                    size: locator.len(),
                    max: MAX_LOCATOR_SIZE,
                });
            }
        }
        Ok(())
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::GetHeaders { .. } => "get_headers",
            Self::GetBlock(_) => "get_block",
            Self::SubmitTransaction(_) => "submit_transaction",
        }
    }
}

/// Point-to-point responses.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WalletResponse {
    Handshake(VersionMessage),
    Headers(Vec<BlockHeader>),
    /// `None` when the peer does not have the block.
    Block(Option<Block>),
    /// The peer accepted the transaction for relay.
    TxAccepted(Hash256),
    TxRejected { txid: Hash256, reason: String },
    /// The request was malformed or not served.
    Error(String),
}

impl WalletResponse {
    pub fn validate(&self) -> Result<(), NetworkError> {
        if let Self::Headers(headers) = self {
            if headers.len() > MAX_HEADERS_PER_REQUEST {
                return Err(NetworkError::MessageTooLarge { size: headers.len() });
            }
        }
        Ok(())
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

async fn read_frame<T, M>(io: &mut T, max: usize) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: bincode::Decode<()>,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(invalid_data(format!("frame of {len} bytes exceeds {max}")));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    let (msg, _) = bincode::decode_from_slice(&buf, bincode::config::standard())
        .map_err(|e| invalid_data(e.to_string()))?;
    Ok(msg)
}

async fn write_frame<T, M>(io: &mut T, msg: &M, max: usize) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: bincode::Encode,
{
    let buf = bincode::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| invalid_data(e.to_string()))?;
    if buf.len() > max {
        return Err(invalid_data(format!("frame of {} bytes exceeds {max}", buf.len())));
    }
    io.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await
}

/// Length-prefixed bincode codec for [`WalletRequest`] / [`WalletResponse`].
#[derive(Debug, Clone, Default)]
pub struct SatchelCodec;

#[async_trait::async_trait]
impl libp2p::request_response::Codec for SatchelCodec {
    type Protocol = libp2p::StreamProtocol;
    type Request = WalletRequest;
    type Response = WalletResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let request: WalletRequest = read_frame(io, MAX_REQUEST_SIZE).await?;
        request.validate().map_err(|e| invalid_data(e.to_string()))?;
        Ok(request)
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let response: WalletResponse = read_frame(io, MAX_RESPONSE_SIZE).await?;
        response.validate().map_err(|e| invalid_data(e.to_string()))?;
        Ok(response)
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        req.validate().map_err(|e| invalid_data(e.to_string()))?;
        write_frame(io, &req, MAX_REQUEST_SIZE).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        resp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &resp, MAX_RESPONSE_SIZE).await
    }
}
