//! Catch-up Protocol
//!
//! Request/response messages a lagging member uses to fetch a core
//! snapshot, a copy of the store and the transactions committed after it.
//!
//! Every message travels in a frame of `kind u8 | length u32 | crc32 u32 |
//! body`. Requests and responses are bincode encoded; a core snapshot is
//! sent in its own encoding under a dedicated kind.

mod client;
mod server;

pub use client::{CatchupClient, TcpCatchupClient, TransactionStream};
pub use server::{CatchupServer, CatchupSource};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::id::{MemberId, StoreId};
use crate::replication::FrameHeader;
use crate::snapshot::CoreSnapshot;

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// A transaction committed to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub tx_id: u64,
    pub payload: Bytes,
}

impl CommittedTransaction {
    pub fn new(tx_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            tx_id,
            payload: payload.into(),
        }
    }
}

/// Result of copying a store from an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCopyOutcome {
    /// Last transaction guaranteed to be contained in the copied files
    pub last_flushed_tx_id: u64,
    /// Files received
    pub files: usize,
    /// Bytes received
    pub bytes: u64,
}

/// Outcome of a streamed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchupStatus {
    SuccessEndOfStream,
    ETransactionPruned,
    EStoreIdMismatch,
    EGeneralError,
}

impl std::fmt::Display for CatchupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatchupStatus::SuccessEndOfStream => write!(f, "SUCCESS_END_OF_STREAM"),
            CatchupStatus::ETransactionPruned => write!(f, "E_TRANSACTION_PRUNED"),
            CatchupStatus::EStoreIdMismatch => write!(f, "E_STORE_ID_MISMATCH"),
            CatchupStatus::EGeneralError => write!(f, "E_GENERAL_ERROR"),
        }
    }
}

/// Requests sent to a catch-up server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchupRequest {
    CoreSnapshot { requester: MemberId },
    GetStoreId,
    StoreCopy { expected_store_id: StoreId },
    TxPull { store_id: StoreId, from_tx_id: u64 },
}

/// Responses streamed back by a catch-up server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchupResponse {
    StoreId(StoreId),
    FileHeader { path: String, size: u64 },
    FileChunk { data: Bytes, last: bool },
    StoreCopyFinished { status: CatchupStatus, last_flushed_tx_id: u64 },
    Transaction(CommittedTransaction),
    TxStreamFinished { status: CatchupStatus, last_tx_id: u64 },
    Error { message: String },
}

impl CatchupResponse {
    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            CatchupResponse::StoreId(_) => "StoreId",
            CatchupResponse::FileHeader { .. } => "FileHeader",
            CatchupResponse::FileChunk { .. } => "FileChunk",
            CatchupResponse::StoreCopyFinished { .. } => "StoreCopyFinished",
            CatchupResponse::Transaction(_) => "Transaction",
            CatchupResponse::TxStreamFinished { .. } => "TxStreamFinished",
            CatchupResponse::Error { .. } => "Error",
        }
    }
}

/// Anything that can travel in a catch-up frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchupMessage {
    Request(CatchupRequest),
    Response(CatchupResponse),
    Snapshot(CoreSnapshot),
}

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_SNAPSHOT: u8 = 3;

impl CatchupMessage {
    fn encode(&self) -> Result<(u8, Vec<u8>)> {
        Ok(match self {
            CatchupMessage::Request(request) => (KIND_REQUEST, bincode::serialize(request)?),
            CatchupMessage::Response(response) => (KIND_RESPONSE, bincode::serialize(response)?),
            CatchupMessage::Snapshot(snapshot) => (KIND_SNAPSHOT, snapshot.serialize()?),
        })
    }

    fn decode(kind: u8, body: &[u8]) -> Result<Self> {
        match kind {
            KIND_REQUEST => Ok(CatchupMessage::Request(bincode::deserialize(body)?)),
            KIND_RESPONSE => Ok(CatchupMessage::Response(bincode::deserialize(body)?)),
            KIND_SNAPSHOT => Ok(CatchupMessage::Snapshot(CoreSnapshot::deserialize(body)?)),
            other => Err(Error::Network(format!("Unknown frame kind {}", other))),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<CatchupMessage> {
    let kind = reader.read_u8().await?;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds the limit of {}",
            header.length, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    if !header.verify(&body) {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    CatchupMessage::decode(kind, &body)
}

/// Write a framed message to a writer
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &CatchupMessage,
) -> Result<()> {
    let (kind, body) = message.encode()?;
    let header = FrameHeader::new(&body);

    writer.write_u8(kind).await?;
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
