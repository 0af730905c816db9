//! Catch-up Server
//!
//! Serves snapshots, store copies and transaction pulls to lagging members.
//! Each connection carries one request; the response is streamed back and
//! the connection closed.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use super::{
    read_message, write_message, CatchupMessage, CatchupRequest, CatchupResponse, CatchupStatus,
    CommittedTransaction,
};
use crate::config::CatchupConfig;
use crate::error::{Error, Result};
use crate::id::StoreId;
use crate::snapshot::CoreSnapshot;

/// The local state a catch-up server hands out
#[async_trait]
pub trait CatchupSource: Send + Sync {
    /// Current core snapshot
    async fn core_snapshot(&self) -> Result<CoreSnapshot>;

    /// Id of the local store
    async fn store_id(&self) -> Result<StoreId>;

    /// Directory holding the store files.
    ///
    /// The files must contain every transaction up to the id returned by
    /// `last_flushed_tx_id` at the time the copy starts.
    fn store_dir(&self) -> PathBuf;

    /// Last transaction flushed to the store files
    async fn last_flushed_tx_id(&self) -> Result<u64>;

    /// Up to `limit` transactions starting at `from_tx_id`.
    ///
    /// Returns `None` if `from_tx_id` is no longer retained; an empty list
    /// means there is nothing newer.
    async fn read_transactions(
        &self,
        from_tx_id: u64,
        limit: usize,
    ) -> Result<Option<Vec<CommittedTransaction>>>;
}

/// TCP server answering catch-up requests
pub struct CatchupServer {
    /// Bound listener
    listener: TcpListener,
    /// Where snapshots, files and transactions come from
    source: Arc<dyn CatchupSource>,
    /// Chunk and batch sizes
    config: CatchupConfig,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl CatchupServer {
    /// Bind a new catch-up server
    pub async fn bind(
        bind_address: &str,
        source: Arc<dyn CatchupSource>,
        config: CatchupConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Ok(Self {
            listener,
            source,
            config,
            shutdown: shutdown_tx,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until stopped
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Catch-up server listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let source = self.source.clone();
                            let config = self.config.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, source, &config).await {
                                    tracing::warn!("Catch-up connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Catch-up server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single request
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    source: Arc<dyn CatchupSource>,
    config: &CatchupConfig,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    let request = match read_message(&mut reader).await? {
        CatchupMessage::Request(request) => request,
        _ => {
            let response = CatchupResponse::Error {
                message: "Expected a request".into(),
            };
            return write_message(&mut writer, &CatchupMessage::Response(response)).await;
        }
    };
    tracing::debug!("Catch-up request {:?} from {}", request, peer_addr);

    let result = match request {
        CatchupRequest::CoreSnapshot { requester } => {
            tracing::info!("Serving core snapshot to {}", requester);
            match source.core_snapshot().await {
                Ok(snapshot) => {
                    write_message(&mut writer, &CatchupMessage::Snapshot(snapshot)).await
                }
                Err(e) => Err(e),
            }
        }
        CatchupRequest::GetStoreId => match source.store_id().await {
            Ok(store_id) => {
                respond(&mut writer, CatchupResponse::StoreId(store_id)).await
            }
            Err(e) => Err(e),
        },
        CatchupRequest::StoreCopy { expected_store_id } => {
            serve_store_copy(&mut writer, source.as_ref(), expected_store_id, config).await
        }
        CatchupRequest::TxPull {
            store_id,
            from_tx_id,
        } => serve_tx_pull(&mut writer, source.as_ref(), store_id, from_tx_id, config).await,
    };

    if let Err(e) = result {
        tracing::warn!("Failed to serve {}: {}", peer_addr, e);
        let response = CatchupResponse::Error {
            message: e.to_string(),
        };
        // the peer may already be gone
        let _ = respond(&mut writer, response).await;
    }
    Ok(())
}

async fn respond<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    response: CatchupResponse,
) -> Result<()> {
    write_message(writer, &CatchupMessage::Response(response)).await
}

async fn serve_store_copy<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    source: &dyn CatchupSource,
    expected_store_id: StoreId,
    config: &CatchupConfig,
) -> Result<()> {
    let local_id = source.store_id().await?;
    if local_id != expected_store_id {
        tracing::warn!(
            "Refusing store copy: requested {}, local store is {}",
            expected_store_id,
            local_id
        );
        return respond(
            writer,
            CatchupResponse::StoreCopyFinished {
                status: CatchupStatus::EStoreIdMismatch,
                last_flushed_tx_id: 0,
            },
        )
        .await;
    }

    let last_flushed_tx_id = source.last_flushed_tx_id().await?;
    let root = source.store_dir();
    let files = list_files(&root).await?;
    tracing::info!(
        "Streaming {} store files up to transaction {}",
        files.len(),
        last_flushed_tx_id
    );

    let mut buf = vec![0u8; config.file_chunk_size.max(1)];
    for relative in files {
        let path = root.join(&relative);
        let mut file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        respond(
            writer,
            CatchupResponse::FileHeader {
                path: relative.to_string_lossy().replace('\\', "/"),
                size,
            },
        )
        .await?;
        stream_file(writer, &mut file, &path, size, &mut buf).await?;
    }

    respond(
        writer,
        CatchupResponse::StoreCopyFinished {
            status: CatchupStatus::SuccessEndOfStream,
            last_flushed_tx_id,
        },
    )
    .await
}

/// Send exactly `size` bytes of `file` as chunks, the final one marked last.
///
/// A file that ends early fails the copy rather than sending a short file.
async fn stream_file<W, R>(
    writer: &mut W,
    file: &mut R,
    path: &Path,
    size: u64,
    buf: &mut [u8],
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut remaining = size;
    loop {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = if want == 0 {
            0
        } else {
            file.read(&mut buf[..want]).await?
        };
        if n == 0 && remaining > 0 {
            return Err(Error::Internal(format!(
                "{} shrank while being copied: {} of {} bytes missing",
                path.display(),
                remaining,
                size
            )));
        }
        remaining -= n as u64;
        let last = remaining == 0;
        respond(
            writer,
            CatchupResponse::FileChunk {
                data: Bytes::copy_from_slice(&buf[..n]),
                last,
            },
        )
        .await?;
        if last {
            return Ok(());
        }
    }
}

async fn serve_tx_pull<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    source: &dyn CatchupSource,
    store_id: StoreId,
    from_tx_id: u64,
    config: &CatchupConfig,
) -> Result<()> {
    let local_id = source.store_id().await?;
    if local_id != store_id {
        return respond(
            writer,
            CatchupResponse::TxStreamFinished {
                status: CatchupStatus::EStoreIdMismatch,
                last_tx_id: 0,
            },
        )
        .await;
    }

    let mut next = from_tx_id;
    let mut last_tx_id = from_tx_id.saturating_sub(1);
    loop {
        let Some(batch) = source
            .read_transactions(next, config.tx_pull_batch_size.max(1))
            .await?
        else {
            tracing::warn!("Transaction {} requested but already pruned", next);
            return respond(
                writer,
                CatchupResponse::TxStreamFinished {
                    status: CatchupStatus::ETransactionPruned,
                    last_tx_id,
                },
            )
            .await;
        };
        if batch.is_empty() {
            break;
        }
        for tx in batch {
            if tx.tx_id < next {
                return Err(Error::Internal(format!(
                    "Transaction source went backwards: {} after {}",
                    tx.tx_id, last_tx_id
                )));
            }
            next = tx.tx_id + 1;
            last_tx_id = tx.tx_id;
            respond(writer, CatchupResponse::Transaction(tx)).await?;
        }
    }

    respond(
        writer,
        CatchupResponse::TxStreamFinished {
            status: CatchupStatus::SuccessEndOfStream,
            last_tx_id,
        },
    )
    .await
}

/// Every regular file below `root`, relative to it, in sorted order
async fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&relative)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}
