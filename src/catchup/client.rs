//! Catch-up Client
//!
//! TCP client used by a lagging member to pull state from an upstream.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{
    read_message, write_message, CatchupMessage, CatchupRequest, CatchupResponse, CatchupStatus,
    CommittedTransaction, StoreCopyOutcome,
};
use crate::config::CatchupConfig;
use crate::error::{Error, Result};
use crate::id::{MemberId, StoreId};
use crate::snapshot::CoreSnapshot;

/// Transactions arriving from an upstream, in commit order
pub type TransactionStream = BoxStream<'static, Result<CommittedTransaction>>;

/// Operations a member can ask of an upstream's catch-up server
#[async_trait]
pub trait CatchupClient: Send + Sync {
    /// Fetch the upstream's current core snapshot
    async fn get_core_snapshot(&self, address: &str, requester: &MemberId) -> Result<CoreSnapshot>;

    /// Ask the upstream for its store id
    async fn get_store_id(&self, address: &str) -> Result<StoreId>;

    /// Copy the upstream's store files into `destination`
    async fn copy_store(
        &self,
        address: &str,
        expected_store_id: StoreId,
        destination: &Path,
    ) -> Result<StoreCopyOutcome>;

    /// Stream every transaction from `from_tx_id` onwards.
    ///
    /// The stream ends once the upstream reports it is caught up, and
    /// yields an error if the upstream has pruned `from_tx_id`.
    async fn pull_transactions(
        &self,
        address: &str,
        store_id: StoreId,
        from_tx_id: u64,
    ) -> Result<TransactionStream>;
}

/// Catch-up client over TCP, one connection per request
#[derive(Debug, Clone)]
pub struct TcpCatchupClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Longest wait for the next frame of a response
    inactivity_timeout: Duration,
}

impl TcpCatchupClient {
    /// Create a new catch-up client
    pub fn new(connect_timeout: Duration, inactivity_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            inactivity_timeout,
        }
    }

    pub fn from_config(config: &CatchupConfig) -> Self {
        Self::new(config.connect_timeout(), config.inactivity_timeout())
    }

    /// Connect and send `request`, returning the read half for the response
    async fn request(&self, address: &str, request: CatchupRequest) -> Result<OwnedReadHalf> {
        let stream = self.connect(address).await?;
        let (reader, mut writer) = stream.into_split();
        write_message(&mut writer, &CatchupMessage::Request(request)).await?;
        writer.shutdown().await?;
        Ok(reader)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Read the next frame, giving up after the inactivity timeout
    async fn next(&self, address: &str, reader: &mut OwnedReadHalf) -> Result<CatchupMessage> {
        match timeout(self.inactivity_timeout, read_message(reader)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn next_response(
        &self,
        address: &str,
        reader: &mut OwnedReadHalf,
    ) -> Result<CatchupResponse> {
        match self.next(address, reader).await? {
            CatchupMessage::Response(CatchupResponse::Error { message }) => Err(Error::Network(
                format!("Upstream {} reported an error: {}", address, message),
            )),
            CatchupMessage::Response(response) => Ok(response),
            other => Err(unexpected(address, &other)),
        }
    }
}

#[async_trait]
impl CatchupClient for TcpCatchupClient {
    async fn get_core_snapshot(&self, address: &str, requester: &MemberId) -> Result<CoreSnapshot> {
        let mut reader = self
            .request(
                address,
                CatchupRequest::CoreSnapshot {
                    requester: requester.clone(),
                },
            )
            .await?;
        match self.next(address, &mut reader).await? {
            CatchupMessage::Snapshot(snapshot) => {
                tracing::debug!("Received {} from {}", snapshot, address);
                Ok(snapshot)
            }
            CatchupMessage::Response(CatchupResponse::Error { message }) => Err(Error::Network(
                format!("Upstream {} could not provide a snapshot: {}", address, message),
            )),
            other => Err(unexpected(address, &other)),
        }
    }

    async fn get_store_id(&self, address: &str) -> Result<StoreId> {
        let mut reader = self.request(address, CatchupRequest::GetStoreId).await?;
        match self.next_response(address, &mut reader).await? {
            CatchupResponse::StoreId(store_id) => Ok(store_id),
            other => Err(unexpected(address, &CatchupMessage::Response(other))),
        }
    }

    async fn copy_store(
        &self,
        address: &str,
        expected_store_id: StoreId,
        destination: &Path,
    ) -> Result<StoreCopyOutcome> {
        tokio::fs::create_dir_all(destination).await?;
        let mut reader = self
            .request(address, CatchupRequest::StoreCopy { expected_store_id })
            .await?;

        let mut outcome = StoreCopyOutcome::default();
        let mut receiving: Option<ReceivingFile> = None;

        loop {
            match self.next_response(address, &mut reader).await? {
                CatchupResponse::FileHeader { path, size } => {
                    if let Some(open) = &receiving {
                        return Err(open.incomplete(address));
                    }
                    let target = destination.join(checked_relative_path(&path)?);
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tracing::debug!("Receiving {} ({} bytes) from {}", path, size, address);
                    let file = tokio::fs::File::create(&target).await?;
                    receiving = Some(ReceivingFile {
                        path: target,
                        file,
                        expected: size,
                        written: 0,
                    });
                    outcome.files += 1;
                }
                CatchupResponse::FileChunk { data, last } => {
                    let Some(open) = receiving.as_mut() else {
                        return Err(Error::Network(format!(
                            "Upstream {} sent a file chunk before a file header",
                            address
                        )));
                    };
                    let written = open.written + data.len() as u64;
                    if written > open.expected {
                        return Err(Error::Network(format!(
                            "Upstream {} sent {} bytes for {}, which has {}",
                            address,
                            written,
                            open.path.display(),
                            open.expected
                        )));
                    }
                    open.file.write_all(&data).await?;
                    open.written = written;
                    outcome.bytes += data.len() as u64;
                    if last {
                        if open.written != open.expected {
                            return Err(open.incomplete(address));
                        }
                        open.file.sync_all().await?;
                        tracing::trace!("Finished {}", open.path.display());
                        receiving = None;
                    }
                }
                CatchupResponse::StoreCopyFinished {
                    status,
                    last_flushed_tx_id,
                } => {
                    return match status {
                        CatchupStatus::SuccessEndOfStream => {
                            if let Some(open) = &receiving {
                                return Err(open.incomplete(address));
                            }
                            outcome.last_flushed_tx_id = last_flushed_tx_id;
                            Ok(outcome)
                        }
                        CatchupStatus::EStoreIdMismatch => {
                            let actual = self.get_store_id(address).await?;
                            Err(Error::StoreIdMismatch {
                                expected: expected_store_id,
                                actual,
                            })
                        }
                        other => Err(Error::Network(format!(
                            "Store copy from {} ended with {}",
                            address, other
                        ))),
                    };
                }
                other => return Err(unexpected(address, &CatchupMessage::Response(other))),
            }
        }
    }

    async fn pull_transactions(
        &self,
        address: &str,
        store_id: StoreId,
        from_tx_id: u64,
    ) -> Result<TransactionStream> {
        let reader = self
            .request(
                address,
                CatchupRequest::TxPull {
                    store_id,
                    from_tx_id,
                },
            )
            .await?;

        let pull = TxPull {
            client: self.clone(),
            address: address.to_string(),
            reader,
            store_id,
            from_tx_id,
            pulled: 0,
        };
        let stream = futures::stream::try_unfold(pull, |mut pull| async move {
            let next = pull.next_transaction().await?;
            Ok::<_, Error>(next.map(|tx| (tx, pull)))
        });
        Ok(stream.boxed())
    }
}

/// A store file being written during a copy
struct ReceivingFile {
    path: PathBuf,
    file: tokio::fs::File,
    /// Size announced in the file header
    expected: u64,
    written: u64,
}

impl ReceivingFile {
    fn incomplete(&self, address: &str) -> Error {
        Error::Network(format!(
            "Upstream {} left {} incomplete: received {} of {} bytes",
            address,
            self.path.display(),
            self.written,
            self.expected
        ))
    }
}

/// Response side of a transaction pull
struct TxPull {
    client: TcpCatchupClient,
    address: String,
    reader: OwnedReadHalf,
    store_id: StoreId,
    from_tx_id: u64,
    pulled: u64,
}

impl TxPull {
    /// Next transaction, `None` once the upstream is caught up
    async fn next_transaction(&mut self) -> Result<Option<CommittedTransaction>> {
        match self
            .client
            .next_response(&self.address, &mut self.reader)
            .await?
        {
            CatchupResponse::Transaction(tx) => {
                self.pulled += 1;
                Ok(Some(tx))
            }
            CatchupResponse::TxStreamFinished { status, last_tx_id } => match status {
                CatchupStatus::SuccessEndOfStream => {
                    tracing::debug!(
                        "Pulled {} transactions from {} up to {}",
                        self.pulled,
                        self.address,
                        last_tx_id
                    );
                    Ok(None)
                }
                CatchupStatus::ETransactionPruned => {
                    Err(Error::TransactionsPruned(self.from_tx_id))
                }
                CatchupStatus::EStoreIdMismatch => {
                    let actual = self.client.get_store_id(&self.address).await?;
                    Err(Error::StoreIdMismatch {
                        expected: self.store_id,
                        actual,
                    })
                }
                CatchupStatus::EGeneralError => Err(Error::Network(format!(
                    "Transaction pull from {} failed",
                    self.address
                ))),
            },
            other => Err(unexpected(&self.address, &CatchupMessage::Response(other))),
        }
    }
}

fn unexpected(address: &str, message: &CatchupMessage) -> Error {
    let name = match message {
        CatchupMessage::Request(_) => "Request",
        CatchupMessage::Response(response) => response.type_name(),
        CatchupMessage::Snapshot(_) => "CoreSnapshot",
    };
    Error::Network(format!("Unexpected {} from {}", name, address))
}

/// Accept only plain relative paths below the destination
fn checked_relative_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    if candidate.as_os_str().is_empty()
        || !candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(Error::Network(format!("Refusing store file path '{}'", path)));
    }
    Ok(candidate.to_path_buf())
}
