//! State Downloader
//!
//! Replaces the local store and core state with a consistent copy from an
//! upstream member. Used when a member is too far behind to be repaired by
//! log shipping.
//!
//! The download is a chain of fallible steps. The first failure aborts the
//! chain and panics the local database, so a store that was only partly
//! replaced is never served.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::catchup::{CatchupClient, CommittedTransaction, StoreCopyOutcome};
use crate::config::CatchupConfig;
use crate::error::{Error, Result};
use crate::id::{MemberId, StoreId};
use crate::log::RaftLog;
use crate::snapshot::{CoreSnapshot, CoreStateMachines};
use crate::topology::TopologyService;
use crate::upstream::UpstreamSelector;

/// The local database engine being caught up
#[async_trait]
pub trait LocalDatabase: Send + Sync {
    /// Directory holding the store files
    fn store_dir(&self) -> PathBuf;

    /// Stop serving so the store files can be replaced
    async fn stop_for_store_copy(&self) -> Result<()>;

    /// Start serving from the (new) store files
    async fn start(&self) -> Result<()>;

    /// Append transactions committed after the copied files, one batch at a time
    async fn append_transactions(&self, transactions: Vec<CommittedTransaction>) -> Result<()>;

    /// Refuse all further use until an operator intervenes
    async fn panic(&self, cause: &Error);
}

/// One download attempt
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub source: MemberId,
    pub source_address: String,
    pub target_store_id: StoreId,
    pub snapshot: CoreSnapshot,
}

/// Downloads core state and store files from an upstream
pub struct StateDownloader {
    /// This member's id
    local: MemberId,
    database: Arc<dyn LocalDatabase>,
    machines: Arc<CoreStateMachines>,
    /// Local replicated log, moved past the installed snapshot
    log: Arc<dyn RaftLog>,
    topology: Arc<dyn TopologyService>,
    client: Arc<dyn CatchupClient>,
    config: CatchupConfig,
    /// Held for the duration of a download
    in_progress: Mutex<()>,
}

impl StateDownloader {
    pub fn new(
        local: MemberId,
        database: Arc<dyn LocalDatabase>,
        machines: Arc<CoreStateMachines>,
        log: Arc<dyn RaftLog>,
        topology: Arc<dyn TopologyService>,
        client: Arc<dyn CatchupClient>,
        config: CatchupConfig,
    ) -> Self {
        Self {
            local,
            database,
            machines,
            log,
            topology,
            client,
            config,
            in_progress: Mutex::new(()),
        }
    }

    /// Whether a download is currently running
    pub fn is_downloading(&self) -> bool {
        self.in_progress.try_lock().is_err()
    }

    /// Download from whichever upstream the selector picks
    pub async fn download_from_best_upstream(
        &self,
        selector: &UpstreamSelector,
        expected_store_id: StoreId,
    ) -> Result<MemberId> {
        let candidate = selector.best_upstream().await?;
        self.download_snapshot(&candidate.member, expected_store_id)
            .await?;
        Ok(candidate.member)
    }

    /// Replace local state with a copy from `source`.
    ///
    /// On failure the local database has been panicked and the error is
    /// `Error::StoreCopyFailed`. A concurrent call fails with
    /// `Error::DownloadInProgress` without touching anything.
    pub async fn download_snapshot(
        &self,
        source: &MemberId,
        expected_store_id: StoreId,
    ) -> Result<()> {
        let _guard = self
            .in_progress
            .try_lock()
            .map_err(|_| Error::DownloadInProgress)?;

        tracing::info!("Downloading state from {}", source);
        match self.download(source, expected_store_id).await {
            Ok(()) => {
                tracing::info!("State download from {} complete", source);
                Ok(())
            }
            Err(e) => {
                tracing::error!("State download from {} failed: {}", source, e);
                self.database.panic(&e).await;
                Err(Error::StoreCopyFailed {
                    source_member: source.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn download(&self, source: &MemberId, expected_store_id: StoreId) -> Result<()> {
        let source_address = self.topology.find_catchup_address(source).await?;

        tracing::info!("Stopping local database for store copy");
        self.database.stop_for_store_copy().await?;

        let snapshot = self.fetch_snapshot(&source_address).await?;
        let session = DownloadSession {
            source: source.clone(),
            source_address,
            target_store_id: expected_store_id,
            snapshot,
        };

        self.verify_store_id(&session).await?;
        let outcome = self.copy_store(&session).await?;
        self.pull_transactions(&session, outcome.last_flushed_tx_id)
            .await?;

        self.machines.install_snapshot(&session.snapshot).await?;
        self.log
            .skip(session.snapshot.prev_index(), session.snapshot.prev_term());

        tracing::info!("Restarting local database");
        self.database.start().await
    }

    async fn fetch_snapshot(&self, address: &str) -> Result<CoreSnapshot> {
        let snapshot = timeout(
            self.config.snapshot_timeout(),
            self.client.get_core_snapshot(address, &self.local),
        )
        .await
        .map_err(|_| Error::ConnectionTimeout(address.to_string()))??;
        tracing::info!("Fetched {} from {}", snapshot, address);
        Ok(snapshot)
    }

    async fn verify_store_id(&self, session: &DownloadSession) -> Result<()> {
        let actual = self.client.get_store_id(&session.source_address).await?;
        if actual != session.target_store_id {
            return Err(Error::StoreIdMismatch {
                expected: session.target_store_id,
                actual,
            });
        }
        Ok(())
    }

    /// Copy into a staging directory, then swap it in for the store
    async fn copy_store(&self, session: &DownloadSession) -> Result<StoreCopyOutcome> {
        let store_dir = self.database.store_dir();
        let staging = staging_dir(&store_dir);
        remove_dir_if_exists(&staging).await?;

        let copied = self
            .client
            .copy_store(&session.source_address, session.target_store_id, &staging)
            .await;
        let outcome = match copied {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_exists(&staging).await {
                    tracing::warn!("Failed to clean up {}: {}", staging.display(), cleanup);
                }
                return Err(e);
            }
        };
        tracing::info!(
            "Copied {} files ({} bytes) up to transaction {}",
            outcome.files,
            outcome.bytes,
            outcome.last_flushed_tx_id
        );

        remove_dir_if_exists(&store_dir).await?;
        tokio::fs::rename(&staging, &store_dir).await?;
        Ok(outcome)
    }

    async fn pull_transactions(&self, session: &DownloadSession, last_flushed: u64) -> Result<()> {
        let from_tx_id = last_flushed.checked_add(1).ok_or_else(|| {
            Error::Internal(format!(
                "Upstream reported impossible last flushed transaction {}",
                last_flushed
            ))
        })?;
        let mut transactions = self
            .client
            .pull_transactions(&session.source_address, session.target_store_id, from_tx_id)
            .await?;

        let batch_size = self.config.tx_pull_batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut pulled = 0usize;
        while let Some(tx) = transactions.try_next().await? {
            batch.push(tx);
            if batch.len() == batch_size {
                pulled += batch.len();
                self.database
                    .append_transactions(std::mem::take(&mut batch))
                    .await?;
            }
        }
        if !batch.is_empty() {
            pulled += batch.len();
            self.database.append_transactions(batch).await?;
        }

        tracing::info!("Pulled {} transactions after {}", pulled, last_flushed);
        Ok(())
    }
}

/// Sibling of `store_dir` used while a copy is in flight
fn staging_dir(store_dir: &Path) -> PathBuf {
    let mut name = store_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "store".into());
    name.push(".staging");
    store_dir.with_file_name(name)
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchup::TransactionStream;
    use crate::log::{InMemoryRaftLog, LogEntry, LogPosition};
    use crate::replication::{handle_append_entries, LeaderContext, LogShipper, ReplicationConfig};
    use futures::StreamExt;
    use crate::snapshot::{CoreStateMachine, CoreStateType, SnapshotPayload};
    use crate::topology::{MemberInfo, StaticTopology};
    use crate::upstream::UpstreamStrategy;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeDatabase {
        store_dir: PathBuf,
        events: StdMutex<Vec<String>>,
        appended: StdMutex<Vec<CommittedTransaction>>,
    }

    impl FakeDatabase {
        fn new(store_dir: PathBuf) -> Self {
            Self {
                store_dir,
                events: StdMutex::new(Vec::new()),
                appended: StdMutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    #[async_trait]
    impl LocalDatabase for FakeDatabase {
        fn store_dir(&self) -> PathBuf {
            self.store_dir.clone()
        }

        async fn stop_for_store_copy(&self) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.record("start");
            Ok(())
        }

        async fn append_transactions(&self, transactions: Vec<CommittedTransaction>) -> Result<()> {
            self.record(&format!("append:{}", transactions.len()));
            self.appended.lock().unwrap().extend(transactions);
            Ok(())
        }

        async fn panic(&self, _cause: &Error) {
            self.record("panic");
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        None,
        HangOnSnapshot,
        FailMidCopy,
        ExhaustedTxIds,
    }

    struct FakeClient {
        store_id: StoreId,
        snapshot: CoreSnapshot,
        files: Vec<(&'static str, &'static [u8])>,
        transactions: Vec<CommittedTransaction>,
        last_flushed_tx_id: u64,
        fault: Fault,
        requested_from: StdMutex<Option<u64>>,
    }

    #[async_trait]
    impl CatchupClient for FakeClient {
        async fn get_core_snapshot(
            &self,
            _address: &str,
            _requester: &MemberId,
        ) -> Result<CoreSnapshot> {
            if self.fault == Fault::HangOnSnapshot {
                std::future::pending::<()>().await;
            }
            Ok(self.snapshot.clone())
        }

        async fn get_store_id(&self, _address: &str) -> Result<StoreId> {
            Ok(self.store_id)
        }

        async fn copy_store(
            &self,
            _address: &str,
            _expected_store_id: StoreId,
            destination: &Path,
        ) -> Result<StoreCopyOutcome> {
            tokio::fs::create_dir_all(destination).await?;
            let mut outcome = StoreCopyOutcome::default();
            for (name, data) in &self.files {
                tokio::fs::write(destination.join(name), data).await?;
                outcome.files += 1;
                outcome.bytes += data.len() as u64;
                if self.fault == Fault::FailMidCopy {
                    return Err(Error::Network("connection reset".into()));
                }
            }
            outcome.last_flushed_tx_id = if self.fault == Fault::ExhaustedTxIds {
                u64::MAX
            } else {
                self.last_flushed_tx_id
            };
            Ok(outcome)
        }

        async fn pull_transactions(
            &self,
            _address: &str,
            _store_id: StoreId,
            from_tx_id: u64,
        ) -> Result<TransactionStream> {
            *self.requested_from.lock().unwrap() = Some(from_tx_id);
            let tail: Vec<Result<CommittedTransaction>> = self
                .transactions
                .iter()
                .filter(|tx| tx.tx_id >= from_tx_id)
                .cloned()
                .map(Ok)
                .collect();
            Ok(futures::stream::iter(tail).boxed())
        }
    }

    struct Register(Vec<u8>);

    impl CoreStateMachine for Register {
        fn state_type(&self) -> CoreStateType {
            CoreStateType::IdAllocation
        }

        fn snapshot(&self) -> Result<SnapshotPayload> {
            Ok(SnapshotPayload::new(1, self.0.clone()))
        }

        fn install(&mut self, payload: &SnapshotPayload) -> Result<()> {
            self.0 = payload.data.to_vec();
            Ok(())
        }

        fn apply_command(&mut self, _index: i64, command: &[u8]) -> Result<()> {
            self.0 = command.to_vec();
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store_dir: PathBuf,
        database: Arc<FakeDatabase>,
        machines: Arc<CoreStateMachines>,
        log: Arc<InMemoryRaftLog>,
        client: Arc<FakeClient>,
        downloader: Arc<StateDownloader>,
        store_id: StoreId,
    }

    fn harness(fault: Fault, remote_store_id: Option<StoreId>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        std::fs::create_dir_all(&store_dir).unwrap();
        std::fs::write(store_dir.join("old.db"), b"old epoch").unwrap();

        let store_id = StoreId::generate();
        let database = Arc::new(FakeDatabase::new(store_dir.clone()));
        let machines = Arc::new(
            CoreStateMachines::new(vec![
                Box::new(Register(b"local".to_vec())) as Box<dyn CoreStateMachine>
            ])
            .unwrap(),
        );
        let client = Arc::new(FakeClient {
            store_id: remote_store_id.unwrap_or(store_id),
            snapshot: CoreSnapshot::new(99, 4).with(
                CoreStateType::IdAllocation,
                SnapshotPayload::new(1, b"remote".to_vec()),
            ),
            files: vec![("neostore.db", &b"new epoch"[..]), ("counts.db", &b"42"[..])],
            transactions: (5..=11)
                .map(|id| CommittedTransaction::new(id, format!("tx-{}", id).into_bytes()))
                .collect(),
            last_flushed_tx_id: 6,
            fault,
            requested_from: StdMutex::new(None),
        });
        let topology = Arc::new(StaticTopology::new(
            MemberId::new("rr-1"),
            vec![
                MemberInfo::core("core-1", "10.0.0.1:6000"),
                MemberInfo::read_replica("rr-1", "10.0.1.1:6000"),
            ],
        ));
        let config = CatchupConfig {
            snapshot_timeout_ms: 100,
            tx_pull_batch_size: 2,
            ..CatchupConfig::default()
        };
        let log = Arc::new(InMemoryRaftLog::new());
        let downloader = Arc::new(StateDownloader::new(
            MemberId::new("rr-1"),
            database.clone(),
            machines.clone(),
            log.clone(),
            topology,
            client.clone(),
            config,
        ));

        Harness {
            _dir: dir,
            store_dir,
            database,
            machines,
            log,
            client,
            downloader,
            store_id,
        }
    }

    #[tokio::test]
    async fn test_successful_download() {
        let h = harness(Fault::None, None);

        h.downloader
            .download_snapshot(&MemberId::new("core-1"), h.store_id)
            .await
            .unwrap();

        assert_eq!(
            h.database.events(),
            vec!["stop", "append:2", "append:2", "append:1", "start"]
        );
        assert_eq!(*h.client.requested_from.lock().unwrap(), Some(7));
        let appended: Vec<u64> = h
            .database
            .appended
            .lock()
            .unwrap()
            .iter()
            .map(|tx| tx.tx_id)
            .collect();
        assert_eq!(appended, vec![7, 8, 9, 10, 11]);
        assert_eq!(std::fs::read(h.store_dir.join("neostore.db")).unwrap(), b"new epoch");
        assert!(!h.store_dir.join("old.db").exists());
        assert!(!staging_dir(&h.store_dir).exists());
        assert_eq!(h.machines.applied_position().await, LogPosition::new(99, 4));
        assert_eq!(h.log.prev_index(), 99);
        assert_eq!(h.log.term_at(99), Some(4));
        let installed = h.machines.snapshot().await.unwrap();
        assert_eq!(
            installed.get(CoreStateType::IdAllocation).unwrap().data.as_ref(),
            b"remote"
        );
    }

    #[tokio::test]
    async fn test_store_id_mismatch_panics_and_keeps_old_state() {
        let h = harness(Fault::None, Some(StoreId::generate()));

        let result = h
            .downloader
            .download_snapshot(&MemberId::new("core-1"), h.store_id)
            .await;

        assert!(matches!(result, Err(Error::StoreCopyFailed { .. })));
        assert_eq!(h.database.events(), vec!["stop", "panic"]);
        assert!(h.store_dir.join("old.db").exists());
        assert_eq!(h.machines.applied_position().await, LogPosition::BASE);
    }

    #[tokio::test]
    async fn test_failed_copy_never_installs_snapshot() {
        let h = harness(Fault::FailMidCopy, None);

        let result = h
            .downloader
            .download_snapshot(&MemberId::new("core-1"), h.store_id)
            .await;

        match result {
            Err(Error::StoreCopyFailed {
                source_member,
                reason,
            }) => {
                assert_eq!(source_member, MemberId::new("core-1"));
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.database.events(), vec!["stop", "panic"]);
        assert_eq!(std::fs::read(h.store_dir.join("old.db")).unwrap(), b"old epoch");
        assert!(!staging_dir(&h.store_dir).exists());
        assert_eq!(h.machines.applied_position().await, LogPosition::BASE);
        assert!(h.database.appended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_transaction_ids_fail_download() {
        let h = harness(Fault::ExhaustedTxIds, None);

        let result = h
            .downloader
            .download_snapshot(&MemberId::new("core-1"), h.store_id)
            .await;

        assert!(matches!(result, Err(Error::StoreCopyFailed { .. })));
        assert_eq!(h.database.events(), vec!["stop", "panic"]);
        assert!(h.client.requested_from.lock().unwrap().is_none());
        assert_eq!(h.log.prev_index(), -1);
    }

    #[tokio::test]
    async fn test_log_shipping_resumes_after_download() {
        let h = harness(Fault::None, None);
        h.downloader
            .download_snapshot(&MemberId::new("core-1"), h.store_id)
            .await
            .unwrap();

        // the leader kept 97..=101; the snapshot covers up to 99
        let leader_log = Arc::new(InMemoryRaftLog::new());
        leader_log
            .append_all((0..=101).map(|i: i64| LogEntry::new(4, i.to_be_bytes().to_vec())))
            .unwrap();
        leader_log.prune(97);
        let mut shipper = LogShipper::new(
            MemberId::new("core-1"),
            MemberId::new("rr-1"),
            leader_log.clone(),
            ReplicationConfig::default(),
            LeaderContext::new(4, 101),
        );

        let mut next = shipper.start();
        let mut rounds = 0;
        while let Some(msg) = next {
            assert!(!msg.is_compaction_info(), "unexpected {:?}", msg);
            let response =
                handle_append_entries(&h.log, &MemberId::new("rr-1"), 4, &msg).unwrap();
            next = if response.success {
                shipper.on_match(response.match_index)
            } else {
                shipper.on_mismatch(response.append_index)
            };
            rounds += 1;
            assert!(rounds < 20);
        }

        assert_eq!(shipper.match_index(), 101);
        assert_eq!(h.log.append_index(), 101);
        assert_eq!(h.log.read_entry(101), leader_log.read_entry(101));
    }

    #[tokio::test]
    async fn test_snapshot_fetch_times_out() {
        let h = harness(Fault::HangOnSnapshot, None);

        let result = h
            .downloader
            .download_snapshot(&MemberId::new("core-1"), h.store_id)
            .await;

        assert!(matches!(result, Err(Error::StoreCopyFailed { .. })));
        assert_eq!(h.database.events(), vec!["stop", "panic"]);
    }

    #[tokio::test]
    async fn test_unknown_source_fails_before_stopping() {
        let h = harness(Fault::None, None);

        let result = h
            .downloader
            .download_snapshot(&MemberId::new("core-9"), h.store_id)
            .await;

        assert!(matches!(result, Err(Error::StoreCopyFailed { .. })));
        assert_eq!(h.database.events(), vec!["panic"]);
    }

    #[tokio::test]
    async fn test_concurrent_download_rejected() {
        let h = harness(Fault::HangOnSnapshot, None);
        let first = {
            let downloader = h.downloader.clone();
            let store_id = h.store_id;
            tokio::spawn(async move {
                downloader
                    .download_snapshot(&MemberId::new("core-1"), store_id)
                    .await
            })
        };

        for _ in 0..50 {
            if h.downloader.is_downloading() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let second = h
            .downloader
            .download_snapshot(&MemberId::new("core-1"), h.store_id)
            .await;
        assert!(matches!(second, Err(Error::DownloadInProgress)));

        assert!(first.await.unwrap().is_err());
        assert_eq!(
            h.database.events().iter().filter(|e| *e == "stop").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_download_from_best_upstream() {
        struct Fixed;

        #[async_trait]
        impl UpstreamStrategy for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }

            async fn select_upstream(&self) -> Result<Option<MemberId>> {
                Ok(Some(MemberId::new("core-1")))
            }
        }

        let h = harness(Fault::None, None);
        let selector = UpstreamSelector::new(
            vec![Box::new(Fixed) as Box<dyn UpstreamStrategy>],
            Duration::from_secs(1),
        );

        let source = h
            .downloader
            .download_from_best_upstream(&selector, h.store_id)
            .await
            .unwrap();
        assert_eq!(source, MemberId::new("core-1"));
        assert_eq!(h.database.events().last().map(String::as_str), Some("start"));
    }

    #[test]
    fn test_staging_dir_is_sibling() {
        assert_eq!(
            staging_dir(Path::new("/data/store")),
            PathBuf::from("/data/store.staging")
        );
    }
}
