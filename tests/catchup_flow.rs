//! End-to-end catch-up over TCP: a read replica downloads core state, store
//! files and trailing transactions from a core member.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;

use wolfcore::catchup::{CatchupClient, CommittedTransaction};
use wolfcore::config::CatchupConfig;
use wolfcore::log::{LogIndex, LogPosition};
use wolfcore::prelude::*;
use wolfcore::snapshot::SnapshotPayload;

/// Upstream side: a store directory plus a retained transaction window
struct UpstreamStore {
    store_id: StoreId,
    dir: PathBuf,
    machines: Arc<CoreStateMachines>,
    last_flushed: u64,
    first_retained: u64,
    transactions: Vec<CommittedTransaction>,
}

#[async_trait]
impl CatchupSource for UpstreamStore {
    async fn core_snapshot(&self) -> Result<CoreSnapshot> {
        self.machines.snapshot().await
    }

    async fn store_id(&self) -> Result<StoreId> {
        Ok(self.store_id)
    }

    fn store_dir(&self) -> PathBuf {
        self.dir.clone()
    }

    async fn last_flushed_tx_id(&self) -> Result<u64> {
        Ok(self.last_flushed)
    }

    async fn read_transactions(
        &self,
        from_tx_id: u64,
        limit: usize,
    ) -> Result<Option<Vec<CommittedTransaction>>> {
        if from_tx_id < self.first_retained {
            return Ok(None);
        }
        Ok(Some(
            self.transactions
                .iter()
                .filter(|tx| tx.tx_id >= from_tx_id)
                .take(limit)
                .cloned()
                .collect(),
        ))
    }
}

/// Downstream side: records what the downloader did to it
struct ReplicaDatabase {
    dir: PathBuf,
    events: Mutex<Vec<String>>,
    appended: Mutex<Vec<CommittedTransaction>>,
}

impl ReplicaDatabase {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalDatabase for ReplicaDatabase {
    fn store_dir(&self) -> PathBuf {
        self.dir.clone()
    }

    async fn stop_for_store_copy(&self) -> Result<()> {
        self.events.lock().unwrap().push("stop".into());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.events.lock().unwrap().push("start".into());
        Ok(())
    }

    async fn append_transactions(&self, transactions: Vec<CommittedTransaction>) -> Result<()> {
        self.appended.lock().unwrap().extend(transactions);
        Ok(())
    }

    async fn panic(&self, cause: &Error) {
        self.events.lock().unwrap().push(format!("panic: {}", cause));
    }
}

/// Remembers the last command
struct LastValue {
    state_type: CoreStateType,
    value: Vec<u8>,
}

impl CoreStateMachine for LastValue {
    fn state_type(&self) -> CoreStateType {
        self.state_type
    }

    fn snapshot(&self) -> Result<SnapshotPayload> {
        Ok(SnapshotPayload::new(1, self.value.clone()))
    }

    fn install(&mut self, payload: &SnapshotPayload) -> Result<()> {
        self.value = payload.data.to_vec();
        Ok(())
    }

    fn apply_command(&mut self, _index: LogIndex, command: &[u8]) -> Result<()> {
        self.value = command.to_vec();
        Ok(())
    }
}

fn core_machines() -> Arc<CoreStateMachines> {
    let machines: Vec<Box<dyn CoreStateMachine>> = vec![
        Box::new(LastValue {
            state_type: CoreStateType::LockToken,
            value: Vec::new(),
        }),
        Box::new(LastValue {
            state_type: CoreStateType::IdAllocation,
            value: Vec::new(),
        }),
    ];
    Arc::new(CoreStateMachines::new(machines).unwrap())
}

struct Cluster {
    _upstream_dir: tempfile::TempDir,
    _replica_dir: tempfile::TempDir,
    server: Arc<CatchupServer>,
    address: String,
    store_id: StoreId,
    replica: Arc<ReplicaDatabase>,
    replica_machines: Arc<CoreStateMachines>,
    replica_log: Arc<InMemoryRaftLog>,
    downloader: StateDownloader,
}

async fn cluster(first_retained: u64) -> Cluster {
    let upstream_dir = tempfile::tempdir().unwrap();
    std::fs::write(upstream_dir.path().join("neostore.db"), vec![7u8; 300_000]).unwrap();
    std::fs::create_dir_all(upstream_dir.path().join("schema")).unwrap();
    std::fs::write(upstream_dir.path().join("schema/labels.db"), b"labels").unwrap();
    std::fs::write(upstream_dir.path().join("empty.db"), b"").unwrap();

    let upstream_machines = core_machines();
    upstream_machines
        .apply(10, 2, CoreStateType::LockToken, b"token-3")
        .await
        .unwrap();
    upstream_machines
        .apply(11, 2, CoreStateType::IdAllocation, b"ids-900")
        .await
        .unwrap();

    let store_id = StoreId::generate();
    let source = Arc::new(UpstreamStore {
        store_id,
        dir: upstream_dir.path().to_path_buf(),
        machines: upstream_machines,
        last_flushed: 20,
        first_retained,
        transactions: (15..=25)
            .map(|id| CommittedTransaction::new(id, format!("tx-{}", id).into_bytes()))
            .collect(),
    });

    let config = CatchupConfig {
        file_chunk_size: 64 * 1024,
        tx_pull_batch_size: 2,
        ..CatchupConfig::default()
    };
    let server = Arc::new(
        CatchupServer::bind("127.0.0.1:0", source, config.clone())
            .await
            .unwrap(),
    );
    let address = server.local_addr().unwrap().to_string();
    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    let replica_dir = tempfile::tempdir().unwrap();
    let store_dir = replica_dir.path().join("store");
    std::fs::create_dir_all(&store_dir).unwrap();
    std::fs::write(store_dir.join("stale.db"), b"stale").unwrap();

    let replica = Arc::new(ReplicaDatabase {
        dir: store_dir,
        events: Mutex::new(Vec::new()),
        appended: Mutex::new(Vec::new()),
    });
    let replica_machines = core_machines();
    let replica_log = Arc::new(InMemoryRaftLog::new());
    let topology = Arc::new(StaticTopology::new(
        MemberId::new("rr-1"),
        vec![
            MemberInfo::core("core-1", address.clone()),
            MemberInfo::read_replica("rr-1", "127.0.0.1:1"),
        ],
    ));
    let client = Arc::new(TcpCatchupClient::new(
        Duration::from_secs(2),
        Duration::from_secs(5),
    ));
    let downloader = StateDownloader::new(
        MemberId::new("rr-1"),
        replica.clone(),
        replica_machines.clone(),
        replica_log.clone(),
        topology,
        client,
        config,
    );

    Cluster {
        _upstream_dir: upstream_dir,
        _replica_dir: replica_dir,
        server,
        address,
        store_id,
        replica,
        replica_machines,
        replica_log,
        downloader,
    }
}

#[tokio::test]
async fn test_download_over_tcp() {
    let c = cluster(10).await;

    c.downloader
        .download_snapshot(&MemberId::new("core-1"), c.store_id)
        .await
        .unwrap();

    assert_eq!(c.replica.events(), vec!["stop", "start"]);

    let store = c.replica.store_dir();
    assert_eq!(std::fs::read(store.join("neostore.db")).unwrap(), vec![7u8; 300_000]);
    assert_eq!(std::fs::read(store.join("schema/labels.db")).unwrap(), b"labels");
    assert!(std::fs::read(store.join("empty.db")).unwrap().is_empty());
    assert!(!store.join("stale.db").exists());

    let appended: Vec<u64> = c
        .replica
        .appended
        .lock()
        .unwrap()
        .iter()
        .map(|tx| tx.tx_id)
        .collect();
    assert_eq!(appended, vec![21, 22, 23, 24, 25]);

    assert_eq!(
        c.replica_machines.applied_position().await,
        LogPosition::new(11, 2)
    );
    assert_eq!(c.replica_log.prev_index(), 11);
    let installed = c.replica_machines.snapshot().await.unwrap();
    assert_eq!(
        installed.get(CoreStateType::IdAllocation).unwrap().data.as_ref(),
        b"ids-900"
    );

    c.server.stop();
}

#[tokio::test]
async fn test_mismatched_store_panics_replica() {
    let c = cluster(10).await;

    let result = c
        .downloader
        .download_snapshot(&MemberId::new("core-1"), StoreId::generate())
        .await;

    assert!(matches!(result, Err(Error::StoreCopyFailed { .. })));
    let events = c.replica.events();
    assert_eq!(events.len(), 2);
    assert!(events[1].starts_with("panic"));
    assert!(c.replica.store_dir().join("stale.db").exists());
    assert_eq!(
        c.replica_machines.applied_position().await,
        LogPosition::BASE
    );
    assert_eq!(c.replica_log.prev_index(), -1);

    c.server.stop();
}

#[tokio::test]
async fn test_pruned_transactions_fail_download() {
    // the copy covers up to 20 but the upstream only keeps 22 onwards
    let c = cluster(22).await;

    let result = c
        .downloader
        .download_snapshot(&MemberId::new("core-1"), c.store_id)
        .await;

    match result {
        Err(Error::StoreCopyFailed { reason, .. }) => assert!(reason.contains("pruned")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        c.replica_machines.applied_position().await,
        LogPosition::BASE
    );

    c.server.stop();
}

#[tokio::test]
async fn test_client_requests() {
    let c = cluster(10).await;
    let client = TcpCatchupClient::new(Duration::from_secs(2), Duration::from_secs(5));

    assert_eq!(client.get_store_id(&c.address).await.unwrap(), c.store_id);

    let snapshot = client
        .get_core_snapshot(&c.address, &MemberId::new("rr-1"))
        .await
        .unwrap();
    assert_eq!(snapshot.size(), 2);
    assert_eq!(snapshot.prev_index(), 11);

    let transactions: Vec<CommittedTransaction> = client
        .pull_transactions(&c.address, c.store_id, 24)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(transactions.len(), 2);

    let caught_up: Vec<CommittedTransaction> = client
        .pull_transactions(&c.address, c.store_id, 26)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(caught_up.is_empty());

    c.server.stop();
}
