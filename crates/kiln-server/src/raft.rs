//! Raft integration: the replicated-log type config, the state
//! machine that re-dispatches committed commands, and a file-backed
//! stable store for vote persistence.
//!
//! The consensus algorithm itself is openraft's; this module supplies
//! the adapter around it. `apply` hands each
//! committed entry's RESP bytes back to the dispatcher on the Apply
//! path (so the AOF is still written on every node), FSM snapshots
//! wrap a deep keyspace copy in the snapshot record format, and the
//! network factory is the seam a real transport plugs into — peers
//! are unreachable until one is provided, which is sufficient for a
//! bootstrapped single-node cluster.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use openraft::storage::{Adaptor, LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, RaftTypeConfig,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// A serialized RESP command proposed to the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppCommand(pub Vec<u8>);

/// The serialized RESP reply the apply produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppResponse(pub Vec<u8>);

/// Type configuration for openraft.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = AppCommand;
    type R = AppResponse;
    type Node = BasicNode;
    type NodeId = u64;
    type Entry = Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

pub type KilnRaft = openraft::Raft<TypeConfig>;

/// The seam between the raft state machine and the command pipeline.
/// The dispatcher implements this; the storage only sees the trait.
pub trait CommandApplier: Send + Sync + 'static {
    /// Executes one committed command and returns the serialized reply.
    fn apply<'a>(&'a self, cmd: Bytes) -> Pin<Box<dyn std::future::Future<Output = Bytes> + Send + 'a>>;

    /// Serializes the full keyspace state for an FSM snapshot.
    fn snapshot_state<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>, String>> + Send + 'a>>;

    /// Replaces the keyspace state from an FSM snapshot.
    fn restore_state<'a>(
        &'a self,
        data: Vec<u8>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>>;
}

/// The serialized form of an FSM snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FsmSnapshot {
    last_applied: Option<LogId<u64>>,
    last_membership: StoredMembership<u64, BasicNode>,
    state_data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

/// A simple key-value file in the data directory for raft's durable
/// odds and ends (currently the vote). Every set rewrites the file.
pub struct StableStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl StableStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let path = path.into();
        let map = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: String) -> Result<(), std::io::Error> {
        let snapshot = {
            let mut map = self.map.lock();
            map.insert(key.to_string(), value);
            map.clone()
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string(&snapshot)?;
        std::fs::write(&self.path, encoded)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<(), std::io::Error> {
        self.set(key, value.to_string())
    }
}

/// Combined log and state-machine storage.
///
/// The log lives in memory (compacted by snapshots); the vote is
/// persisted through the stable store; applied commands run through
/// the injected [`CommandApplier`].
pub struct Storage {
    vote: RwLock<Option<Vote<u64>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    last_purged: RwLock<Option<LogId<u64>>>,
    last_applied: RwLock<Option<LogId<u64>>>,
    last_membership: RwLock<StoredMembership<u64, BasicNode>>,
    snapshot: RwLock<Option<StoredSnapshot>>,
    applier: Arc<dyn CommandApplier>,
    stable: StableStore,
}

const VOTE_KEY: &str = "raft_vote";

impl Storage {
    pub fn new(applier: Arc<dyn CommandApplier>, stable: StableStore) -> Self {
        let vote = stable
            .get(VOTE_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok());
        Self {
            vote: RwLock::new(vote),
            log: RwLock::new(BTreeMap::new()),
            last_purged: RwLock::new(None),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot: RwLock::new(None),
            applier,
            stable,
        }
    }
}

impl RaftLogReader<TypeConfig> for Arc<Storage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, v)| v.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<Storage> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();

        let state_data = self.applier.snapshot_state().await.map_err(|e| {
            StorageIOError::write_snapshot(None, &std::io::Error::other(e))
        })?;

        let snapshot = FsmSnapshot {
            last_applied,
            last_membership: membership.clone(),
            state_data,
        };
        let data = serde_json::to_vec(&snapshot)
            .map_err(|e| StorageIOError::write_snapshot(None, &e))?;

        let snapshot_id = last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "0-0".to_string());

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Arc<Storage> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let log = self.log.read().await;
        let last = log.iter().next_back().map(|(_, e)| e.log_id);
        let purged = *self.last_purged.read().await;

        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        let encoded = serde_json::to_string(vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        self.stable
            .set(VOTE_KEY, encoded)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Arc::clone(self)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        let to_remove: Vec<_> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in to_remove {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        let to_remove: Vec<_> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in to_remove {
            log.remove(&key);
        }
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<AppResponse>, StorageError<u64>> {
        let mut results = Vec::new();

        for entry in entries {
            *self.last_applied.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => {
                    results.push(AppResponse(Vec::new()));
                }
                EntryPayload::Normal(AppCommand(bytes)) => {
                    let reply = self.applier.apply(Bytes::from(bytes.clone())).await;
                    results.push(AppResponse(reply.to_vec()));
                }
                EntryPayload::Membership(m) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), m.clone());
                    results.push(AppResponse(Vec::new()));
                }
            }
        }

        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let snap: FsmSnapshot = serde_json::from_slice(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        *self.last_applied.write().await = snap.last_applied;
        *self.last_membership.write().await = snap.last_membership;

        self.applier
            .restore_state(snap.state_data)
            .await
            .map_err(|e| {
                StorageIOError::read_snapshot(
                    Some(meta.signature()),
                    &std::io::Error::other(e),
                )
            })?;

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let snap = self.snapshot.read().await;
        Ok(snap.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

/// The transport seam. Peers are unreachable until a real transport is
/// wired in; a single-node bootstrapped cluster never dials out.
pub struct UnconnectedNetworkFactory;

pub struct UnconnectedNetwork;

impl openraft::RaftNetworkFactory<TypeConfig> for UnconnectedNetworkFactory {
    type Network = UnconnectedNetwork;

    async fn new_client(&mut self, _target: u64, _node: &BasicNode) -> Self::Network {
        UnconnectedNetwork
    }
}

fn unreachable_err() -> openraft::error::Unreachable {
    openraft::error::Unreachable::new(&std::io::Error::other(
        "no raft transport configured for this peer",
    ))
}

impl openraft::RaftNetwork<TypeConfig> for UnconnectedNetwork {
    async fn append_entries(
        &mut self,
        _rpc: openraft::raft::AppendEntriesRequest<TypeConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<
        openraft::raft::AppendEntriesResponse<u64>,
        openraft::error::RPCError<u64, BasicNode, openraft::error::RaftError<u64>>,
    > {
        Err(openraft::error::RPCError::Unreachable(unreachable_err()))
    }

    async fn install_snapshot(
        &mut self,
        _rpc: openraft::raft::InstallSnapshotRequest<TypeConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<
        openraft::raft::InstallSnapshotResponse<u64>,
        openraft::error::RPCError<
            u64,
            BasicNode,
            openraft::error::RaftError<u64, openraft::error::InstallSnapshotError>,
        >,
    > {
        Err(openraft::error::RPCError::Unreachable(unreachable_err()))
    }

    async fn vote(
        &mut self,
        _rpc: openraft::raft::VoteRequest<u64>,
        _option: openraft::network::RPCOption,
    ) -> Result<
        openraft::raft::VoteResponse<u64>,
        openraft::error::RPCError<u64, BasicNode, openraft::error::RaftError<u64>>,
    > {
        Err(openraft::error::RPCError::Unreachable(unreachable_err()))
    }
}

/// Builds and (optionally) bootstraps the raft instance for this node.
pub async fn start(
    node_id: u64,
    raft_addr: String,
    applier: Arc<dyn CommandApplier>,
    stable: StableStore,
    bootstrap: bool,
) -> Result<KilnRaft, Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(openraft::Config::default().validate()?);
    let storage = Arc::new(Storage::new(applier, stable));
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = openraft::Raft::new(
        node_id,
        config,
        UnconnectedNetworkFactory,
        log_store,
        state_machine,
    )
    .await?;

    if bootstrap {
        let mut nodes = BTreeMap::new();
        nodes.insert(node_id, BasicNode::new(raft_addr));
        // initializing an already-initialized cluster is fine on restart
        if let Err(e) = raft.initialize(nodes).await {
            info!("cluster already initialized: {e}");
        }
    }

    Ok(raft)
}
