//! The command dispatch pipeline.
//!
//! One request flows through: token extraction → registry lookup →
//! subcommand resolution → key extraction → ACL authorization → the
//! replication decision (direct invoke, raft submit, or forward to
//! the leader) → handler → AOF append for writes → reply.
//!
//! The pipeline runs in one of three modes instead of carrying a
//! replay boolean: `Client` (full pipeline), `Apply` (the raft-apply
//! path: no ACL, no re-submit, AOF still appended so every node owns
//! its log), and `Replay` (AOF restore: execute only).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{error, warn};

use kiln_core::keyspace::{Keyspace, OpContext};
use kiln_protocol::{encode_command, Frame};
use kiln_persistence::{AofEngine, SnapshotEngine};

use crate::acl::Acl;
use crate::connection::ConnHandle;
use crate::error::CommandError;
use crate::pubsub::PubSubManager;
use crate::registry::Registry;
use crate::replication::ReplicationLayer;

/// Lock-acquisition budget for commands touching more than one key.
/// Bounds how long a multi-key write (MSET, SINTERSTORE, ...) can wait
/// on contended locks before failing with a timeout.
const MULTI_KEY_LOCK_BUDGET: Duration = Duration::from_millis(200);

static STANDALONE: ReplicationLayer = ReplicationLayer::Standalone;

/// Which pipeline variant a dispatch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// A live client request: authorize, maybe replicate, append to
    /// the AOF, reply.
    Client,
    /// The raft FSM applying a committed entry: execute the handler
    /// and append to this node's AOF.
    Apply,
    /// AOF replay at startup: execute only, never re-append.
    Replay,
}

/// Everything the dispatch pipeline needs, shared across connections.
pub struct ServerState {
    pub keyspace: Keyspace,
    pub acl: Acl,
    pub pubsub: PubSubManager,
    pub registry: Registry,
    pub aof: Option<AofEngine>,
    pub snapshots: Option<SnapshotEngine>,
    pub in_cluster: bool,
    pub forward_commands: bool,
    /// Set once after construction when running in cluster mode; the
    /// raft layer needs a dispatcher, which needs this state.
    replication: OnceLock<ReplicationLayer>,
}

impl ServerState {
    pub fn new(
        keyspace: Keyspace,
        acl: Acl,
        aof: Option<AofEngine>,
        snapshots: Option<SnapshotEngine>,
        in_cluster: bool,
        forward_commands: bool,
    ) -> Self {
        Self {
            keyspace,
            acl,
            pubsub: PubSubManager::new(),
            registry: Registry::standard(),
            aof,
            snapshots,
            in_cluster,
            forward_commands,
            replication: OnceLock::new(),
        }
    }

    /// The active replication layer; standalone pass-through until a
    /// raft layer is installed.
    pub fn replication(&self) -> &ReplicationLayer {
        self.replication.get().unwrap_or(&STANDALONE)
    }

    /// Installs the raft replication layer. May be called once.
    pub fn set_replication(&self, layer: ReplicationLayer) {
        if self.replication.set(layer).is_err() {
            warn!("replication layer was already installed");
        }
    }
}

/// The dispatcher: a cheap handle over the shared server state.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<ServerState>,
}

impl Dispatcher {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.state.keyspace
    }

    /// Runs one command through the pipeline and returns the reply
    /// frame. Errors never escape — they become RESP error replies.
    pub async fn dispatch(
        &self,
        tokens: &[Bytes],
        mode: DispatchMode,
        conn: Option<&ConnHandle>,
    ) -> Frame {
        match self.dispatch_inner(tokens, mode, conn).await {
            Ok(frame) => frame,
            Err(e) => e.to_frame(),
        }
    }

    async fn dispatch_inner(
        &self,
        tokens: &[Bytes],
        mode: DispatchMode,
        conn: Option<&ConnHandle>,
    ) -> Result<Frame, CommandError> {
        let Some(first) = tokens.first() else {
            return Err(CommandError::Protocol("empty command".into()));
        };
        let name = std::str::from_utf8(first)
            .map_err(|_| CommandError::Protocol("command name is not valid utf-8".into()))?
            .to_ascii_uppercase();

        let spec = self
            .state
            .registry
            .get(&name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_lowercase()))?;
        let resolved = spec.resolve(tokens);

        let keys = (resolved.key_extraction)(tokens)?;

        // AUTH bypasses authorization entirely; replay/apply dispatches
        // carry no connection and are pre-authorized by definition
        if mode == DispatchMode::Client && name != "AUTH" {
            if let Some(conn) = conn {
                self.state.acl.authorize(
                    conn.id,
                    &name,
                    &resolved.category_names(),
                    &keys.read_keys,
                    &keys.write_keys,
                    &keys.channels,
                )?;
            }
        }

        let is_write = resolved.is_write();

        // synced writes in cluster mode are ordered through the raft
        // log; only the leader truly applies
        if mode == DispatchMode::Client && is_write && resolved.sync && self.state.in_cluster {
            let replication = self.state.replication();
            let mut buf = BytesMut::new();
            encode_command(tokens, &mut buf);
            if replication.is_leader() {
                return replication.submit(buf.freeze()).await;
            }
            if self.state.forward_commands {
                return crate::replication::forward_to_leader(replication, buf.freeze()).await;
            }
            return Err(CommandError::NotLeader);
        }

        let mut ctx = match conn {
            Some(conn) => OpContext::with_token(conn.cancel.clone()),
            None => OpContext::new(),
        };
        if keys.key_count() > 1 {
            ctx = ctx.with_budget(MULTI_KEY_LOCK_BUDGET);
        }

        let reply = (resolved.handler)(crate::registry::HandlerInput {
            ctx: &ctx,
            tokens,
            server: &self.state,
            conn,
        })
        .await?;

        if is_write && mode != DispatchMode::Replay {
            if let Some(aof) = &self.state.aof {
                let mut buf = BytesMut::new();
                encode_command(tokens, &mut buf);
                aof.append(&buf).map_err(|e| {
                    error!("aof append failed: {e}");
                    CommandError::Io(e.to_string())
                })?;
            }
        }

        if is_write {
            // cache positions were updated as guards dropped; now
            // enforce the memory ceiling (may evict)
            self.state.keyspace.adjust_memory_usage(&ctx).await?;

            if mode == DispatchMode::Client && !self.state.in_cluster {
                self.maybe_snapshot();
            }
        }

        Ok(reply)
    }

    /// Fires a background snapshot when the mutation count and the
    /// wall-clock interval both say so.
    fn maybe_snapshot(&self) {
        let Some(snapshots) = &self.state.snapshots else {
            return;
        };
        if !snapshots.should_snapshot(self.state.keyspace.dirty()) {
            return;
        }
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Err(e) = run_snapshot(state.as_ref()).await {
                warn!("automatic snapshot failed: {e}");
            }
        });
    }
}

/// Takes a snapshot of the current state and truncates the AOF so the
/// two stay consistent for the next restart. Shared by the automatic
/// trigger and the SAVE/BGSAVE handlers.
pub async fn run_snapshot(state: &ServerState) -> Result<(), CommandError> {
    let Some(snapshots) = &state.snapshots else {
        return Err(CommandError::value("snapshots are disabled"));
    };
    let entries = state.keyspace.get_state().await;
    snapshots
        .snapshot(&entries)
        .await
        .map_err(|e| CommandError::Io(e.to_string()))?;
    state.keyspace.reset_dirty();
    if let Some(aof) = &state.aof {
        aof.truncate().map_err(|e| CommandError::Io(e.to_string()))?;
    }
    Ok(())
}

/// Rewrites the AOF from the current state. Shared by BGREWRITEAOF.
pub async fn run_aof_rewrite(state: &ServerState) -> Result<(), CommandError> {
    let Some(aof) = &state.aof else {
        return Err(CommandError::value("the append-only file is disabled"));
    };
    let entries = state.keyspace.get_state().await;
    aof.rewrite(&entries)
        .map_err(|e| CommandError::Io(e.to_string()))
}
