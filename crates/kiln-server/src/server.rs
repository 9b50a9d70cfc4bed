//! Server bootstrap: engines, restore sequence, background tasks, and
//! the accept loop.
//!
//! Startup order: build the keyspace and persistence engines, restore
//! the newest snapshot, replay the AOF on top, install the raft layer
//! in cluster mode, spawn the TTL sweeper and the AOF sync task, then
//! accept connections (plain TCP or TLS).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kiln_core::keyspace::Keyspace;
use kiln_core::sweeper;
use kiln_persistence::aof::{self, AofLogReader};
use kiln_persistence::{AofEngine, SnapshotEngine, SnapshotSettings};
use kiln_protocol::Frame;

use crate::acl::Acl;
use crate::config::Config;
use crate::connection;
use crate::dispatch::{DispatchMode, Dispatcher, ServerState};
use crate::raft::{self, StableStore};
use crate::replication::{RaftReplication, ReplicationLayer};
use crate::tls::{load_tls_acceptor, TlsSettings};

/// Builds the full server state from config: keyspace, ACL, and the
/// persistence engines (absent in `--in-memory` mode).
pub fn build_state(config: &Config) -> Result<Arc<ServerState>, Box<dyn std::error::Error>> {
    let keyspace = Keyspace::with_config(config.store_config());
    let acl = Acl::load(
        config.require_pass,
        config.password.as_deref(),
        config.acl_config.as_deref(),
    )?;

    let (aof, snapshots) = if config.in_memory {
        (None, None)
    } else {
        std::fs::create_dir_all(&config.data_dir)?;
        let aof = AofEngine::open(config.aof_path(), config.aof_sync_strategy)?;
        let snapshots = SnapshotEngine::new(SnapshotSettings {
            data_dir: config.data_dir.clone(),
            threshold: config.snapshot_threshold,
            interval: config.snapshot_interval,
        });
        (Some(aof), Some(snapshots))
    };

    Ok(Arc::new(ServerState::new(
        keyspace,
        acl,
        aof,
        snapshots,
        config.in_cluster(),
        config.forward_commands,
    )))
}

/// Restores the keyspace per config: newest snapshot first, then the
/// AOF replayed on top. A malformed AOF record is fatal.
pub async fn restore(
    config: &Config,
    state: &Arc<ServerState>,
    dispatcher: &Dispatcher,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.restore_snapshot {
        if let Some(snapshots) = &state.snapshots {
            if let Some(entries) = snapshots.restore_latest()? {
                let count = entries.len();
                for entry in entries {
                    state
                        .keyspace
                        .restore(entry.key, entry.value, entry.expires_at_ms)
                        .await;
                }
                info!(keys = count, "restored keyspace from snapshot");
            }
        }
    }

    if config.restore_aof {
        if let Some(aof_engine) = &state.aof {
            let replayed = replay_aof(aof_engine, dispatcher).await?;
            if replayed > 0 {
                info!(records = replayed, "replayed append-only file");
            }
        }
    }

    Ok(())
}

/// TCP keepalive probe cadence on accepted client sockets.
const KEEPALIVE_PERIOD: Duration = Duration::from_millis(200);

/// Enables socket-level keepalive on an accepted connection. Tokio's
/// stream type doesn't expose interval-granularity keepalive, so this
/// goes through socket2 on the raw socket. Failure isn't worth
/// dropping the connection over.
fn configure_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_PERIOD)
        .with_interval(KEEPALIVE_PERIOD);
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("failed to set tcp keepalive: {e}");
    }
}

/// Replays every record in the AOF through the command pipeline with
/// the replay mode, so nothing is re-appended.
async fn replay_aof(
    engine: &AofEngine,
    dispatcher: &Dispatcher,
) -> Result<usize, Box<dyn std::error::Error>> {
    if !engine.path().exists() {
        return Ok(0);
    }
    let mut reader = AofLogReader::open(engine.path())?;
    let mut replayed = 0;
    while let Some(tokens) = reader.next_record()? {
        let reply = dispatcher
            .dispatch(&tokens, DispatchMode::Replay, None)
            .await;
        if let Frame::Error(msg) = reply {
            // a command that was accepted once should replay cleanly;
            // anything else points at a log/code mismatch
            warn!(error = %msg, "aof replay: command failed");
        }
        replayed += 1;
    }
    Ok(replayed)
}

/// Runs the server to completion.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = build_state(&config)?;
    let dispatcher = Dispatcher::new(Arc::clone(&state));

    restore(&config, &state, &dispatcher).await?;

    if config.in_cluster() {
        let stable = StableStore::open(config.data_dir.join("raft-stable.json"))?;
        let raft = raft::start(
            config.server_id,
            format!("{}:{}", config.bind_addr, config.raft_port),
            Arc::new(dispatcher.clone()),
            stable,
            config.bootstrap_cluster,
        )
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
        state.set_replication(ReplicationLayer::Raft(RaftReplication {
            raft,
            node_id: config.server_id,
            forward_addr: config.join_addr.clone(),
        }));
        info!(node_id = config.server_id, "cluster mode enabled");
    }

    let shutdown = CancellationToken::new();
    let _sweeper = sweeper::spawn(state.keyspace.clone(), shutdown.clone());
    if let Some(aof_engine) = &state.aof {
        let _syncer = aof::spawn_sync_task(aof_engine.clone(), shutdown.clone());
    }

    let tls_acceptor = if config.tls || config.mtls {
        Some(load_tls_acceptor(&TlsSettings {
            cert_key_pairs: config.cert_key_pairs.clone(),
            client_cas: config.client_cas.clone(),
            require_client_certs: config.mtls,
        })?)
    } else {
        None
    };

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr,
        tls = tls_acceptor.is_some(),
        cluster = config.in_cluster(),
        "accepting connections"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        configure_keepalive(&stream);
        let dispatcher = dispatcher.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let result = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => connection::handle(tls_stream, dispatcher).await,
                    Err(e) => {
                        warn!("tls handshake with {peer} failed: {e}");
                        return;
                    }
                },
                None => connection::handle(stream, dispatcher).await,
            };
            if let Err(e) = result {
                error!("connection error from {peer}: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testutil::{assert_bulk, assert_nil, run, tokens};
    use kiln_persistence::SyncPolicy;

    fn test_config(dir: &std::path::Path) -> Config {
        use clap::Parser;
        Config::parse_from([
            "kiln-server",
            "--data-dir",
            dir.to_str().unwrap(),
            "--restore-snapshot",
            "--restore-aof",
        ])
    }

    #[tokio::test]
    async fn aof_replay_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // first life: run commands against a live dispatcher
        {
            let state = build_state(&config).unwrap();
            let dispatcher = Dispatcher::new(Arc::clone(&state));
            for cmd in [
                vec!["SET", "a", "1"],
                vec!["INCR", "a"],
                vec!["HSET", "h", "f", "v"],
                vec!["DEL", "a"],
            ] {
                dispatcher
                    .dispatch(&tokens(&cmd), DispatchMode::Client, None)
                    .await;
            }
        }

        // second life: restore from the log
        let state = build_state(&config).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&state));
        restore(&config, &state, &dispatcher).await.unwrap();

        assert_nil(&run(&dispatcher, &["GET", "a"]).await);
        match run(&dispatcher, &["HGET", "h", "f"]).await {
            Frame::Array(items) => assert_bulk(&items[0], "v"),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_restore_then_aof_replay() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        {
            let state = build_state(&config).unwrap();
            let dispatcher = Dispatcher::new(Arc::clone(&state));
            run(&dispatcher, &["SET", "snap", "shot"]).await;
            // snapshot captures the state and truncates the AOF
            crate::dispatch::run_snapshot(state.as_ref()).await.unwrap();
            // this lands only in the (fresh) AOF
            run(&dispatcher, &["SET", "tail", "log"]).await;
        }

        let state = build_state(&config).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&state));
        restore(&config, &state, &dispatcher).await.unwrap();

        assert_bulk(&run(&dispatcher, &["GET", "snap"]).await, "shot");
        assert_bulk(&run(&dispatcher, &["GET", "tail"]).await, "log");
    }

    #[tokio::test]
    async fn replay_of_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let state = build_state(&config).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        // drop the AOF file the builder created, then replay
        std::fs::remove_file(config.aof_path()).unwrap();
        let engine = AofEngine::open(config.aof_path(), SyncPolicy::No).unwrap();
        std::fs::remove_file(config.aof_path()).unwrap();
        let replayed = replay_aof(&engine, &dispatcher).await.unwrap();
        assert_eq!(replayed, 0);
    }
}
