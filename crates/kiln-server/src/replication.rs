//! The replication capability the dispatcher writes through.
//!
//! Standalone mode is a pass-through: every node is its own leader and
//! `submit` is never reached (the dispatcher invokes handlers
//! directly). Cluster mode wraps a raft instance: `submit` proposes
//! the serialized command to the replicated log and awaits the apply
//! result; non-leaders either forward the original bytes to the
//! leader's RESP endpoint or answer with a not-leader error.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kiln_protocol::{parse_frame, Frame};

use crate::error::CommandError;
use crate::raft::{AppCommand, KilnRaft};

/// How long a follower waits on the leader when forwarding a command.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// A raft-backed replication handle.
pub struct RaftReplication {
    pub raft: KilnRaft,
    pub node_id: u64,
    /// The leader's RESP endpoint for command forwarding, when known
    /// from configuration.
    pub forward_addr: Option<String>,
}

impl RaftReplication {
    fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }
}

/// The replication layer behind the dispatcher.
pub enum ReplicationLayer {
    /// No cluster: the local node applies everything directly.
    Standalone,
    /// Raft-ordered writes.
    Raft(RaftReplication),
    /// A node that is never the leader; used to exercise the follower
    /// paths without a raft instance. Carries an optional forward
    /// address.
    #[cfg(test)]
    NeverLeader(Option<String>),
}

impl ReplicationLayer {
    #[cfg(test)]
    pub fn test_follower() -> Self {
        ReplicationLayer::NeverLeader(None)
    }

    /// Whether this node may apply synced writes locally.
    pub fn is_leader(&self) -> bool {
        match self {
            ReplicationLayer::Standalone => true,
            ReplicationLayer::Raft(raft) => raft.is_leader(),
            #[cfg(test)]
            ReplicationLayer::NeverLeader(_) => false,
        }
    }

    /// The RESP endpoint to forward writes to when not the leader.
    pub fn leader_addr(&self) -> Option<&str> {
        match self {
            ReplicationLayer::Standalone => None,
            ReplicationLayer::Raft(raft) => raft.forward_addr.as_deref(),
            #[cfg(test)]
            ReplicationLayer::NeverLeader(addr) => addr.as_deref(),
        }
    }

    /// Proposes a serialized command to the replicated log and awaits
    /// the apply result. Only called on the leader.
    pub async fn submit(&self, cmd: Bytes) -> Result<Frame, CommandError> {
        match self {
            ReplicationLayer::Standalone => Err(CommandError::value(
                "cannot submit to the replicated log in standalone mode",
            )),
            ReplicationLayer::Raft(raft) => {
                let response = raft
                    .raft
                    .client_write(AppCommand(cmd.to_vec()))
                    .await
                    .map_err(|e| CommandError::Io(format!("raft submit failed: {e}")))?;
                decode_reply(&response.data.0)
            }
            #[cfg(test)]
            ReplicationLayer::NeverLeader(_) => Err(CommandError::NotLeader),
        }
    }
}

/// Parses the serialized reply frame a raft apply produced.
fn decode_reply(data: &[u8]) -> Result<Frame, CommandError> {
    match parse_frame(data) {
        Ok(Some((frame, _))) => Ok(frame),
        Ok(None) | Err(_) => Err(CommandError::Io(
            "malformed reply from raft apply".into(),
        )),
    }
}

/// Forwards a command's original RESP bytes to the leader and relays
/// the reply.
pub async fn forward_to_leader(
    replication: &ReplicationLayer,
    cmd: Bytes,
) -> Result<Frame, CommandError> {
    let Some(addr) = replication.leader_addr() else {
        return Err(CommandError::NotLeader);
    };

    let forward = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CommandError::Io(format!("connect to leader failed: {e}")))?;
        stream
            .write_all(&cmd)
            .await
            .map_err(|e| CommandError::Io(format!("forward to leader failed: {e}")))?;

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match parse_frame(&buf) {
                Ok(Some((frame, _))) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    return Err(CommandError::Io(format!(
                        "malformed reply from leader: {e}"
                    )))
                }
            }
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| CommandError::Io(format!("read from leader failed: {e}")))?;
            if n == 0 {
                return Err(CommandError::Io("leader closed the connection".into()));
            }
        }
    };

    tokio::time::timeout(FORWARD_TIMEOUT, forward)
        .await
        .map_err(|_| CommandError::Io("timed out waiting for the leader".into()))?
}

impl crate::raft::CommandApplier for crate::dispatch::Dispatcher {
    /// The raft FSM's apply: deserialize the committed RESP command,
    /// run it through the Apply path (handler + local AOF append), and
    /// return the serialized reply.
    fn apply<'a>(
        &'a self,
        cmd: Bytes,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Bytes> + Send + 'a>> {
        Box::pin(async move {
            let frame = match parse_frame(&cmd) {
                Ok(Some((frame, _))) => frame,
                Ok(None) | Err(_) => Frame::Error("ERR malformed replicated command".into()),
            };
            let reply = match frame.into_tokens() {
                Ok(tokens) => {
                    self.dispatch(&tokens, crate::dispatch::DispatchMode::Apply, None)
                        .await
                }
                Err(e) => Frame::Error(format!("ERR {e}")),
            };
            let mut buf = BytesMut::new();
            reply.serialize(&mut buf);
            buf.freeze()
        })
    }

    fn snapshot_state<'a>(
        &'a self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>, String>> + Send + 'a>>
    {
        Box::pin(async move {
            let state = self.keyspace().get_state().await;
            kiln_persistence::snapshot::encode_state(&state).map_err(|e| e.to_string())
        })
    }

    fn restore_state<'a>(
        &'a self,
        data: Vec<u8>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            let entries =
                kiln_persistence::snapshot::decode_state(&data).map_err(|e| e.to_string())?;
            let keyspace = self.keyspace();
            keyspace.clear();
            for entry in entries {
                keyspace
                    .restore(entry.key, entry.value, entry.expires_at_ms)
                    .await;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_is_always_leader() {
        assert!(ReplicationLayer::Standalone.is_leader());
        assert!(ReplicationLayer::Standalone.leader_addr().is_none());
    }

    #[tokio::test]
    async fn standalone_submit_is_an_error() {
        let err = ReplicationLayer::Standalone
            .submit(Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Value(_)));
    }

    #[tokio::test]
    async fn forward_without_leader_addr_is_notleader() {
        let err = forward_to_leader(
            &ReplicationLayer::test_follower(),
            Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"),
        )
        .await
        .unwrap_err();
        assert_eq!(err, CommandError::NotLeader);
    }

    #[tokio::test]
    async fn forward_relays_the_leader_reply() {
        use tokio::net::TcpListener;

        // a fake leader that answers +OK to whatever arrives
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"+OK\r\n").await.unwrap();
        });

        let layer = ReplicationLayer::NeverLeader(Some(addr.to_string()));
        let reply = forward_to_leader(&layer, Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"))
            .await
            .unwrap();
        assert_eq!(reply, Frame::Simple("OK".into()));
    }

    #[test]
    fn decode_reply_round_trip() {
        let mut buf = BytesMut::new();
        Frame::Integer(3).serialize(&mut buf);
        assert_eq!(decode_reply(&buf).unwrap(), Frame::Integer(3));
        assert!(decode_reply(b"garbage").is_err());
        assert!(decode_reply(b"").is_err());
    }
}
