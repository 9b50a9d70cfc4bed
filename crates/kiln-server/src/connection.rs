//! Per-connection handling.
//!
//! Each accepted socket gets a connection ID, an ACL registration, and
//! a read loop that frames RESP commands, dispatches them serially,
//! and writes replies. Pub/sub deliveries arrive out-of-band through
//! the connection's push channel and interleave with replies between
//! commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use kiln_protocol::{parse_frame, Frame, ProtocolError};

use crate::dispatch::{DispatchMode, Dispatcher};

/// Initial read buffer capacity. 4KB covers most commands comfortably.
const BUF_CAPACITY: usize = 4096;

/// Maximum read buffer size before we disconnect the client. Prevents
/// a slow or malicious client from consuming unbounded memory with
/// incomplete frames.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// How long a connection can sit idle before we close it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state shared with handlers: the connection ID used
/// as the ACL registry key, a cancellation token tied to the
/// connection's lifetime, the push channel for pub/sub deliveries, and
/// the subscription forwarder tasks.
pub struct ConnHandle {
    pub id: u64,
    pub cancel: CancellationToken,
    push: mpsc::UnboundedSender<Frame>,
    channels: Mutex<AHashMap<String, JoinHandle<()>>>,
    patterns: Mutex<AHashMap<String, JoinHandle<()>>>,
}

impl ConnHandle {
    /// Creates a handle plus the receiving end of its push channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (push, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
                push,
                channels: Mutex::new(AHashMap::new()),
                patterns: Mutex::new(AHashMap::new()),
            },
            rx,
        )
    }

    /// Queues a frame for out-of-band delivery (pub/sub push).
    /// Returns `false` when the connection is gone.
    pub fn push(&self, frame: Frame) -> bool {
        self.push.send(frame).is_ok()
    }

    /// A clonable sender for forwarder tasks that outlive the borrow
    /// of this handle.
    pub fn push_sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.push.clone()
    }

    /// Registers the forwarder task for a channel subscription,
    /// aborting any previous task for the same channel.
    pub fn track_channel(&self, channel: String, task: JoinHandle<()>) {
        if let Some(old) = self.channels.lock().insert(channel, task) {
            old.abort();
        }
    }

    /// Registers the forwarder task for a pattern subscription.
    pub fn track_pattern(&self, pattern: String, task: JoinHandle<()>) {
        if let Some(old) = self.patterns.lock().insert(pattern, task) {
            old.abort();
        }
    }

    /// Stops a channel subscription. Returns `true` if one existed.
    pub fn drop_channel(&self, channel: &str) -> bool {
        match self.channels.lock().remove(channel) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Stops a pattern subscription. Returns `true` if one existed.
    pub fn drop_pattern(&self, pattern: &str) -> bool {
        match self.patterns.lock().remove(pattern) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Names of every channel this connection subscribes to.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    /// Names of every pattern this connection subscribes to.
    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns.lock().keys().cloned().collect()
    }

    /// Total live subscriptions (channels + patterns).
    pub fn subscription_count(&self) -> usize {
        self.channels.lock().len() + self.patterns.lock().len()
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        for (_, task) in self.channels.lock().drain() {
            task.abort();
        }
        for (_, task) in self.patterns.lock().drain() {
            task.abort();
        }
    }
}

/// Drives one client connection to completion.
///
/// Commands on a single connection are processed serially by this
/// loop; pipelined requests are answered in order. The loop exits on
/// client disconnect, protocol error, idle timeout, or I/O error (an
/// I/O error closes only this connection).
pub async fn handle<S>(mut stream: S, dispatcher: Dispatcher) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (conn, mut push_rx) = ConnHandle::new();
    dispatcher.state().acl.register_connection(conn.id);
    debug!(conn_id = conn.id, "connection opened");

    let result = read_loop(&mut stream, &dispatcher, &conn, &mut push_rx).await;

    dispatcher.state().acl.remove_connection(conn.id);
    debug!(conn_id = conn.id, "connection closed");
    result
}

async fn read_loop<S>(
    stream: &mut S,
    dispatcher: &Dispatcher,
    conn: &ConnHandle,
    push_rx: &mut mpsc::UnboundedReceiver<Frame>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);

    loop {
        // guard against unbounded buffer growth from incomplete frames
        if buf.len() > MAX_BUF_SIZE {
            let mut err_buf = BytesMut::new();
            Frame::Error("ERR max buffer size exceeded, closing connection".into())
                .serialize(&mut err_buf);
            let _ = stream.write_all(&err_buf).await;
            return Ok(());
        }

        tokio::select! {
            read = tokio::time::timeout(IDLE_TIMEOUT, stream.read_buf(&mut buf)) => {
                match read {
                    Ok(Ok(0)) => return Ok(()),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Ok(()), // idle timeout — close silently
                }

                // drain as many complete frames as the buffer holds
                // (pipelining), batching replies into a single write
                out.clear();
                loop {
                    match parse_frame(&buf) {
                        Ok(Some((frame, consumed))) => {
                            let _ = buf.split_to(consumed);
                            let tokens = match frame.into_tokens() {
                                Ok(tokens) => tokens,
                                Err(e) => {
                                    Frame::Error(format!("ERR Protocol error: {e}"))
                                        .serialize(&mut out);
                                    stream.write_all(&out).await?;
                                    return Ok(());
                                }
                            };
                            let reply = dispatcher
                                .dispatch(&tokens, DispatchMode::Client, Some(conn))
                                .await;
                            reply.serialize(&mut out);
                        }
                        Ok(None) => break, // need more data
                        Err(e) => {
                            report_protocol_error(stream, &mut out, e).await?;
                            return Ok(());
                        }
                    }
                }

                if !out.is_empty() {
                    write_chunked(stream, &out).await?;
                }
            }

            pushed = push_rx.recv() => {
                let Some(frame) = pushed else { return Ok(()) };
                out.clear();
                frame.serialize(&mut out);
                // drain any further queued deliveries in one write
                while let Ok(frame) = push_rx.try_recv() {
                    frame.serialize(&mut out);
                }
                write_chunked(stream, &out).await?;
            }
        }
    }
}

async fn report_protocol_error<S>(
    stream: &mut S,
    out: &mut BytesMut,
    e: ProtocolError,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    error!("protocol error, closing connection: {e}");
    out.clear();
    Frame::Error(format!("ERR Protocol error: {e}")).serialize(out);
    stream.write_all(out).await
}

/// Write chunk size for large replies.
const WRITE_CHUNK: usize = 256 * 1024;

/// Writes a reply buffer in bounded chunks so one huge reply doesn't
/// monopolize the writer.
async fn write_chunked<S>(stream: &mut S, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    for chunk in data.chunks(WRITE_CHUNK) {
        stream.write_all(chunk).await?;
    }
    stream.flush().await
}

/// Builds the pub/sub push frame for a delivered message.
pub fn message_frame(msg: &crate::pubsub::PubMessage) -> Frame {
    match &msg.pattern {
        None => Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"message")),
            Frame::Bulk(Bytes::copy_from_slice(msg.channel.as_bytes())),
            Frame::Bulk(msg.data.clone()),
        ]),
        Some(pattern) => Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"pmessage")),
            Frame::Bulk(Bytes::copy_from_slice(pattern.as_bytes())),
            Frame::Bulk(Bytes::copy_from_slice(msg.channel.as_bytes())),
            Frame::Bulk(msg.data.clone()),
        ]),
    }
}
