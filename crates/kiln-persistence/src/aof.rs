//! Append-only file of mutating commands.
//!
//! Each record is a verbatim RESP array — the exact bytes the client
//! sent — terminated by `\r\n`. Records are concatenated with no
//! length prefix; the RESP framer delimits them on replay, so bulk
//! strings containing CRLFs round-trip correctly.
//!
//! The writer is single-writer: a mutex serializes appends with the
//! `everysec` fsync task. Sync strategy is one of `always` (fsync per
//! append), `everysec` (a background task fsyncs once per second), or
//! `no` (the OS decides).
//!
//! Rewrite produces a compact equivalent log — one reconstruction
//! command per live key plus its TTL — written to a temp path and
//! atomically renamed over the live log. Mutations that arrive during
//! a rewrite are buffered and flushed into the new log before the
//! swap completes.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiln_core::keyspace::StateEntry;
use kiln_core::types::{format_float, Value};
use kiln_core::time;
use kiln_protocol::{encode_command, parse_frame, ProtocolError};

use crate::format::FormatError;

/// Configurable fsync policy for the AOF writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every append. safest, slowest.
    Always,
    /// fsync once per second from a background task.
    #[default]
    EverySec,
    /// let the OS decide when to flush. fastest, least durable.
    No,
}

struct Writer {
    file: File,
}

struct Inner {
    path: PathBuf,
    writer: Mutex<Writer>,
    sync_policy: SyncPolicy,
    rewrite_in_progress: AtomicBool,
    /// Records appended while a rewrite is running, replayed into the
    /// new log before the swap.
    rewrite_buffer: Mutex<Option<Vec<Bytes>>>,
}

/// The append-only log engine. Cheap to clone; all clones share the
/// single writer.
#[derive(Clone)]
pub struct AofEngine {
    inner: Arc<Inner>,
}

impl AofEngine {
    /// Opens (or creates) the log at `path` for appending.
    pub fn open(path: impl Into<PathBuf>, sync_policy: SyncPolicy) -> Result<Self, FormatError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                writer: Mutex::new(Writer { file }),
                sync_policy,
                rewrite_in_progress: AtomicBool::new(false),
                rewrite_buffer: Mutex::new(None),
            }),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Appends one RESP-encoded command record.
    ///
    /// With the `always` policy the record is fsynced before this
    /// returns; an fsync failure fails the write path.
    pub fn append(&self, record: &[u8]) -> Result<(), FormatError> {
        let mut writer = self.inner.writer.lock();
        if let Some(buffer) = self.inner.rewrite_buffer.lock().as_mut() {
            buffer.push(Bytes::copy_from_slice(record));
        }
        writer.file.write_all(record)?;
        if self.inner.sync_policy == SyncPolicy::Always {
            writer.file.sync_all()?;
        }
        Ok(())
    }

    /// Flushes and fsyncs the log. Driven by the `everysec` task.
    pub fn sync(&self) -> Result<(), FormatError> {
        let writer = self.inner.writer.lock();
        writer.file.sync_all()?;
        Ok(())
    }

    /// Truncates the log to empty. Used after a successful snapshot so
    /// replay doesn't duplicate the snapshot's contents.
    pub fn truncate(&self) -> Result<(), FormatError> {
        let mut writer = self.inner.writer.lock();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.inner.path)?;
        file.sync_all()?;
        writer.file = OpenOptions::new().append(true).open(&self.inner.path)?;
        Ok(())
    }

    /// Rewrites the log in place from a state snapshot: one
    /// reconstruction command per live key (plus its TTL), written to
    /// a temp path and atomically renamed over the live log. Appends
    /// that land mid-rewrite are buffered and flushed into the new log
    /// before the swap.
    pub fn rewrite(&self, state: &[StateEntry]) -> Result<(), FormatError> {
        if self
            .inner
            .rewrite_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FormatError::RewriteInProgress);
        }
        let result = self.rewrite_inner(state);
        self.inner.rewrite_in_progress.store(false, Ordering::Release);
        result
    }

    fn rewrite_inner(&self, state: &[StateEntry]) -> Result<(), FormatError> {
        // from here on, concurrent appends are captured for replay
        *self.inner.rewrite_buffer.lock() = Some(Vec::new());

        let tmp_path = self.inner.path.with_extension("aof.tmp");
        let write_result = (|| -> Result<(), FormatError> {
            let mut tmp = File::create(&tmp_path)?;
            let mut buf = BytesMut::new();
            for entry in state {
                if time::is_expired(entry.expires_at_ms) {
                    continue;
                }
                for command in rebuild_commands(entry) {
                    buf.clear();
                    encode_command(&command, &mut buf);
                    tmp.write_all(&buf)?;
                }
            }
            tmp.sync_all()?;

            // swap under the writer mutex so no append straddles the
            // rename: drain buffered records into the new log first
            let mut writer = self.inner.writer.lock();
            let buffered = self
                .inner
                .rewrite_buffer
                .lock()
                .take()
                .unwrap_or_default();
            let mut tmp = OpenOptions::new().append(true).open(&tmp_path)?;
            for record in &buffered {
                tmp.write_all(record)?;
            }
            tmp.sync_all()?;
            fs::rename(&tmp_path, &self.inner.path)?;
            writer.file = OpenOptions::new().append(true).open(&self.inner.path)?;
            debug!(
                records = state.len(),
                buffered = buffered.len(),
                "aof rewrite complete"
            );
            Ok(())
        })();

        if write_result.is_err() {
            *self.inner.rewrite_buffer.lock() = None;
            let _ = fs::remove_file(&tmp_path);
        }
        write_result
    }
}

/// Spawns the `everysec` fsync task. A no-op (immediately returning
/// task) for the other policies.
pub fn spawn_sync_task(engine: AofEngine, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if engine.inner.sync_policy != SyncPolicy::EverySec {
            return;
        }
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = engine.sync() {
                        warn!("aof fsync failed: {e}");
                    }
                }
            }
        }
    })
}

/// Builds the commands that reconstruct one live key: a write command
/// for the value, then `EXPIREAT` when a TTL is set.
fn rebuild_commands(entry: &StateEntry) -> Vec<Vec<Bytes>> {
    let key = Bytes::copy_from_slice(entry.key.as_bytes());
    let mut commands = Vec::with_capacity(2);

    let write_cmd: Option<Vec<Bytes>> = match &entry.value {
        Value::String(_) | Value::Int(_) | Value::Float(_) => entry
            .value
            .as_string_repr()
            .map(|repr| vec![Bytes::from_static(b"SET"), key.clone(), repr]),
        Value::Hash(map) => {
            if map.is_empty() {
                None
            } else {
                let mut cmd = vec![Bytes::from_static(b"HSET"), key.clone()];
                for (field, scalar) in map {
                    cmd.push(Bytes::copy_from_slice(field.as_bytes()));
                    cmd.push(scalar.to_bytes());
                }
                Some(cmd)
            }
        }
        Value::Set(set) => {
            if set.is_empty() {
                None
            } else {
                let mut cmd = vec![Bytes::from_static(b"SADD"), key.clone()];
                for member in set {
                    cmd.push(Bytes::copy_from_slice(member.as_bytes()));
                }
                Some(cmd)
            }
        }
        Value::SortedSet(zset) => {
            if zset.is_empty() {
                None
            } else {
                let mut cmd = vec![Bytes::from_static(b"ZADD"), key.clone()];
                for (member, score) in zset.iter() {
                    cmd.push(Bytes::from(format_float(score)));
                    cmd.push(Bytes::copy_from_slice(member.as_bytes()));
                }
                Some(cmd)
            }
        }
        Value::List(list) => {
            if list.is_empty() {
                None
            } else {
                let mut cmd = vec![Bytes::from_static(b"RPUSH"), key.clone()];
                cmd.extend(list.iter().cloned());
                Some(cmd)
            }
        }
    };

    if let Some(cmd) = write_cmd {
        commands.push(cmd);
        if entry.expires_at_ms != time::NO_EXPIRY {
            // round up so the replayed TTL never lands earlier
            let at_secs = entry.expires_at_ms.div_ceil(1000);
            commands.push(vec![
                Bytes::from_static(b"EXPIREAT"),
                key,
                Bytes::from(at_secs.to_string()),
            ]);
        }
    }
    commands
}

/// Streaming reader over the log: yields one command token-list per
/// record. A truncated final record (crash mid-append) is skipped; a
/// malformed record is an error the caller treats as fatal.
pub struct AofLogReader {
    file: File,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl AofLogReader {
    const CHUNK: usize = 64 * 1024;

    /// Opens the log for replay.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            file,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        })
    }

    /// Returns the next record's tokens, or `None` at end of log.
    pub fn next_record(&mut self) -> Result<Option<Vec<Bytes>>, FormatError> {
        loop {
            match parse_frame(&self.buf[self.pos..]) {
                Ok(Some((frame, consumed))) => {
                    self.pos += consumed;
                    let tokens = frame.into_tokens().map_err(protocol_to_format)?;
                    return Ok(Some(tokens));
                }
                Ok(None) => {
                    if self.eof {
                        if self.pos < self.buf.len() {
                            warn!(
                                trailing = self.buf.len() - self.pos,
                                "skipping truncated record at end of aof"
                            );
                        }
                        return Ok(None);
                    }
                    self.fill()?;
                }
                Err(e) => return Err(protocol_to_format(e)),
            }
        }
    }

    fn fill(&mut self) -> Result<(), FormatError> {
        // drop consumed bytes before growing the buffer
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let start = self.buf.len();
        self.buf.resize(start + Self::CHUNK, 0);
        let n = self.file.read(&mut self.buf[start..])?;
        self.buf.truncate(start + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

fn protocol_to_format(e: ProtocolError) -> FormatError {
    FormatError::InvalidData(format!("malformed aof record: {e}"))
}
