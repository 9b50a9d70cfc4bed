//! Point-in-time snapshot files.
//!
//! A snapshot serializes every live entry of a state copy into a file
//! named by the current timestamp under `<data_dir>/snapshots/`.
//! Writes go to a `.tmp` file first and are atomically renamed on
//! completion, so a partial snapshot never clobbers an existing one.
//!
//! File layout:
//! ```text
//! [KSNP magic: 4B][version: 1B][entry_count: 4B]
//! [entries...]
//! [footer_crc32: 4B]
//! ```
//!
//! Each entry:
//! ```text
//! [key_len: 4B][key][type_tag: 1B][type-specific payload][expires_at_ms: 8B]
//! ```
//!
//! `expires_at_ms` is the absolute unix-ms expiry, 0 meaning "never".
//! Already-expired entries are filtered out at write time.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use tracing::{debug, warn};

use kiln_core::keyspace::StateEntry;
use kiln_core::time;
use kiln_core::types::{Scalar, SortedSet, Value};

use crate::format::{self, FormatError};

/// Type tags for snapshot entries.
const TYPE_STRING: u8 = 0;
const TYPE_INT: u8 = 1;
const TYPE_FLOAT: u8 = 2;
const TYPE_HASH: u8 = 3;
const TYPE_SET: u8 = 4;
const TYPE_ZSET: u8 = 5;
const TYPE_LIST: u8 = 6;

/// Scalar tags inside hash payloads.
const SCALAR_STR: u8 = 0;
const SCALAR_INT: u8 = 1;
const SCALAR_FLOAT: u8 = 2;

/// Snapshot triggering configuration.
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    /// Server data directory; snapshots land in `<data_dir>/snapshots/`.
    pub data_dir: PathBuf,
    /// Mutations since the last snapshot needed to auto-trigger.
    pub threshold: u64,
    /// Minimum wall time between automatic snapshots.
    pub interval: Duration,
}

struct Inner {
    settings: SnapshotSettings,
    in_progress: AtomicBool,
    /// Unix ms of the last completed snapshot. 0 = none this run.
    latest_snapshot_ms: AtomicU64,
}

/// The snapshot engine. Cheap to clone.
#[derive(Clone)]
pub struct SnapshotEngine {
    inner: Arc<Inner>,
}

impl SnapshotEngine {
    pub fn new(settings: SnapshotSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                in_progress: AtomicBool::new(false),
                latest_snapshot_ms: AtomicU64::new(0),
            }),
        }
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.inner.settings.data_dir.join("snapshots")
    }

    /// Unix ms of the last completed snapshot (0 if none).
    pub fn latest_snapshot_ms(&self) -> u64 {
        self.inner.latest_snapshot_ms.load(Ordering::Acquire)
    }

    /// Returns `true` when the automatic trigger should fire: the
    /// mutation count exceeds the threshold and the interval has
    /// elapsed since the last snapshot.
    pub fn should_snapshot(&self, dirty: u64) -> bool {
        if dirty < self.inner.settings.threshold {
            return false;
        }
        let last = self.latest_snapshot_ms();
        last == 0 || time::now_ms().saturating_sub(last) >= self.inner.settings.interval.as_millis() as u64
    }

    /// Writes a snapshot of `state`, waiting first for any in-flight
    /// snapshot to finish. Returns the path of the new file.
    pub async fn snapshot(&self, state: &[StateEntry]) -> Result<PathBuf, FormatError> {
        while self
            .inner
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tokio::task::yield_now().await;
        }

        let result = self.write_snapshot(state);
        self.inner.in_progress.store(false, Ordering::Release);

        if result.is_ok() {
            self.inner
                .latest_snapshot_ms
                .store(time::now_ms(), Ordering::Release);
        }
        result
    }

    fn write_snapshot(&self, state: &[StateEntry]) -> Result<PathBuf, FormatError> {
        let dir = self.snapshots_dir();
        fs::create_dir_all(&dir)?;

        let final_path = dir.join(format!("{}.snap", time::now_ms()));
        let tmp_path = final_path.with_extension("snap.tmp");

        let mut count: u32 = 0;
        let mut hasher = crc32fast::Hasher::new();
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            format::write_header(&mut writer, format::SNAP_MAGIC)?;
            format::write_u32(&mut writer, 0)?; // patched below

            let mut buf = Vec::new();
            for entry in state {
                if time::is_expired(entry.expires_at_ms) {
                    continue;
                }
                buf.clear();
                write_entry(&mut buf, entry)?;
                hasher.update(&buf);
                writer.write_all(&buf)?;
                count += 1;
            }

            format::write_u32(&mut writer, hasher.finalize())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        // patch the entry count: header is 4 (magic) + 1 (version)
        {
            let mut file = OpenOptions::new().write(true).open(&tmp_path)?;
            file.seek(SeekFrom::Start(5))?;
            format::write_u32(&mut file, count)?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &final_path)?;
        debug!(entries = count, path = %final_path.display(), "snapshot written");
        Ok(final_path)
    }

    /// Reads the newest snapshot file, if any. Returns its entries.
    pub fn restore_latest(&self) -> Result<Option<Vec<StateEntry>>, FormatError> {
        let Some(path) = self.latest_file()? else {
            return Ok(None);
        };
        read_snapshot(&path).map(Some)
    }

    /// Finds the newest snapshot by its timestamp file name.
    fn latest_file(&self) -> Result<Option<PathBuf>, FormatError> {
        let dir = self.snapshots_dir();
        if !dir.exists() {
            return Ok(None);
        }
        let mut newest: Option<(u64, PathBuf)> = None;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("snap") {
                continue;
            }
            let Some(stamp) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                warn!(path = %path.display(), "ignoring unrecognized file in snapshots dir");
                continue;
            };
            if newest.as_ref().map(|(best, _)| stamp > *best).unwrap_or(true) {
                newest = Some((stamp, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}

/// Encodes a state copy as a standalone byte blob (count-prefixed
/// entry records). Used by the replication layer's FSM snapshots,
/// which travel over the wire instead of to a file.
pub fn encode_state(state: &[StateEntry]) -> Result<Vec<u8>, FormatError> {
    let mut buf = Vec::new();
    let live: Vec<&StateEntry> = state
        .iter()
        .filter(|e| !time::is_expired(e.expires_at_ms))
        .collect();
    format::write_u32(&mut buf, live.len() as u32)?;
    for entry in live {
        write_entry(&mut buf, entry)?;
    }
    Ok(buf)
}

/// Decodes a state blob produced by [`encode_state`].
pub fn decode_state(data: &[u8]) -> Result<Vec<StateEntry>, FormatError> {
    let mut cursor = std::io::Cursor::new(data);
    let count = format::read_u32(&mut cursor)?;
    let mut entries = Vec::with_capacity(format::capped_capacity(count));
    for _ in 0..count {
        entries.push(read_entry(&mut cursor)?);
    }
    Ok(entries)
}

fn write_entry(buf: &mut Vec<u8>, entry: &StateEntry) -> Result<(), FormatError> {
    format::write_bytes(buf, entry.key.as_bytes())?;
    match &entry.value {
        Value::String(data) => {
            format::write_u8(buf, TYPE_STRING)?;
            format::write_bytes(buf, data)?;
        }
        Value::Int(n) => {
            format::write_u8(buf, TYPE_INT)?;
            format::write_i64(buf, *n)?;
        }
        Value::Float(f) => {
            format::write_u8(buf, TYPE_FLOAT)?;
            format::write_f64(buf, *f)?;
        }
        Value::Hash(map) => {
            format::write_u8(buf, TYPE_HASH)?;
            format::write_u32(buf, map.len() as u32)?;
            for (field, scalar) in map {
                format::write_bytes(buf, field.as_bytes())?;
                match scalar {
                    Scalar::Str(data) => {
                        format::write_u8(buf, SCALAR_STR)?;
                        format::write_bytes(buf, data)?;
                    }
                    Scalar::Int(n) => {
                        format::write_u8(buf, SCALAR_INT)?;
                        format::write_i64(buf, *n)?;
                    }
                    Scalar::Float(f) => {
                        format::write_u8(buf, SCALAR_FLOAT)?;
                        format::write_f64(buf, *f)?;
                    }
                }
            }
        }
        Value::Set(set) => {
            format::write_u8(buf, TYPE_SET)?;
            format::write_u32(buf, set.len() as u32)?;
            for member in set {
                format::write_bytes(buf, member.as_bytes())?;
            }
        }
        Value::SortedSet(zset) => {
            format::write_u8(buf, TYPE_ZSET)?;
            format::write_u32(buf, zset.len() as u32)?;
            for (member, score) in zset.iter() {
                format::write_f64(buf, score)?;
                format::write_bytes(buf, member.as_bytes())?;
            }
        }
        Value::List(list) => {
            format::write_u8(buf, TYPE_LIST)?;
            format::write_u32(buf, list.len() as u32)?;
            for elem in list {
                format::write_bytes(buf, elem)?;
            }
        }
    }
    format::write_u64(buf, entry.expires_at_ms)?;
    Ok(())
}

/// Reads a full snapshot file, verifying header and footer CRC.
pub fn read_snapshot(path: &Path) -> Result<Vec<StateEntry>, FormatError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    format::read_header(&mut reader, format::SNAP_MAGIC)?;
    let count = format::read_u32(&mut reader)?;

    // read the record region and CRC by buffering each entry through a
    // tee so the footer check covers the exact bytes on disk
    let mut hasher = crc32fast::Hasher::new();
    let mut entries = Vec::with_capacity(format::capped_capacity(count));
    let mut tee = TeeReader {
        inner: &mut reader,
        hasher: &mut hasher,
    };

    for _ in 0..count {
        entries.push(read_entry(&mut tee)?);
    }

    let stored_crc = format::read_u32(&mut reader)?;
    let actual = hasher.finalize();
    if actual != stored_crc {
        return Err(FormatError::ChecksumMismatch {
            expected: stored_crc,
            actual,
        });
    }
    Ok(entries)
}

/// Forwards reads while feeding every byte into the CRC hasher.
struct TeeReader<'a, R: std::io::Read> {
    inner: &'a mut R,
    hasher: &'a mut crc32fast::Hasher,
}

impl<R: std::io::Read> std::io::Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn read_entry(r: &mut impl std::io::Read) -> Result<StateEntry, FormatError> {
    let key = format::read_string(r, "key")?;
    let tag = format::read_u8(r)?;
    let value = match tag {
        TYPE_STRING => Value::String(Bytes::from(format::read_bytes(r)?)),
        TYPE_INT => Value::Int(format::read_i64(r)?),
        TYPE_FLOAT => Value::Float(format::read_f64(r)?),
        TYPE_HASH => {
            let count = format::read_u32(r)?;
            let mut map = AHashMap::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let field = format::read_string(r, "field")?;
                let scalar = match format::read_u8(r)? {
                    SCALAR_STR => Scalar::Str(Bytes::from(format::read_bytes(r)?)),
                    SCALAR_INT => Scalar::Int(format::read_i64(r)?),
                    SCALAR_FLOAT => Scalar::Float(format::read_f64(r)?),
                    other => return Err(FormatError::UnknownTag(other)),
                };
                map.insert(field, scalar);
            }
            Value::Hash(map)
        }
        TYPE_SET => {
            let count = format::read_u32(r)?;
            let mut set = AHashSet::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                set.insert(format::read_string(r, "member")?);
            }
            Value::Set(set)
        }
        TYPE_ZSET => {
            let count = format::read_u32(r)?;
            let mut zset = SortedSet::new();
            for _ in 0..count {
                let score = format::read_f64(r)?;
                let member = format::read_string(r, "member")?;
                zset.add(member, score);
            }
            Value::SortedSet(zset)
        }
        TYPE_LIST => {
            let count = format::read_u32(r)?;
            let mut list = VecDeque::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                list.push_back(Bytes::from(format::read_bytes(r)?));
            }
            Value::List(list)
        }
        other => return Err(FormatError::UnknownTag(other)),
    };
    let expires_at_ms = format::read_u64(r)?;
    Ok(StateEntry {
        key,
        value,
        expires_at_ms,
    })
}
