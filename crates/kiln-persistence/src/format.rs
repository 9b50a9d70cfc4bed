//! Binary format helpers for snapshot files.
//!
//! Length-prefixed encoding primitives, CRC32 checksums, and the magic
//! byte constants. All multi-byte integers are stored in little-endian.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use thiserror::Error;

/// Magic bytes for the snapshot file header.
pub const SNAP_MAGIC: &[u8; 4] = b"KSNP";

/// Current snapshot format version.
pub const FORMAT_VERSION: u8 = 1;

/// Errors that can occur when reading or writing persistence formats.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown record tag: {0}")]
    UnknownTag(u8),

    #[error("aof rewrite already in progress")]
    RewriteInProgress,

    #[error("snapshot already in progress")]
    SnapshotInProgress,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Computes a CRC32 checksum over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

// ---------------------------------------------------------------------------
// write helpers
// ---------------------------------------------------------------------------

pub fn write_u8(w: &mut impl Write, val: u8) -> io::Result<()> {
    w.write_all(&[val])
}

pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_u64(w: &mut impl Write, val: u64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_i64(w: &mut impl Write, val: i64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_f64(w: &mut impl Write, val: f64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a length-prefixed byte slice: `[len: u32][data]`.
pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("data length {} exceeds u32::MAX", data.len()),
        )
    })?;
    write_u32(w, len)?;
    w.write_all(data)
}

// ---------------------------------------------------------------------------
// read helpers
// ---------------------------------------------------------------------------

pub fn read_u8(r: &mut impl Read) -> Result<u8, FormatError> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

pub fn read_u32(r: &mut impl Read) -> Result<u32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64(r: &mut impl Read) -> Result<u64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_i64(r: &mut impl Read) -> Result<i64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn read_f64(r: &mut impl Read) -> Result<f64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Maximum length we'll allocate when reading a length-prefixed field.
/// 512 MB is generous for any realistic key or value — a corrupt
/// length prefix won't cause a multi-gigabyte allocation.
pub const MAX_FIELD_LEN: usize = 512 * 1024 * 1024;

/// Reads a length-prefixed byte vector: `[len: u32][data]`.
pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, FormatError> {
    let len = read_u32(r)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(FormatError::InvalidData(format!(
            "field length {len} exceeds maximum of {MAX_FIELD_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

/// Reads a length-prefixed field and decodes it as UTF-8.
pub fn read_string(r: &mut impl Read, field: &str) -> Result<String, FormatError> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes)
        .map_err(|_| FormatError::InvalidData(format!("{field} is not valid utf-8")))
}

/// Reads exactly `buf.len()` bytes, returning `UnexpectedEof` on short read.
fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}

/// Writes a file header: magic bytes + version byte.
pub fn write_header(w: &mut impl Write, magic: &[u8; 4]) -> io::Result<()> {
    w.write_all(magic)?;
    write_u8(w, FORMAT_VERSION)
}

/// Reads and validates a file header. Returns the format version.
pub fn read_header(r: &mut impl Read, expected_magic: &[u8; 4]) -> Result<u8, FormatError> {
    let mut magic = [0u8; 4];
    read_exact(r, &mut magic)?;
    if &magic != expected_magic {
        return Err(FormatError::InvalidMagic);
    }
    let version = read_u8(r)?;
    if version == 0 || version > FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Caps pre-allocation to avoid huge allocations from corrupt count
/// fields. The loop still iterates `count` times — this just limits
/// the up-front reservation.
pub fn capped_capacity(count: u32) -> usize {
    (count as usize).min(65_536)
}

/// Verifies that `data` matches the expected CRC32 checksum.
pub fn verify_crc32(data: &[u8], expected: u32) -> Result<(), FormatError> {
    let actual = crc32(data);
    if actual != expected {
        return Err(FormatError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn u8_round_trip() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 42).unwrap();
        assert_eq!(read_u8(&mut Cursor::new(&buf)).unwrap(), 42);
    }

    #[test]
    fn u64_round_trip() {
        let mut buf = Vec::new();
        write_u64(&mut buf, u64::MAX - 7).unwrap();
        assert_eq!(read_u64(&mut Cursor::new(&buf)).unwrap(), u64::MAX - 7);
    }

    #[test]
    fn i64_round_trip() {
        let mut buf = Vec::new();
        write_i64(&mut buf, -1).unwrap();
        assert_eq!(read_i64(&mut Cursor::new(&buf)).unwrap(), -1);
    }

    #[test]
    fn f64_round_trip() {
        let mut buf = Vec::new();
        write_f64(&mut buf, 67.77).unwrap();
        assert_eq!(read_f64(&mut Cursor::new(&buf)).unwrap(), 67.77);
    }

    #[test]
    fn bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello world").unwrap();
        assert_eq!(read_bytes(&mut Cursor::new(&buf)).unwrap(), b"hello world");
    }

    #[test]
    fn empty_bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"").unwrap();
        assert_eq!(read_bytes(&mut Cursor::new(&buf)).unwrap(), b"");
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        write_header(&mut buf, SNAP_MAGIC).unwrap();
        assert_eq!(
            read_header(&mut Cursor::new(&buf), SNAP_MAGIC).unwrap(),
            FORMAT_VERSION
        );
    }

    #[test]
    fn header_wrong_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf, b"XXXX").unwrap();
        let err = read_header(&mut Cursor::new(&buf), SNAP_MAGIC).unwrap_err();
        assert!(matches!(err, FormatError::InvalidMagic));
    }

    #[test]
    fn header_wrong_version() {
        let buf = vec![b'K', b'S', b'N', b'P', 99];
        let err = read_header(&mut Cursor::new(&buf), SNAP_MAGIC).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedVersion(99)));
    }

    #[test]
    fn crc32_deterministic() {
        let a = crc32(b"test data");
        let b = crc32(b"test data");
        assert_eq!(a, b);
        assert_ne!(a, crc32(b"different data"));
    }

    #[test]
    fn verify_crc32_fail() {
        let err = verify_crc32(b"data", 0xBAD).unwrap_err();
        assert!(matches!(err, FormatError::ChecksumMismatch { .. }));
    }

    #[test]
    fn truncated_input_returns_eof() {
        let buf = [0u8; 2];
        let err = read_u32(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::UnexpectedEof));
    }

    #[test]
    fn read_bytes_rejects_oversized_length() {
        let bogus_len = (MAX_FIELD_LEN as u32).saturating_add(1);
        let mut buf = Vec::new();
        write_u32(&mut buf, bogus_len).unwrap();
        let err = read_bytes(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::InvalidData(_)));
    }
}
