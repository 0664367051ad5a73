//! On-disk format constants and the frame codec.
//!
//! Every append to a database file is one **frame**. Headers, b-tree nodes,
//! purged-rev lists and raw document chunks all share this framing so that a
//! single forward scan can recover the freshest committed header after a
//! crash.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **File prologue**: `[DB_MAGIC][FRAME_VERSION:u32]` at byte 0
//!   (little-endian for integers).
//! - **Frame framing**: `[length:u32][kind:u8][crc32:u32][payload...]`;
//!   `length` covers the whole frame including the 9-byte prologue.
//! - **Checksum**: `crc32fast` over the payload bytes.
//! - **Pointers** stored anywhere in the database are byte offsets of a
//!   frame's first byte; reads at a pointer re-validate kind and CRC.
//!
//! ## Recovery posture
//!
//! Scanning supports strict and best-effort-tail modes, the common stance of
//! append-only stores: scan forward validating framing and stop at the first
//! *truncated* tail frame. Corruption before the stop point is an error in
//! strict mode.

use crate::error::{DbError, DbResult};
use std::io::Read;

/// Magic bytes at the start of a database file.
pub const DB_MAGIC: [u8; 4] = *b"DSDB";
/// Current frame-layer format version.
pub const FRAME_VERSION: u32 = 1;
/// Size of the file prologue in bytes.
pub const FILE_PROLOGUE_SIZE: u64 = 8;

/// Oldest header disk version this build upgrades in-memory on open.
pub const DISK_VERSION_MIN: u32 = 4;
/// Disk version written by this build.
pub const DISK_VERSION: u32 = 6;

/// Hard cap to avoid unbounded allocations on corrupt files.
pub const MAX_FRAME_PAYLOAD_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Number of bytes in a frame prologue (`length + kind + crc32`).
pub const FRAME_PROLOGUE_SIZE: usize = 4 + 1 + 4;

/// What a frame's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Raw bytes (document summary or attachment data).
    Chunk,
    /// A postcard-encoded term (b-tree node, purged list, security blob).
    Term,
    /// A postcard-encoded database header record.
    Header,
}

impl FrameKind {
    /// The on-disk tag byte for this kind.
    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Chunk => 0,
            FrameKind::Term => 1,
            FrameKind::Header => 2,
        }
    }

    /// Decode a tag byte.
    pub fn from_tag(tag: u8) -> DbResult<Self> {
        match tag {
            0 => Ok(FrameKind::Chunk),
            1 => Ok(FrameKind::Term),
            2 => Ok(FrameKind::Header),
            other => Err(DbError::Format(format!("unknown frame kind {other}"))),
        }
    }
}

/// Error-handling posture for frame scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Treat any corruption/truncation as an error.
    Strict,
    /// Treat a truncated tail frame (torn write) as EOF.
    ///
    /// Note: this does *not* mean "ignore corruption". CRC and kind failures
    /// remain errors.
    BestEffortTail,
}

/// Encode a frame ready for appending.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> DbResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_PAYLOAD_BYTES {
        return Err(DbError::Format(format!(
            "frame payload too large: {} bytes (max {MAX_FRAME_PAYLOAD_BYTES})",
            payload.len()
        )));
    }
    let checksum = crc32fast::hash(payload);
    let length_u64 = FRAME_PROLOGUE_SIZE as u64 + payload.len() as u64;
    let length =
        u32::try_from(length_u64).map_err(|_| DbError::Format("frame too large".into()))?;

    let mut encoded = Vec::with_capacity(FRAME_PROLOGUE_SIZE + payload.len());
    encoded.extend_from_slice(&length.to_le_bytes());
    encoded.push(kind.tag());
    encoded.extend_from_slice(&checksum.to_le_bytes());
    encoded.extend_from_slice(payload);
    Ok(encoded)
}

/// A decoded frame prologue.
#[derive(Debug, Clone, Copy)]
pub struct FramePrologue {
    /// Total frame length including the prologue itself.
    pub length: u32,
    /// Payload kind.
    pub kind: FrameKind,
    /// CRC32 stored for the payload.
    pub checksum: u32,
}

impl FramePrologue {
    /// Payload length implied by the stored frame length.
    pub fn payload_len(&self) -> DbResult<usize> {
        let len = self.length as usize;
        if len < FRAME_PROLOGUE_SIZE {
            return Err(DbError::Format("frame length < prologue".into()));
        }
        let payload = len - FRAME_PROLOGUE_SIZE;
        if payload > MAX_FRAME_PAYLOAD_BYTES {
            return Err(DbError::Format(format!(
                "frame payload too large: {payload} bytes"
            )));
        }
        Ok(payload)
    }
}

fn read_u32_len<R: Read>(reader: &mut R, mode: ScanMode) -> DbResult<Option<u32>> {
    // Distinguish:
    // - clean EOF at frame boundary (0 bytes available) => Ok(None)
    // - truncated length prefix (1-3 bytes) => error in Strict, EOF in BestEffortTail
    let mut first = [0u8; 1];
    match reader.read_exact(&mut first) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut rest = [0u8; 3];
    if let Err(e) = reader.read_exact(&mut rest) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return match mode {
                ScanMode::Strict => Err(e.into()),
                ScanMode::BestEffortTail => Ok(None),
            };
        }
        return Err(e.into());
    }

    let bytes = [first[0], rest[0], rest[1], rest[2]];
    Ok(Some(u32::from_le_bytes(bytes)))
}

/// Decode the next frame prologue, returning `Ok(None)` at EOF.
///
/// In `BestEffortTail` mode, a torn prologue is treated as EOF. A bad kind
/// tag is always an error.
pub fn decode_prologue<R: Read>(reader: &mut R, mode: ScanMode) -> DbResult<Option<FramePrologue>> {
    let Some(length) = read_u32_len(reader, mode)? else {
        return Ok(None);
    };
    let mut tail = [0u8; 5];
    if let Err(e) = reader.read_exact(&mut tail) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return match mode {
                ScanMode::Strict => Err(e.into()),
                ScanMode::BestEffortTail => Ok(None),
            };
        }
        return Err(e.into());
    }
    let kind = FrameKind::from_tag(tail[0])?;
    let checksum = u32::from_le_bytes([tail[1], tail[2], tail[3], tail[4]]);
    Ok(Some(FramePrologue {
        length,
        kind,
        checksum,
    }))
}

/// Decode a full frame (prologue + payload), returning `Ok(None)` at EOF.
///
/// The payload CRC is always verified; a mismatch is an error in both modes.
pub fn decode_frame<R: Read>(
    reader: &mut R,
    mode: ScanMode,
) -> DbResult<Option<(FrameKind, Vec<u8>)>> {
    let Some(prologue) = decode_prologue(reader, mode)? else {
        return Ok(None);
    };
    let payload_len = prologue.payload_len()?;
    let mut payload = vec![0u8; payload_len];
    if let Err(e) = reader.read_exact(&mut payload) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return match mode {
                ScanMode::Strict => Err(e.into()),
                ScanMode::BestEffortTail => Ok(None),
            };
        }
        return Err(e.into());
    }

    let computed = crc32fast::hash(&payload);
    if computed != prologue.checksum {
        return Err(DbError::CrcMismatch {
            expected: prologue.checksum,
            actual: computed,
        });
    }
    Ok(Some((prologue.kind, payload)))
}
