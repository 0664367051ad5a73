//! The append-only database file.
//!
//! One `DbFile` wraps one on-disk file. All writes are appends of framed
//! records (see [`crate::formats`]); nothing is ever overwritten in place.
//! Readers address frames by the byte offset of the frame's first byte
//! (a **pointer**) and re-validate kind and CRC on every read.
//!
//! Headers are ordinary appended frames. On open, the file is scanned
//! forward with a best-effort-tail posture and the freshest valid header
//! frame wins; a torn tail after it (crash mid-append) is ignored. Bit rot
//! *between* committed headers is not detected by the open scan; it surfaces
//! as a CRC mismatch on the first pointer read into the damaged range.
//!
//! Vocabulary note:
//! - `append_*` makes bytes visible to readers of this process immediately.
//! - Stable-storage durability requires an explicit [`DbFile::sync`] barrier,
//!   and for create/rename, [`sync_parent_dir`].

use crate::error::{DbError, DbResult};
use crate::formats::{
    self, FrameKind, FramePrologue, ScanMode, DB_MAGIC, FILE_PROLOGUE_SIZE, FRAME_PROLOGUE_SIZE,
    FRAME_VERSION,
};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static NEXT_FILE_TAG: AtomicU64 = AtomicU64::new(1);

/// An open append-only database file.
///
/// Appends are serialized internally; positional reads take no lock, so a
/// compactor can read the file while the updater keeps appending.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    tag: u64,
    tail: Mutex<u64>,
}

impl DbFile {
    /// Create a fresh file at `path`, failing if it already exists.
    pub fn create(path: &Path) -> DbResult<DbFile> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut prologue = Vec::with_capacity(FILE_PROLOGUE_SIZE as usize);
        prologue.extend_from_slice(&DB_MAGIC);
        prologue.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        file.write_all_at(&prologue, 0)?;
        Ok(DbFile {
            file,
            tag: NEXT_FILE_TAG.fetch_add(1, Ordering::Relaxed),
            tail: Mutex::new(FILE_PROLOGUE_SIZE),
        })
    }

    /// Open an existing file at `path`, validating the prologue.
    ///
    /// A torn tail left by a crash (partial frame after the last complete
    /// one) is repaired by truncating the file back to the last valid frame
    /// boundary, so later appends keep the file a clean frame sequence.
    pub fn open(path: &Path) -> DbResult<DbFile> {
        let file = match std::fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DbError::MissingPath(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < FILE_PROLOGUE_SIZE {
            return Err(DbError::Format("file too short for prologue".into()));
        }
        let mut prologue = [0u8; FILE_PROLOGUE_SIZE as usize];
        file.read_exact_at(&mut prologue, 0)?;
        if prologue[..4] != DB_MAGIC {
            return Err(DbError::Format("invalid database magic".into()));
        }
        let version = u32::from_le_bytes([prologue[4], prologue[5], prologue[6], prologue[7]]);
        if version != FRAME_VERSION {
            return Err(DbError::Format(format!(
                "frame format version mismatch (got {version}, expected {FRAME_VERSION})"
            )));
        }
        let (valid_end, _) = scan_frames(&file, len)?;
        if valid_end < len {
            file.set_len(valid_end)?;
        }
        Ok(DbFile {
            file,
            tag: NEXT_FILE_TAG.fetch_add(1, Ordering::Relaxed),
            tail: Mutex::new(valid_end),
        })
    }

    /// Process-unique tag for this open file.
    ///
    /// Used to detect a compaction swap between preparing a write and
    /// flushing it: data bound to a different tag than the live file's must
    /// be resubmitted.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Current logical length in bytes.
    pub fn len(&self) -> u64 {
        *self.tail.lock().expect("file tail lock poisoned")
    }

    /// Whether the file holds no frames yet.
    pub fn is_empty(&self) -> bool {
        self.len() <= FILE_PROLOGUE_SIZE
    }

    fn append(&self, kind: FrameKind, payload: &[u8]) -> DbResult<u64> {
        let encoded = formats::encode_frame(kind, payload)?;
        let mut tail = self.tail.lock().expect("file tail lock poisoned");
        let ptr = *tail;
        self.file.write_all_at(&encoded, ptr)?;
        *tail += encoded.len() as u64;
        Ok(ptr)
    }

    /// Append raw bytes as a chunk frame, returning its pointer.
    pub fn append_chunk(&self, bytes: &[u8]) -> DbResult<u64> {
        self.append(FrameKind::Chunk, bytes)
    }

    /// Append a postcard-encoded term frame, returning its pointer.
    pub fn append_term<T: serde::Serialize>(&self, value: &T) -> DbResult<u64> {
        let payload =
            postcard::to_allocvec(value).map_err(|e| DbError::Encode(e.to_string()))?;
        self.append(FrameKind::Term, &payload)
    }

    /// Append a header frame (already-encoded header payload).
    pub fn append_header(&self, payload: &[u8]) -> DbResult<u64> {
        self.append(FrameKind::Header, payload)
    }

    fn pread(&self, ptr: u64, expected: FrameKind) -> DbResult<Vec<u8>> {
        let len = self.len();
        if ptr < FILE_PROLOGUE_SIZE || ptr >= len {
            return Err(DbError::Format(format!(
                "pointer {ptr} outside file bounds ({len} bytes)"
            )));
        }
        let mut head = [0u8; FRAME_PROLOGUE_SIZE];
        self.file.read_exact_at(&mut head, ptr)?;
        let mut cur = std::io::Cursor::new(&head[..]);
        let prologue = formats::decode_prologue(&mut cur, ScanMode::Strict)?
            .ok_or_else(|| DbError::Format("empty frame prologue".into()))?;
        if prologue.kind != expected {
            return Err(DbError::Format(format!(
                "frame kind mismatch at {ptr} (expected {expected:?}, got {:?})",
                prologue.kind
            )));
        }
        let payload_len = prologue.payload_len()?;
        let mut payload = vec![0u8; payload_len];
        self.file
            .read_exact_at(&mut payload, ptr + FRAME_PROLOGUE_SIZE as u64)?;
        let computed = crc32fast::hash(&payload);
        if computed != prologue.checksum {
            return Err(DbError::CrcMismatch {
                expected: prologue.checksum,
                actual: computed,
            });
        }
        Ok(payload)
    }

    /// Read a chunk frame at `ptr`.
    pub fn pread_chunk(&self, ptr: u64) -> DbResult<Vec<u8>> {
        self.pread(ptr, FrameKind::Chunk)
    }

    /// Read and decode a term frame at `ptr`.
    pub fn pread_term<T: serde::de::DeserializeOwned>(&self, ptr: u64) -> DbResult<T> {
        let payload = self.pread(ptr, FrameKind::Term)?;
        postcard::from_bytes(&payload).map_err(|e| DbError::Decode(e.to_string()))
    }

    /// Return the payload of the freshest valid header frame, or `None` for
    /// a file holding no committed header.
    pub fn read_last_header(&self) -> DbResult<Option<Vec<u8>>> {
        let (_, last) = scan_frames(&self.file, self.len())?;
        Ok(last)
    }

    /// `fsync` the file (stable-storage barrier).
    pub fn sync(&self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Scan frames forward from the prologue and return:
/// - the valid prefix length (byte offset of the last clean frame boundary),
/// - the payload of the last valid header frame in that prefix (if any).
///
/// Non-header frames are skipped by length without CRC validation; a header
/// frame failing its CRC, or any framing anomaly, ends the scan (torn-tail
/// posture). The caller repairs torn tails by truncating to the boundary.
fn scan_frames(file: &File, len: u64) -> DbResult<(u64, Option<Vec<u8>>)> {
    let mut offset = FILE_PROLOGUE_SIZE.min(len);
    let mut last: Option<Vec<u8>> = None;

    while offset + FRAME_PROLOGUE_SIZE as u64 <= len {
        let mut head = [0u8; FRAME_PROLOGUE_SIZE];
        file.read_exact_at(&mut head, offset)?;
        let mut cur = std::io::Cursor::new(&head[..]);
        let prologue: FramePrologue =
            match formats::decode_prologue(&mut cur, ScanMode::BestEffortTail) {
                Ok(Some(p)) => p,
                Ok(None) | Err(_) => break,
            };
        let Ok(payload_len) = prologue.payload_len() else {
            break;
        };
        let end = offset + prologue.length as u64;
        if end > len {
            // Torn tail: the frame extends past the physical end.
            break;
        }
        if prologue.kind == FrameKind::Header {
            let mut payload = vec![0u8; payload_len];
            file.read_exact_at(&mut payload, offset + FRAME_PROLOGUE_SIZE as u64)?;
            if crc32fast::hash(&payload) != prologue.checksum {
                break;
            }
            last = Some(payload);
        }
        offset = end;
    }
    Ok((offset, last))
}

/// Attempt to `fsync` the parent directory of `path`.
///
/// This is the commonly-missed step needed to make *names* durable:
/// durable file creation and durable atomic rename. On some filesystems the
/// rename/create does not survive power loss until the directory is synced.
pub fn sync_parent_dir(path: &Path) -> DbResult<()> {
    let Some(parent) = path.parent() else {
        return Err(DbError::InvalidState(format!(
            "path has no parent directory: {path:?}"
        )));
    };
    let f = File::open(parent)?;
    f.sync_all()?;
    Ok(())
}

/// Delete `path` if it exists. Missing files are not an error.
pub fn delete_file(path: &Path) -> DbResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Atomically rename `from` over `to` and sync the destination directory.
pub fn rename_file(from: &Path, to: &Path) -> DbResult<()> {
    std::fs::rename(from, to)?;
    sync_parent_dir(to)?;
    Ok(())
}

/// Sibling path used by a running compaction (`<path>.compact`).
pub fn compact_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".compact");
    PathBuf::from(name)
}
