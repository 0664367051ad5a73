//! Error types for `docstore`.

use std::path::PathBuf;

/// Result type for document-store operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors returned by the `docstore` crate.
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Format error (corrupt, unexpected, unsupported).
    #[error("format error: {0}")]
    Format(String),

    /// CRC mismatch (data corruption detected).
    #[error("crc mismatch (expected {expected:#010x}, got {actual:#010x})")]
    CrcMismatch {
        /// CRC stored in the frame prologue.
        expected: u32,
        /// CRC computed from the bytes that were read.
        actual: u32,
    },

    /// Encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding error.
    #[error("decode error: {0}")]
    Decode(String),

    /// The file carries a disk version this build cannot read.
    ///
    /// Fatal at open; the file must be written by a build that still speaks
    /// the old version, or compacted by one before this build opens it.
    #[error("unsupported database disk version {found} (supported: {min}..={max})")]
    DiskVersion {
        /// Version tag found in the header record.
        found: u32,
        /// Oldest version this build upgrades in place.
        min: u32,
        /// Current version this build writes.
        max: u32,
    },

    /// A purge was requested while a compaction is running.
    ///
    /// Operational refusal; state is unchanged. Retry after the compaction
    /// finishes or is cancelled.
    #[error("cannot purge while compaction is running")]
    PurgeDuringCompaction,

    /// A pending write raced a compaction swap.
    ///
    /// The batch carried attachment data bound to a file that is no longer
    /// the live one. No state was mutated; every client in the batch must
    /// resubmit against the new file.
    #[error("write raced a compaction swap, resubmit")]
    Retry,

    /// Invalid state (operation not allowed in current state).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The updater actor has terminated; the command channel is closed.
    #[error("database updater has shut down")]
    UpdaterGone,

    /// Requested path does not exist.
    #[error("missing path: {0}")]
    MissingPath(PathBuf),
}
