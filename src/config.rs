//! Configuration snapshots.
//!
//! These are read once at well-defined points (database open, compaction
//! start) and passed in by value, never consulted ambiently, so a running
//! operation is immune to concurrent reconfiguration.

/// Which durability barriers the commit path performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsyncOptions {
    /// `fsync` the data before appending a header, so the header never
    /// points at unsynced bytes.
    pub before_header: bool,
    /// `fsync` after appending a header, so the commit itself is durable
    /// when the call returns.
    pub after_header: bool,
    /// `fsync` right after opening a file.
    pub on_file_open: bool,
}

impl Default for FsyncOptions {
    fn default() -> Self {
        FsyncOptions {
            before_header: true,
            after_header: true,
            on_file_open: true,
        }
    }
}

/// Compaction tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionConfig {
    /// Bytes of doc-info buffered before a copy flush.
    pub doc_buffer_size: usize,
    /// Bytes copied between target header commits.
    pub checkpoint_after: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        let doc_buffer_size = 524_288;
        CompactionConfig {
            doc_buffer_size,
            checkpoint_after: doc_buffer_size as u64 * 10,
        }
    }
}

/// Everything a database open needs to know.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Durability barriers.
    pub fsync: FsyncOptions,
    /// Compaction tuning.
    pub compaction: CompactionConfig,
}
