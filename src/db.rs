//! Open database state and the commit protocol.
//!
//! A [`Db`] is the full mutable state of one database file: the open file,
//! the in-memory copy of the last committed header, the three trees and the
//! counters. It is owned exclusively by the updater actor; readers get
//! cheap clones (`Arc`'d file plus root pointers) that see a consistent
//! committed-or-later view.
//!
//! ## Commit ordering
//!
//! `commit` never writes a header over unsynced data: with the default
//! [`FsyncOptions`](crate::config::FsyncOptions), the sequence is
//! data-fsync, header append, header-fsync. Headers are append-only; after
//! a crash the freshest valid header wins and everything behind it is
//! durable.

use crate::btree::{Btree, Fold};
use crate::codec::{ByIdSpec, BySeqSpec, LocalSpec};
use crate::config::DbConfig;
use crate::dbfile::{self, DbFile};
use crate::docs::{
    Attachment, AttachmentRef, DocId, DocInfo, FullDocInfo, LocalDoc, RevId, Summary,
};
use crate::error::{DbError, DbResult};
use crate::header::DbHeader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One open database.
#[derive(Clone)]
pub struct Db {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) file: Arc<DbFile>,
    /// In-memory copy of the last committed header.
    pub(crate) header: DbHeader,
    pub(crate) by_id: Btree<ByIdSpec>,
    pub(crate) by_seq: Btree<BySeqSpec>,
    pub(crate) local: Btree<LocalSpec>,
    pub(crate) update_seq: u64,
    pub(crate) committed_update_seq: u64,
    pub(crate) purge_seq: u64,
    pub(crate) purged_docs: Option<u64>,
    pub(crate) revs_limit: u64,
    pub(crate) security: Vec<u8>,
    pub(crate) security_ptr: Option<u64>,
    pub(crate) config: DbConfig,
    pub(crate) instance_start_time: u64,
}

impl Db {
    /// Open (or create) the database at `path`.
    ///
    /// With `create`, the file must not exist and a fresh default header is
    /// committed immediately. Without it, the file must exist; a file with
    /// no valid header gets a fresh default header too. A stale
    /// `<path>.compact` sibling from an interrupted compaction is deleted.
    pub fn open(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        create: bool,
        config: DbConfig,
    ) -> DbResult<Db> {
        let path = path.into();
        dbfile::delete_file(&dbfile::compact_path(&path))?;

        let file = if create {
            Arc::new(DbFile::create(&path)?)
        } else {
            Arc::new(DbFile::open(&path)?)
        };
        if config.fsync.on_file_open {
            file.sync()?;
            dbfile::sync_parent_dir(&path)?;
        }
        Self::init(name.into(), path, file, config)
    }

    /// Build state from an already-open file, committing a default header
    /// if the file has none.
    pub(crate) fn init(
        name: String,
        path: PathBuf,
        file: Arc<DbFile>,
        config: DbConfig,
    ) -> DbResult<Db> {
        let stored = file.read_last_header()?;
        let had_header = stored.is_some();
        let header = match stored {
            Some(payload) => DbHeader::decode(&payload)?,
            None => DbHeader::default(),
        };

        let security = match header.security_ptr {
            Some(ptr) => file.pread_term(ptr)?,
            None => Vec::new(),
        };

        let by_id = Btree::open(Arc::clone(&file), &header.by_id_state)?;
        let by_seq = Btree::open(Arc::clone(&file), &header.by_seq_state)?;
        let local = Btree::open(Arc::clone(&file), &header.local_state)?;

        let instance_start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| DbError::InvalidState("system clock before epoch".into()))?
            .as_micros() as u64;

        let mut db = Db {
            name,
            path,
            update_seq: header.update_seq,
            committed_update_seq: header.update_seq,
            purge_seq: header.purge_seq,
            purged_docs: header.purged_docs,
            revs_limit: header.revs_limit,
            security,
            security_ptr: header.security_ptr,
            header,
            file,
            by_id,
            by_seq,
            local,
            config,
            instance_start_time,
        };
        if !had_header {
            // Fresh or headerless file: write the default header now so a
            // reopen finds a committed state.
            let header = db.build_header()?;
            db.write_header(header)?;
        }
        Ok(db)
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Microsecond timestamp taken when this state was opened; clients use
    /// it to detect restarts.
    pub fn instance_start_time(&self) -> u64 {
        self.instance_start_time
    }

    /// Current update sequence (possibly ahead of the committed one).
    pub fn update_seq(&self) -> u64 {
        self.update_seq
    }

    /// Update sequence covered by the last committed header.
    pub fn committed_update_seq(&self) -> u64 {
        self.committed_update_seq
    }

    /// Current purge sequence.
    pub fn purge_seq(&self) -> u64 {
        self.purge_seq
    }

    /// Maximum revision-tree depth retained after stemming.
    pub fn revs_limit(&self) -> u64 {
        self.revs_limit
    }

    /// The security policy blob (empty if never set).
    pub fn security(&self) -> &[u8] {
        &self.security
    }

    /// Live and deleted document counts from the by-id reduction.
    pub fn doc_counts(&self) -> (u64, u64) {
        match self.by_id.reduction() {
            Some(r) => (r.not_deleted, r.deleted),
            None => (0, 0),
        }
    }

    /// Total document size from the by-id reduction; `None` while legacy
    /// records without sizes remain.
    pub fn total_doc_size(&self) -> Option<u64> {
        match self.by_id.reduction() {
            Some(r) => r.size,
            None => Some(0),
        }
    }

    /// Compute the header describing the current state.
    pub(crate) fn build_header(&self) -> DbResult<DbHeader> {
        Ok(DbHeader {
            update_seq: self.update_seq,
            purge_seq: self.purge_seq,
            purged_docs: self.purged_docs,
            by_id_state: self.by_id.get_state()?,
            by_seq_state: self.by_seq.get_state()?,
            local_state: self.local.get_state()?,
            security_ptr: self.security_ptr,
            revs_limit: self.revs_limit,
        })
    }

    /// Commit the current state: append a header framed by the configured
    /// fsync barriers. A no-op when the state already equals the last
    /// committed header. Returns whether a header was written.
    pub(crate) fn commit(&mut self) -> DbResult<bool> {
        let header = self.build_header()?;
        if header == self.header {
            return Ok(false);
        }
        self.write_header(header)?;
        Ok(true)
    }

    fn write_header(&mut self, header: DbHeader) -> DbResult<()> {
        if self.config.fsync.before_header {
            self.file.sync()?;
        }
        self.file.append_header(&header.encode()?)?;
        if self.config.fsync.after_header {
            self.file.sync()?;
        }
        self.header = header;
        self.committed_update_seq = self.update_seq;
        tracing::debug!(
            db = %self.name,
            update_seq = self.update_seq,
            purge_seq = self.purge_seq,
            "committed header"
        );
        Ok(())
    }

    /// Look up a document's full record by id.
    pub fn full_doc_info(&self, id: &DocId) -> DbResult<Option<FullDocInfo>> {
        self.by_id.lookup_one(id)
    }

    /// Read back a document: its winning (or explicitly named) revision.
    pub fn open_doc(&self, id: &DocId, rev: Option<RevId>) -> DbResult<Option<DocRead>> {
        let Some(info) = self.by_id.lookup_one(id)? else {
            return Ok(None);
        };
        let (rev, leaf) = match rev {
            None => match info.winning_rev() {
                Some(found) => found,
                None => return Ok(None),
            },
            Some(rev) => {
                let value = info.rev_tree.find(rev.pos, &rev.hash).cloned();
                match value {
                    Some(crate::docs::NodeValue::Leaf(leaf)) => (rev, leaf),
                    _ => return Ok(None),
                }
            }
        };
        let crate::docs::BodyState::OnDisk(ptr) = leaf.body else {
            return Err(DbError::InvalidState("committed leaf without body".into()));
        };
        let summary = read_summary(&self.file, ptr)?;
        Ok(Some(DocRead {
            id: id.clone(),
            rev,
            deleted: leaf.deleted,
            body: summary.body,
            atts: summary.atts,
        }))
    }

    /// Read an attachment's bytes through its descriptor.
    pub fn read_attachment(&self, att: &AttachmentRef) -> DbResult<Vec<u8>> {
        self.file.pread_chunk(att.ptr)
    }

    /// Read a local (non-replicated) document.
    pub fn open_local_doc(&self, id: &DocId) -> DbResult<Option<LocalDoc>> {
        self.local.lookup_one(id)
    }

    /// Fold doc-infos in update-seq order, starting after `since`.
    pub fn fold_changes<F>(&self, since: u64, f: &mut F) -> DbResult<Fold>
    where
        F: FnMut(DocInfo) -> DbResult<Fold>,
    {
        self.by_seq.foldl(Some(&(since + 1)), f)
    }
}

/// A decoded document returned by [`Db::open_doc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRead {
    /// Document id.
    pub id: DocId,
    /// Revision that was read.
    pub rev: RevId,
    /// Whether this revision is a deletion.
    pub deleted: bool,
    /// Body bytes.
    pub body: Vec<u8>,
    /// Attachment descriptors (read via [`Db::read_attachment`]).
    pub atts: Vec<AttachmentRef>,
}

/// Append a document summary and its attachments to `file`.
///
/// Attachment chunks go first so the summary can point at them; returns the
/// summary pointer and the total leaf size (summary payload plus attachment
/// lengths).
pub(crate) fn write_summary(
    file: &DbFile,
    body: &[u8],
    atts: &[Attachment],
) -> DbResult<(u64, u64)> {
    let mut refs = Vec::with_capacity(atts.len());
    let mut atts_len = 0u64;
    for att in atts {
        let ptr = file.append_chunk(&att.data)?;
        atts_len += att.data.len() as u64;
        refs.push(AttachmentRef {
            name: att.name.clone(),
            ptr,
            len: att.data.len() as u64,
        });
    }
    let summary = Summary {
        body: body.to_vec(),
        atts: refs,
    };
    let payload = postcard::to_allocvec(&summary).map_err(|e| DbError::Encode(e.to_string()))?;
    let ptr = file.append_chunk(&payload)?;
    Ok((ptr, payload.len() as u64 + atts_len))
}

/// Read a summary chunk back.
pub(crate) fn read_summary(file: &DbFile, ptr: u64) -> DbResult<Summary> {
    let payload = file.pread_chunk(ptr)?;
    postcard::from_bytes(&payload).map_err(|e| DbError::Decode(e.to_string()))
}
