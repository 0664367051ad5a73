//! Live compaction: rebuild the database file in a sibling while the
//! updater keeps serving writes, then atomically swap.
//!
//! The compactor runs on its own thread against a frozen snapshot of the
//! source state (root pointers and counters at spawn time). It reads the
//! source file purely positionally, owns the `<path>.compact` target file
//! outright, and communicates exactly once: the terminal `compact_done`
//! callback. The updater performs the swap, so no partial state is ever
//! visible, and a target that fell behind the moving tail is respawned
//! rather than swapped.
//!
//! ## Crash safety
//!
//! The target commits its own header every `checkpoint_after` copied
//! bytes. An interrupted compaction leaves a `<path>.compact` with a valid
//! header; the next run resumes from the target's `update_seq` instead of
//! starting over (`retry` mode).

use crate::db::{self, Db};
use crate::dbfile::{self, DbFile};
use crate::docs::{DocId, DocInfo, FullDocInfo, LeafValue, LocalDoc, NodeValue, RevId};
use crate::error::{DbError, DbResult};
use crate::keytree::NodeKind;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::btree::Fold;

/// Handle to a running compactor task.
pub struct CompactorHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CompactorHandle {
    /// Ask the task to stop and wait for it.
    pub(crate) fn cancel_and_join(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Wait for the task without cancelling it.
    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn a compactor against a snapshot of `source`.
///
/// `done` fires with the target path once the copy loop has caught up to
/// the snapshot's `update_seq`. It does not fire on cancellation or error.
pub(crate) fn spawn(
    source: Db,
    done: impl FnOnce(PathBuf) + Send + 'static,
) -> CompactorHandle {
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_for_task = Arc::clone(&cancel);
    let thread = std::thread::Builder::new()
        .name(format!("compact:{}", source.name()))
        .spawn(move || match run(&source, &cancel_for_task) {
            Ok(Some(path)) => done(path),
            Ok(None) => {
                tracing::debug!(db = %source.name(), "compaction cancelled");
            }
            Err(e) => {
                tracing::warn!(db = %source.name(), error = %e, "compaction failed");
            }
        })
        .expect("spawning compactor thread");
    CompactorHandle {
        cancel,
        thread: Some(thread),
    }
}

/// Path of the partial output for `source`, for cleanup after cancel.
pub(crate) fn target_path_for(source: &Db) -> PathBuf {
    dbfile::compact_path(source.path())
}

fn open_target(source: &Db) -> DbResult<(Db, bool)> {
    let path = target_path_for(source);
    let resumed = (|| -> DbResult<Option<Db>> {
        let file = match DbFile::open(&path) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };
        if file.read_last_header()?.is_none() {
            return Ok(None);
        }
        let db = Db::init(
            source.name().to_string(),
            path.clone(),
            Arc::new(file),
            source.config.clone(),
        )?;
        Ok(Some(db))
    })()
    .unwrap_or(None);

    match resumed {
        Some(db) => {
            tracing::info!(
                db = %source.name(),
                resume_seq = db.update_seq(),
                "resuming interrupted compaction"
            );
            Ok((db, true))
        }
        None => {
            dbfile::delete_file(&path)?;
            let db = Db::open(
                source.name().to_string(),
                path,
                true,
                source.config.clone(),
            )?;
            Ok((db, false))
        }
    }
}

// Copy one summary (and its attachments) from `source` into `target`,
// returning the new pointer, the leaf size and the bytes written.
fn copy_summary(source: &Db, target: &Db, ptr: u64) -> DbResult<(u64, u64, u64)> {
    let summary = db::read_summary(&source.file, ptr)?;
    let mut copied = 0u64;
    let mut atts = Vec::with_capacity(summary.atts.len());
    for att in &summary.atts {
        let data = source.file.pread_chunk(att.ptr)?;
        copied += data.len() as u64;
        let new_ptr = target.file.append_chunk(&data)?;
        atts.push(crate::docs::AttachmentRef {
            name: att.name.clone(),
            ptr: new_ptr,
            len: data.len() as u64,
        });
    }
    let payload = postcard::to_allocvec(&crate::docs::Summary {
        body: summary.body,
        atts,
    })
    .map_err(|e| DbError::Encode(e.to_string()))?;
    copied += payload.len() as u64;
    let new_ptr = target.file.append_chunk(&payload)?;
    let atts_len: u64 = summary.atts.iter().map(|a| a.len).sum();
    Ok((new_ptr, payload.len() as u64 + atts_len, copied))
}

// Copy a flushed batch of doc-infos into the target. Returns bytes written.
fn copy_docs(
    source: &Db,
    target: &mut Db,
    batch: &[DocInfo],
    retry: bool,
) -> DbResult<u64> {
    // Under id-ascending uniqueness, keep only the first info per id.
    let mut seen: HashSet<&DocId> = HashSet::new();
    let mut ids: Vec<DocId> = Vec::new();
    for info in batch {
        if seen.insert(&info.id) {
            ids.push(info.id.clone());
        }
    }

    let lookups = source.by_id.lookup(&ids)?;
    let mut copied = 0u64;
    let mut new_infos: Vec<FullDocInfo> = Vec::new();
    for (id, lookup) in ids.iter().zip(lookups) {
        let Some(mut info) = lookup else {
            // Deleted (purged) between snapshot and copy; skip.
            tracing::debug!(db = %source.name(), id = %id, "doc vanished during copy");
            continue;
        };
        let mut copy_err: DbResult<()> = Ok(());
        let tree = info.rev_tree.map(|_pos, _hash, kind, value| {
            if copy_err.is_err() {
                return NodeValue::Missing;
            }
            match (kind, value) {
                (NodeKind::Leaf, NodeValue::Leaf(leaf)) => {
                    let crate::docs::BodyState::OnDisk(ptr) = &leaf.body else {
                        copy_err = Err(DbError::InvalidState(
                            "unflushed leaf in committed tree".into(),
                        ));
                        return NodeValue::Missing;
                    };
                    match copy_summary(source, target, *ptr) {
                        Ok((new_ptr, size, bytes)) => {
                            copied += bytes;
                            NodeValue::Leaf(LeafValue {
                                deleted: leaf.deleted,
                                body: crate::docs::BodyState::OnDisk(new_ptr),
                                seq: leaf.seq,
                                size: Some(size),
                            })
                        }
                        Err(e) => {
                            copy_err = Err(e);
                            NodeValue::Missing
                        }
                    }
                }
                // Interior payloads are dropped; compaction keeps only
                // reachable leaves.
                _ => NodeValue::Missing,
            }
        });
        copy_err?;
        info.rev_tree = tree;
        info.rev_tree.stem(source.revs_limit());
        let high_seq = info.update_seq;
        info.refresh_aggregates();
        info.update_seq = high_seq;
        new_infos.push(info);
    }

    let mut remove_seqs: Vec<u64> = Vec::new();
    if retry {
        for (existing, id) in target.by_id.lookup(&ids)?.into_iter().zip(&ids) {
            if let Some(existing) = existing {
                debug_assert_eq!(&existing.id, id);
                remove_seqs.push(existing.update_seq);
            }
        }
    }

    let doc_infos: Vec<DocInfo> = new_infos.iter().map(|i| i.to_doc_info()).collect();
    if let Some(last) = doc_infos.last() {
        target.update_seq = last.high_seq;
    }
    target.by_seq.add_remove(doc_infos, remove_seqs)?;
    target.by_id.add_remove(new_infos, Vec::new())?;
    Ok(copied)
}

fn run(source: &Db, cancel: &AtomicBool) -> DbResult<Option<PathBuf>> {
    let source_seq = source.update_seq();
    let (mut target, retry) = open_target(source)?;
    tracing::info!(
        db = %source.name(),
        source_seq,
        target_seq = target.update_seq(),
        retry,
        "compaction pass starting"
    );

    // Carry the purge marker before copying documents.
    if source.purge_seq() > 0 && target.purge_seq() != source.purge_seq() {
        let ptr = source
            .purged_docs
            .ok_or_else(|| DbError::InvalidState("purge_seq > 0 without purged_docs".into()))?;
        let purged: Vec<(DocId, Vec<RevId>)> = source.file.pread_term(ptr)?;
        let new_ptr = target.file.append_term(&purged)?;
        target.purged_docs = Some(new_ptr);
        target.purge_seq = source.purge_seq();
    }

    let buffer_limit = source.config.compaction.doc_buffer_size;
    let checkpoint_after = source.config.compaction.checkpoint_after;

    let mut buffer: Vec<DocInfo> = Vec::new();
    let mut buffered = 0usize;
    let mut since_checkpoint = 0u64;
    let mut cancelled = false;

    let start = target.update_seq() + 1;
    {
        let target = &mut target;
        let buffer = &mut buffer;
        source.by_seq.foldl(Some(&start), &mut |info: DocInfo| {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                return Ok(Fold::Stop);
            }
            // Rough per-entry footprint; exact sizing is not needed, the
            // buffer just bounds memory and batches tree writes.
            buffered += info.id.len() + 48 * info.revs.len() + 24;
            buffer.push(info);
            if buffered >= buffer_limit {
                let copied = copy_docs(source, target, buffer, retry)?;
                buffer.clear();
                buffered = 0;
                since_checkpoint += copied;
                if since_checkpoint >= checkpoint_after {
                    target.commit()?;
                    since_checkpoint = 0;
                }
            }
            Ok(Fold::Continue)
        })?;
    }
    if cancelled {
        return Ok(None);
    }
    if !buffer.is_empty() {
        copy_docs(source, &mut target, &buffer, retry)?;
    }

    // Copy the security blob if it differs.
    if target.security != source.security {
        let ptr = target.file.append_term(&source.security)?;
        target.security = source.security.clone();
        target.security_ptr = Some(ptr);
    }

    // The target now covers everything up to the seq captured at fold
    // start. Writes that landed since then are the updater's problem: it
    // either swaps (if none) or respawns us.
    target.update_seq = source_seq;
    target.commit()?;
    tracing::info!(
        db = %source.name(),
        caught_up_to = source_seq,
        "compaction pass finished"
    );
    Ok(Some(target.path().to_path_buf()))
}

/// Attempt the hand-off: open the finished target and, if it caught the
/// live state, finish it (local docs, preserved settings), swap files and
/// return the new live state. Returns `None` when the target fell behind.
pub(crate) fn install_compacted(live: &Db, target_path: &Path) -> DbResult<Option<Db>> {
    let file = Arc::new(DbFile::open(target_path)?);
    let mut target = Db::init(
        live.name().to_string(),
        target_path.to_path_buf(),
        file,
        live.config.clone(),
    )?;

    if target.update_seq() != live.update_seq() {
        tracing::info!(
            db = %live.name(),
            target_seq = target.update_seq(),
            live_seq = live.update_seq(),
            "compacted file fell behind, restarting compactor"
        );
        return Ok(None);
    }

    // Local docs are never copied by the compactor; dump the live tree.
    let mut locals: Vec<LocalDoc> = Vec::new();
    live.local.foldl(None, &mut |doc: LocalDoc| {
        locals.push(doc);
        Ok(Fold::Continue)
    })?;
    target.local.add(locals)?;

    target.revs_limit = live.revs_limit();
    target.instance_start_time = live.instance_start_time();
    target.commit()?;

    dbfile::delete_file(live.path())?;
    dbfile::rename_file(target_path, live.path())?;

    target.path = live.path().to_path_buf();
    tracing::info!(db = %live.name(), "compaction swapped in");
    Ok(Some(target))
}
