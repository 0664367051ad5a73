//! The write pipeline: folding client batches into committed tree state.
//!
//! One batch flows through fixed phases: old-state lookup, per-doc revision
//! merge (where conflicts are decided and per-doc replies go out), update-
//! seq assignment, summary flush, local-doc application, and the tree
//! writes. Commit and notification stay with the updater actor, which owns
//! the delayed-commit deadline.
//!
//! A [`DbError::Retry`] from the flush aborts the whole batch before any
//! tree mutation: every collected client is told to resubmit and the state
//! is exactly as before.

use crate::db::{self, Db};
use crate::docs::{
    is_design_doc, new_rev_hash, BodyState, Doc, DocId, DocInfo, FullDocInfo, LeafValue,
    LocalDoc, NodeValue, RevId, SummaryDraft,
};
use crate::error::{DbError, DbResult};
use crate::keytree::{self, MergeOutcome, RevTree};
use crate::merger::DocGroup;
use crossbeam_channel::Sender;

/// Per-document result delivered to the originating client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocOutcome {
    /// The revision was accepted; here is its id.
    Written(RevId),
    /// The local document was accepted; here is its new integer rev.
    WrittenLocal(u64),
    /// The edit lost to the conflict policy; state is unchanged for it.
    Conflict,
}

/// Events streamed back to each client of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    /// Result for one document, correlated by the client's ref.
    Doc {
        /// The ref the client attached to the document.
        doc_ref: u64,
        /// What happened to it.
        outcome: DocOutcome,
    },
    /// The batch was applied (not necessarily durable yet).
    Done,
    /// The whole batch raced a compaction swap; resubmit. Any per-doc
    /// results already received for this batch are void.
    Retry,
}

/// An edit to a non-replicated (local) document.
#[derive(Debug, Clone)]
pub struct LocalEdit {
    /// Index into the batch's client list.
    pub client: usize,
    /// Client correlation ref.
    pub doc_ref: u64,
    /// Local document id.
    pub id: DocId,
    /// The revision the client believes is current (`0` for a new doc).
    pub prev_rev: u64,
    /// Delete instead of set.
    pub delete: bool,
    /// New body (ignored for deletes).
    pub body: Vec<u8>,
}

/// A fully assembled batch, possibly coalesced from several requests.
pub(crate) struct UpdateBatch {
    /// Id-sorted document groups.
    pub groups: Vec<DocGroup>,
    /// Local-doc edits.
    pub locals: Vec<LocalEdit>,
    /// Reply channels, indexed by the `client` fields above.
    pub clients: Vec<Sender<WriteEvent>>,
    /// Replication mode: accept every merge.
    pub merge_conflicts: bool,
    /// At least one request demanded a synchronous header commit.
    pub full_commit: bool,
}

/// What the updater needs to know after a batch.
pub(crate) enum BatchOutcome {
    /// The batch was applied.
    Applied {
        /// The update sequence advanced.
        seq_changed: bool,
        /// Design-doc ids touched by the batch.
        ddocs: Vec<DocId>,
    },
    /// The batch was aborted by the attachment-file race; nothing changed.
    Retry,
}

fn send(clients: &[Sender<WriteEvent>], client: usize, event: WriteEvent) {
    // A disappeared client must not take the updater down with it.
    let _ = clients[client].send(event);
}

fn draft_leaf(doc: &Doc) -> NodeValue {
    NodeValue::Leaf(LeafValue {
        deleted: doc.deleted,
        body: BodyState::Unflushed(Box::new(SummaryDraft {
            body: doc.body.clone(),
            atts: doc.atts.clone(),
            atts_file_tag: doc.atts_file_tag,
        })),
        seq: 0,
        size: None,
    })
}

// Fold one id's run of docs into its revision tree, sending per-doc
// replies as each edit is decided.
fn merge_group(
    revs_limit: u64,
    merge_conflicts: bool,
    group: &DocGroup,
    old_info: &FullDocInfo,
    clients: &[Sender<WriteEvent>],
) -> RevTree<NodeValue> {
    let mut acc = old_info.rev_tree.clone();
    let mut old_deleted = old_info.deleted;

    for queued in &group.docs {
        let doc = &queued.doc;
        let reply = |outcome: DocOutcome| {
            send(
                clients,
                queued.client,
                WriteEvent::Doc {
                    doc_ref: queued.doc_ref,
                    outcome,
                },
            );
        };

        if (doc.revs.ids.len() as u64) > doc.revs.start {
            reply(DocOutcome::Conflict);
            continue;
        }

        if merge_conflicts {
            // Replication: the path is taken as given and always accepted.
            let (pos, hashes) = if doc.revs.ids.is_empty() {
                (1, vec![new_rev_hash(None, doc.deleted, &doc.body, &doc.atts)])
            } else {
                (doc.revs.start, doc.revs.ids.clone())
            };
            let rev = RevId {
                pos,
                hash: hashes[0],
            };
            let _ = acc.merge(keytree::path(pos, &hashes, draft_leaf(doc)), revs_limit);
            reply(DocOutcome::Written(rev));
            continue;
        }

        // Interactive edit: derive the new revision from the named parent.
        let parent = doc.revs.ids.first().map(|hash| RevId {
            pos: doc.revs.start,
            hash: *hash,
        });
        let new_hash = new_rev_hash(parent.as_ref(), doc.deleted, &doc.body, &doc.atts);
        let new_pos = doc.revs.start + 1;
        let mut hashes = Vec::with_capacity(doc.revs.ids.len() + 1);
        hashes.push(new_hash);
        hashes.extend_from_slice(&doc.revs.ids);
        let new_rev = RevId {
            pos: new_pos,
            hash: new_hash,
        };

        let mut probe = acc.clone();
        let outcome = probe.merge(keytree::path(new_pos, &hashes, draft_leaf(doc)), revs_limit);

        match outcome {
            MergeOutcome::Conflicts if !old_deleted => {
                reply(DocOutcome::Conflict);
            }
            MergeOutcome::Conflicts if parent.is_some() => {
                // The named parent may still be a real leaf (a fork onto a
                // live edit branch of a deleted doc); accept only then.
                let parent = parent.expect("guarded");
                if acc.is_leaf(parent.pos, &parent.hash) {
                    acc = probe;
                    reply(DocOutcome::Written(new_rev));
                } else {
                    reply(DocOutcome::Conflict);
                }
            }
            MergeOutcome::Conflicts => {
                // Every leaf is deleted and no parent was named: recreate
                // on top of the winning tombstone instead of growing a
                // parallel root.
                match recreate_deleted(&mut acc, old_info, doc, revs_limit) {
                    Some(recreated) => {
                        old_deleted = doc.deleted;
                        reply(DocOutcome::Written(recreated));
                    }
                    None => reply(DocOutcome::Conflict),
                }
            }
            MergeOutcome::NoConflicts if probe == acc => {
                // The tree did not change: this exact revision was already
                // merged before.
                if new_pos == 1 && old_deleted {
                    // Same-content recreation of a deleted document.
                    match recreate_deleted(&mut acc, old_info, doc, revs_limit) {
                        Some(recreated) => {
                            old_deleted = doc.deleted;
                            reply(DocOutcome::Written(recreated));
                        }
                        None => reply(DocOutcome::Conflict),
                    }
                } else {
                    reply(DocOutcome::Conflict);
                }
            }
            _ => {
                acc = probe;
                old_deleted = doc.deleted;
                reply(DocOutcome::Written(new_rev));
            }
        }
    }
    acc
}

// Recreate a fully-deleted document: derive a fresh revision parented on
// the winning tombstone and merge it, so the generation count resumes
// instead of forking a parallel root. Returns the new revision, or `None`
// when the old record has no usable winner.
fn recreate_deleted(
    acc: &mut RevTree<NodeValue>,
    old_info: &FullDocInfo,
    doc: &Doc,
    revs_limit: u64,
) -> Option<RevId> {
    if doc.deleted {
        // Deleting an already-deleted doc from scratch is just a conflict.
        return None;
    }
    let old_winner = old_info.to_doc_info().revs.first().map(|r| r.rev)?;
    let hash = new_rev_hash(Some(&old_winner), doc.deleted, &doc.body, &doc.atts);
    let recreated = RevId {
        pos: old_winner.pos + 1,
        hash,
    };
    let _ = acc.merge(
        keytree::path(recreated.pos, &[hash, old_winner.hash], draft_leaf(doc)),
        revs_limit,
    );
    Some(recreated)
}

// Write every unflushed summary in `tree`, stamping `seq` on the rewritten
// leaves. Fails with `Retry` before writing anything if any draft is bound
// to a file other than the live one.
fn flush_tree(
    file: &crate::dbfile::DbFile,
    tree: &RevTree<NodeValue>,
    seq: u64,
) -> DbResult<RevTree<NodeValue>> {
    for leaf in tree.leaves() {
        if let NodeValue::Leaf(LeafValue {
            body: BodyState::Unflushed(draft),
            ..
        }) = &leaf.value
        {
            if let Some(tag) = draft.atts_file_tag {
                if tag != file.tag() {
                    return Err(DbError::Retry);
                }
            }
        }
    }

    let (mapped, result) = tree.mapfold(Ok(()), |acc: DbResult<()>, _pos, _hash, _kind, value| {
        if acc.is_err() {
            return (value.clone(), acc);
        }
        match value {
            NodeValue::Leaf(LeafValue {
                deleted,
                body: BodyState::Unflushed(draft),
                ..
            }) => match db::write_summary(file, &draft.body, &draft.atts) {
                Ok((ptr, size)) => (
                    NodeValue::Leaf(LeafValue {
                        deleted: *deleted,
                        body: BodyState::OnDisk(ptr),
                        seq,
                        size: Some(size),
                    }),
                    Ok(()),
                ),
                Err(e) => (value.clone(), Err(e)),
            },
            other => (other.clone(), acc),
        }
    });
    result?;
    Ok(mapped)
}

// Apply local-doc edits against the pre-batch tree state, replying per doc.
fn apply_local_docs(
    db: &mut Db,
    edits: &[LocalEdit],
    clients: &[Sender<WriteEvent>],
) -> DbResult<()> {
    if edits.is_empty() {
        return Ok(());
    }
    let ids: Vec<DocId> = edits.iter().map(|e| e.id.clone()).collect();
    let existing = db.local.lookup(&ids)?;

    let mut adds: Vec<LocalDoc> = Vec::new();
    let mut removes: Vec<DocId> = Vec::new();
    for (edit, old) in edits.iter().zip(existing) {
        let stored_rev = old.as_ref().map(|d| d.rev).unwrap_or(0);
        if edit.prev_rev != stored_rev {
            send(
                clients,
                edit.client,
                WriteEvent::Doc {
                    doc_ref: edit.doc_ref,
                    outcome: DocOutcome::Conflict,
                },
            );
            continue;
        }
        let outcome = if edit.delete {
            if old.is_some() {
                removes.push(edit.id.clone());
            }
            DocOutcome::WrittenLocal(0)
        } else {
            let rev = stored_rev + 1;
            adds.push(LocalDoc {
                id: edit.id.clone(),
                rev,
                body: edit.body.clone(),
            });
            DocOutcome::WrittenLocal(rev)
        };
        send(
            clients,
            edit.client,
            WriteEvent::Doc {
                doc_ref: edit.doc_ref,
                outcome,
            },
        );
    }
    db.local.add_remove(adds, removes)?;
    Ok(())
}

/// Apply one (possibly coalesced) batch to `db`.
///
/// Sends per-doc replies; the caller commits (or arms the delayed commit)
/// and sends the terminal `Done`/notifications.
pub(crate) fn update_docs(db: &mut Db, batch: &UpdateBatch) -> DbResult<BatchOutcome> {
    let ids: Vec<DocId> = batch.groups.iter().map(|g| g.id.clone()).collect();
    let old_infos = db.by_id.lookup(&ids)?;

    let mut new_infos: Vec<FullDocInfo> = Vec::new();
    let mut remove_seqs: Vec<u64> = Vec::new();
    let mut seq = db.update_seq;

    for (group, old) in batch.groups.iter().zip(old_infos) {
        let old_info = old.unwrap_or_else(|| FullDocInfo::empty(group.id.clone()));
        let merged = merge_group(
            db.revs_limit(),
            batch.merge_conflicts,
            group,
            &old_info,
            &batch.clients,
        );
        if merged == old_info.rev_tree {
            // Nothing actually changed for this id; no seq is spent.
            continue;
        }
        seq += 1;
        if old_info.update_seq > 0 {
            remove_seqs.push(old_info.update_seq);
        }
        new_infos.push(FullDocInfo {
            id: group.id.clone(),
            update_seq: seq,
            deleted: false,
            rev_tree: merged,
            leafs_size: None,
        });
    }

    // Flush before any tree mutation so a retry leaves no trace.
    for info in &mut new_infos {
        let assigned = info.update_seq;
        match flush_tree(&db.file, &info.rev_tree, assigned) {
            Ok(tree) => {
                info.rev_tree = tree;
                info.normalize_interior();
                info.refresh_aggregates();
                // A merge can change the tree without touching any leaf
                // (deeper replicated history); the assigned seq still wins.
                info.update_seq = assigned;
            }
            Err(DbError::Retry) => {
                for client in &batch.clients {
                    let _ = client.send(WriteEvent::Retry);
                }
                tracing::debug!(db = %db.name(), "batch raced a compaction swap, told clients to retry");
                return Ok(BatchOutcome::Retry);
            }
            Err(e) => return Err(e),
        }
    }

    apply_local_docs(db, &batch.locals, &batch.clients)?;

    let ddocs: Vec<DocId> = new_infos
        .iter()
        .filter(|i| is_design_doc(&i.id))
        .map(|i| i.id.clone())
        .collect();

    let doc_infos: Vec<DocInfo> = new_infos.iter().map(|i| i.to_doc_info()).collect();
    db.by_id.add_remove(new_infos, Vec::new())?;
    db.by_seq.add_remove(doc_infos, remove_seqs)?;

    let seq_changed = seq != db.update_seq;
    db.update_seq = seq;

    Ok(BatchOutcome::Applied { seq_changed, ddocs })
}

/// Result of a purge batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeResult {
    /// The purge sequence after this batch.
    pub purge_seq: u64,
    /// The `(id, revs)` pairs that were actually removed.
    pub purged: Vec<(DocId, Vec<RevId>)>,
}

/// Irrevocably remove specific leaf revisions.
///
/// Surviving leaves of a touched document get fresh update sequences (one
/// per document, strictly increasing), the removed pairs are appended to
/// the file as the purge record, and the header is committed before
/// returning. Documents whose tree empties out leave both trees.
pub(crate) fn purge_docs(
    db: &mut Db,
    pairs: &[(DocId, Vec<RevId>)],
) -> DbResult<PurgeResult> {
    let ids: Vec<DocId> = pairs.iter().map(|(id, _)| id.clone()).collect();
    let old_infos = db.by_id.lookup(&ids)?;

    let mut purged: Vec<(DocId, Vec<RevId>)> = Vec::new();
    let mut new_full_infos: Vec<FullDocInfo> = Vec::new();
    let mut removed_ids: Vec<DocId> = Vec::new();
    let mut remove_seqs: Vec<u64> = Vec::new();
    let mut seq = db.update_seq;

    for ((id, revs), old) in pairs.iter().zip(old_infos) {
        let Some(mut info) = old else {
            continue;
        };
        let wanted: Vec<(u64, keytree::RevHash)> =
            revs.iter().map(|r| (r.pos, r.hash)).collect();
        let removed = info.rev_tree.remove_leafs(&wanted);
        if removed.is_empty() {
            continue;
        }
        purged.push((
            id.clone(),
            removed
                .iter()
                .map(|&(pos, hash)| RevId { pos, hash })
                .collect(),
        ));
        remove_seqs.push(info.update_seq);

        if info.rev_tree.is_empty() {
            removed_ids.push(id.clone());
            continue;
        }
        // Remap the survivors onto one fresh seq for this document.
        seq += 1;
        let new_seq = seq;
        info.rev_tree = info.rev_tree.map(|_pos, _hash, kind, value| match (kind, value) {
            (keytree::NodeKind::Leaf, NodeValue::Leaf(leaf)) => NodeValue::Leaf(LeafValue {
                seq: new_seq,
                ..leaf.clone()
            }),
            (_, other) => other.clone(),
        });
        info.normalize_interior();
        info.refresh_aggregates();
        info.update_seq = new_seq;
        new_full_infos.push(info);
    }

    if purged.is_empty() {
        return Ok(PurgeResult {
            purge_seq: db.purge_seq,
            purged,
        });
    }

    let doc_infos: Vec<DocInfo> = new_full_infos.iter().map(|i| i.to_doc_info()).collect();
    db.by_id.add_remove(new_full_infos, removed_ids)?;
    db.by_seq.add_remove(doc_infos, remove_seqs)?;
    db.update_seq = seq;

    let ptr = db.file.append_term(&purged)?;
    db.purged_docs = Some(ptr);
    db.purge_seq += 1;
    db.commit()?;

    tracing::info!(
        db = %db.name(),
        purge_seq = db.purge_seq,
        docs = purged.len(),
        "purged revisions"
    );
    Ok(PurgeResult {
        purge_seq: db.purge_seq,
        purged,
    })
}
