//! Index codec: projections between in-memory document records and the
//! stored forms of the by-id, by-seq and local trees.
//!
//! ## Storage compatibility
//!
//! Two leaf widths exist on disk: a legacy three-field form without a size
//! and the current four-field form. Both are parsed; the four-field form is
//! always emitted after any modification. A legacy leaf makes the
//! document's `leafs_size` (and every reduction above it) `None` until a
//! compaction rewrites it.

use crate::btree::TreeSpec;
use crate::docs::{DocId, DocInfo, FullDocInfo, LeafValue, LocalDoc, NodeValue, RevInfo};
use crate::docs::BodyState;
use crate::keytree::{NodeKind, RevTree, TreeValue};
use serde::{Deserialize, Serialize};

/// Stored value at a revision-tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskNodeValue {
    /// Interior node with no retained payload.
    Missing,
    /// Legacy leaf form, written before sizes were tracked.
    LeafV3 {
        /// Deletion marker.
        deleted: bool,
        /// Summary pointer.
        ptr: u64,
        /// Update sequence.
        seq: u64,
    },
    /// Current leaf form.
    Leaf {
        /// Deletion marker.
        deleted: bool,
        /// Summary pointer.
        ptr: u64,
        /// Update sequence.
        seq: u64,
        /// Summary-plus-attachments size, when known.
        size: Option<u64>,
    },
}

impl TreeValue for DiskNodeValue {
    fn missing() -> Self {
        DiskNodeValue::Missing
    }
    fn is_missing(&self) -> bool {
        matches!(self, DiskNodeValue::Missing)
    }
}

/// Stored by-id record: aggregates plus the disk-form revision tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDocRecord {
    /// Highest update sequence among the leaves.
    pub high_seq: u64,
    /// Whether every leaf is deleted.
    pub deleted: bool,
    /// Revision tree with disk-form node values.
    pub tree: RevTree<DiskNodeValue>,
}

/// Totals carried by the by-id tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdReduction {
    /// Documents whose winning revision is live.
    pub not_deleted: u64,
    /// Documents whose every leaf is deleted.
    pub deleted: u64,
    /// Total of `leafs_size`; `None` while any record predates sizes.
    pub size: Option<u64>,
}

/// The by-id tree: `id -> full document info`.
pub struct ByIdSpec;

impl TreeSpec for ByIdSpec {
    type Item = FullDocInfo;
    type Key = DocId;
    type Value = DiskDocRecord;
    type Reduction = IdReduction;

    fn split(info: &FullDocInfo) -> (DocId, DiskDocRecord) {
        let tree = info.rev_tree.map(|_pos, _hash, kind, value| match value {
            NodeValue::Missing => DiskNodeValue::Missing,
            NodeValue::Leaf(leaf) => {
                let BodyState::OnDisk(ptr) = &leaf.body else {
                    // The write pipeline flushes before projecting.
                    panic!("splitting an unflushed document");
                };
                DiskNodeValue::Leaf {
                    deleted: leaf.deleted,
                    ptr: *ptr,
                    seq: leaf.seq,
                    // Interior payloads drop their size.
                    size: match kind {
                        NodeKind::Leaf => leaf.size,
                        NodeKind::Branch => None,
                    },
                }
            }
        });
        (
            info.id.clone(),
            DiskDocRecord {
                high_seq: info.update_seq,
                deleted: info.deleted,
                tree,
            },
        )
    }

    fn join(id: DocId, record: DiskDocRecord) -> FullDocInfo {
        let (rev_tree, leafs_size) = record.tree.mapfold(
            Some(0u64),
            |size_acc, _pos, _hash, kind, value| {
                let (node, leaf_size) = match value {
                    DiskNodeValue::Missing => (NodeValue::Missing, None),
                    DiskNodeValue::LeafV3 { deleted, ptr, seq } => (
                        NodeValue::Leaf(LeafValue {
                            deleted: *deleted,
                            body: BodyState::OnDisk(*ptr),
                            seq: *seq,
                            size: None,
                        }),
                        Some(None),
                    ),
                    DiskNodeValue::Leaf {
                        deleted,
                        ptr,
                        seq,
                        size,
                    } => (
                        NodeValue::Leaf(LeafValue {
                            deleted: *deleted,
                            body: BodyState::OnDisk(*ptr),
                            seq: *seq,
                            size: *size,
                        }),
                        Some(*size),
                    ),
                };
                let size_acc = match (kind, leaf_size) {
                    // Only actual leaves count towards the total.
                    (NodeKind::Leaf, Some(leaf_size)) => match (size_acc, leaf_size) {
                        (Some(total), Some(s)) => Some(total + s),
                        _ => None,
                    },
                    _ => size_acc,
                };
                (node, size_acc)
            },
        );
        FullDocInfo {
            id,
            update_seq: record.high_seq,
            deleted: record.deleted,
            rev_tree,
            leafs_size,
        }
    }

    fn reduce(infos: &[FullDocInfo]) -> IdReduction {
        let mut out = IdReduction {
            not_deleted: 0,
            deleted: 0,
            size: Some(0),
        };
        for info in infos {
            if info.deleted {
                out.deleted += 1;
            } else {
                out.not_deleted += 1;
            }
            out.size = match (out.size, info.leafs_size) {
                (Some(total), Some(s)) => Some(total + s),
                _ => None,
            };
        }
        out
    }

    fn rereduce(reductions: &[IdReduction]) -> IdReduction {
        let mut out = IdReduction {
            not_deleted: 0,
            deleted: 0,
            size: Some(0),
        };
        for r in reductions {
            out.not_deleted += r.not_deleted;
            out.deleted += r.deleted;
            out.size = match (out.size, r.size) {
                (Some(total), Some(s)) => Some(total + s),
                _ => None,
            };
        }
        out
    }
}

/// Stored per-revision entry in the by-seq record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRevInfo {
    /// Revision id.
    pub rev: crate::docs::RevId,
    /// Update sequence.
    pub seq: u64,
    /// Summary pointer.
    pub ptr: u64,
}

/// Stored by-seq record. Deleted and live revisions are kept in separate
/// lists, each reversed so the join restores insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSeqRecord {
    /// Document id.
    pub id: DocId,
    /// Live revisions, reversed.
    pub not_deleted: Vec<DiskRevInfo>,
    /// Deleted revisions, reversed.
    pub deleted: Vec<DiskRevInfo>,
}

/// The by-seq tree: `update seq -> doc info`.
pub struct BySeqSpec;

impl TreeSpec for BySeqSpec {
    type Item = DocInfo;
    type Key = u64;
    type Value = DiskSeqRecord;
    type Reduction = u64;

    fn split(info: &DocInfo) -> (u64, DiskSeqRecord) {
        let mut not_deleted = Vec::new();
        let mut deleted = Vec::new();
        for r in &info.revs {
            let entry = DiskRevInfo {
                rev: r.rev,
                seq: r.seq,
                ptr: r.body_ptr,
            };
            if r.deleted {
                deleted.push(entry);
            } else {
                not_deleted.push(entry);
            }
        }
        not_deleted.reverse();
        deleted.reverse();
        (
            info.high_seq,
            DiskSeqRecord {
                id: info.id.clone(),
                not_deleted,
                deleted,
            },
        )
    }

    fn join(high_seq: u64, record: DiskSeqRecord) -> DocInfo {
        let mut revs = Vec::with_capacity(record.not_deleted.len() + record.deleted.len());
        for (list, deleted) in [(record.not_deleted, false), (record.deleted, true)] {
            for entry in list.into_iter().rev() {
                revs.push(RevInfo {
                    rev: entry.rev,
                    seq: entry.seq,
                    body_ptr: entry.ptr,
                    deleted,
                });
            }
        }
        DocInfo {
            id: record.id,
            high_seq,
            revs,
        }
    }

    fn reduce(infos: &[DocInfo]) -> u64 {
        infos.len() as u64
    }

    fn rereduce(reductions: &[u64]) -> u64 {
        reductions.iter().sum()
    }
}

/// The local-docs tree: `id -> (rev, body)`, stored by value.
pub struct LocalSpec;

impl TreeSpec for LocalSpec {
    type Item = LocalDoc;
    type Key = DocId;
    type Value = (u64, Vec<u8>);
    type Reduction = ();

    fn split(doc: &LocalDoc) -> (DocId, (u64, Vec<u8>)) {
        (doc.id.clone(), (doc.rev, doc.body.clone()))
    }

    fn join(id: DocId, (rev, body): (u64, Vec<u8>)) -> LocalDoc {
        LocalDoc { id, rev, body }
    }

    fn reduce(_docs: &[LocalDoc]) {}

    fn rereduce(_reductions: &[()]) {}
}
