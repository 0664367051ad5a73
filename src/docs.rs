//! Document model: revisions, summaries, attachments and index records.

use crate::keytree::{RevHash, RevTree, TreeValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Document identifier.
pub type DocId = String;

/// Reserved id prefix for design documents.
pub const DESIGN_DOC_PREFIX: &str = "_design/";

/// Whether `id` names a design document.
pub fn is_design_doc(id: &str) -> bool {
    id.starts_with(DESIGN_DOC_PREFIX)
}

/// A revision id: generation number plus hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevId {
    /// 1-based generation.
    pub pos: u64,
    /// Revision hash.
    pub hash: RevHash,
}

impl std::fmt::Display for RevId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-", self.pos)?;
        for b in self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A revision history as presented by clients and replicators.
///
/// `ids` is newest-first; `start` is the position of `ids[0]`. An empty
/// history (`start == 0`) means a brand-new document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    /// Position of the newest listed revision.
    pub start: u64,
    /// Revision hashes, newest first.
    pub ids: Vec<RevHash>,
}

/// A named binary attachment carried by value on an incoming document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment name, unique within the document.
    pub name: String,
    /// Raw attachment bytes.
    pub data: Vec<u8>,
}

/// On-disk descriptor for an attachment already appended to the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Attachment name.
    pub name: String,
    /// Pointer to the attachment's chunk frame.
    pub ptr: u64,
    /// Attachment length in bytes.
    pub len: u64,
}

/// A document presented to the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Doc {
    /// Document id.
    pub id: DocId,
    /// Revision history. For interactive edits this names the *parent*
    /// revision; for replicated docs it is the full path being merged.
    pub revs: Revisions,
    /// Serialized document body.
    pub body: Vec<u8>,
    /// Deletion marker.
    pub deleted: bool,
    /// Attachments carried by value.
    pub atts: Vec<Attachment>,
    /// File tag the attachment data was prepared against, when an outer
    /// layer pre-streamed it. A mismatch with the live file at flush time
    /// means a compaction swap won the race and the batch must retry.
    pub atts_file_tag: Option<u64>,
}

impl Doc {
    /// A minimal document with just an id and body.
    pub fn new(id: impl Into<DocId>, body: impl Into<Vec<u8>>) -> Doc {
        Doc {
            id: id.into(),
            revs: Revisions::default(),
            body: body.into(),
            deleted: false,
            atts: Vec::new(),
            atts_file_tag: None,
        }
    }
}

/// The serialized `(body, attachments)` record appended for each leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Document body bytes.
    pub body: Vec<u8>,
    /// Attachment descriptors, pointing at previously appended chunks.
    pub atts: Vec<AttachmentRef>,
}

/// A summary not yet written to the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryDraft {
    /// Document body bytes.
    pub body: Vec<u8>,
    /// Attachments still carried by value.
    pub atts: Vec<Attachment>,
    /// See [`Doc::atts_file_tag`].
    pub atts_file_tag: Option<u64>,
}

/// Where a leaf's body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyState {
    /// Awaiting flush; holds the draft summary.
    Unflushed(Box<SummaryDraft>),
    /// Flushed; pointer to the summary's chunk frame.
    OnDisk(u64),
}

/// Value stored at a leaf node of a revision tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafValue {
    /// Deletion marker for this revision.
    pub deleted: bool,
    /// Body location.
    pub body: BodyState,
    /// Update sequence assigned when this revision was written.
    pub seq: u64,
    /// Total size (summary plus attachments); `None` for records written
    /// before sizes were tracked.
    pub size: Option<u64>,
}

/// Value stored at any revision-tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeValue {
    /// Interior node or stemmed ancestor.
    Missing,
    /// Leaf payload.
    Leaf(LeafValue),
}

impl TreeValue for NodeValue {
    fn missing() -> Self {
        NodeValue::Missing
    }
    fn is_missing(&self) -> bool {
        matches!(self, NodeValue::Missing)
    }
}

/// Per-id record carried by the by-id tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullDocInfo {
    /// Document id.
    pub id: DocId,
    /// Highest update sequence among the leaves.
    pub update_seq: u64,
    /// Whether every leaf is deleted.
    pub deleted: bool,
    /// The revision forest.
    pub rev_tree: RevTree<NodeValue>,
    /// Sum of leaf sizes; `None` while any leaf predates size tracking.
    pub leafs_size: Option<u64>,
}

impl FullDocInfo {
    /// An empty record for an id not present in the tree.
    pub fn empty(id: DocId) -> FullDocInfo {
        FullDocInfo {
            id,
            update_seq: 0,
            deleted: false,
            rev_tree: RevTree::new(),
            leafs_size: None,
        }
    }

    /// Recompute `update_seq`, `deleted` and `leafs_size` from the tree.
    pub fn refresh_aggregates(&mut self) {
        let leaves = self.rev_tree.leaves();
        let mut high_seq = 0u64;
        let mut all_deleted = true;
        let mut size: Option<u64> = Some(0);
        for leaf in &leaves {
            if let NodeValue::Leaf(v) = &leaf.value {
                high_seq = high_seq.max(v.seq);
                all_deleted &= v.deleted;
                size = match (size, v.size) {
                    (Some(total), Some(s)) => Some(total + s),
                    _ => None,
                };
            }
        }
        self.update_seq = high_seq;
        self.deleted = !leaves.is_empty() && all_deleted;
        self.leafs_size = if leaves.is_empty() { Some(0) } else { size };
    }

    /// Drop stored sizes on interior payloads.
    ///
    /// The stored form never keeps a size on interior nodes, so the write
    /// pipeline normalizes after every flush to keep the in-memory record
    /// identical to what a read-back would produce.
    pub fn normalize_interior(&mut self) {
        use crate::keytree::NodeKind;
        self.rev_tree = self.rev_tree.map(|_pos, _hash, kind, value| match (kind, value) {
            (NodeKind::Branch, NodeValue::Leaf(leaf)) => NodeValue::Leaf(LeafValue {
                size: None,
                ..leaf.clone()
            }),
            (_, value) => value.clone(),
        });
    }

    /// The winning revision: highest `(pos, hash)` among non-deleted
    /// leaves, falling back to the highest deleted one.
    pub fn winning_rev(&self) -> Option<(RevId, LeafValue)> {
        let mut best: Option<(bool, RevId, LeafValue)> = None;
        for leaf in self.rev_tree.leaves() {
            let NodeValue::Leaf(v) = leaf.value else {
                continue;
            };
            let rev = RevId {
                pos: leaf.pos,
                hash: leaf.path[0],
            };
            let candidate = (!v.deleted, rev, v);
            match &best {
                None => best = Some(candidate),
                Some((live, brev, _)) => {
                    if (candidate.0, candidate.1) > (*live, *brev) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best.map(|(_, rev, v)| (rev, v))
    }

    /// Project this record into its by-seq form.
    pub fn to_doc_info(&self) -> DocInfo {
        let mut revs: Vec<RevInfo> = Vec::new();
        for leaf in self.rev_tree.leaves() {
            let NodeValue::Leaf(v) = leaf.value else {
                continue;
            };
            let BodyState::OnDisk(ptr) = v.body else {
                // Callers project only after flush.
                continue;
            };
            revs.push(RevInfo {
                rev: RevId {
                    pos: leaf.pos,
                    hash: leaf.path[0],
                },
                seq: v.seq,
                body_ptr: ptr,
                deleted: v.deleted,
            });
        }
        // Live revisions first, each group in descending rev order, so the
        // winner is `revs[0]`.
        revs.sort_by_key(|r| (r.deleted, std::cmp::Reverse(r.rev)));
        DocInfo {
            id: self.id.clone(),
            high_seq: self.update_seq,
            revs,
        }
    }
}

/// Per-leaf metadata carried by the by-seq tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevInfo {
    /// Revision id.
    pub rev: RevId,
    /// Update sequence assigned to this revision.
    pub seq: u64,
    /// Pointer to the summary chunk.
    pub body_ptr: u64,
    /// Deletion marker.
    pub deleted: bool,
}

/// By-seq projection of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocInfo {
    /// Document id.
    pub id: DocId,
    /// Highest update sequence among the revisions.
    pub high_seq: u64,
    /// Leaf revisions, winner first.
    pub revs: Vec<RevInfo>,
}

/// A non-replicated document, stored by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDoc {
    /// Document id.
    pub id: DocId,
    /// Integer revision, rendered as a decimal string at the API edge.
    pub rev: u64,
    /// Serialized body.
    pub body: Vec<u8>,
}

/// Deterministically derive a new revision hash.
///
/// Hashes the parent revision, the deletion flag, the body and the
/// attachment names/contents, so identical resubmissions produce identical
/// revision ids.
pub fn new_rev_hash(parent: Option<&RevId>, deleted: bool, body: &[u8], atts: &[Attachment]) -> RevHash {
    let mut hasher = Sha256::new();
    match parent {
        Some(rev) => {
            hasher.update(rev.pos.to_le_bytes());
            hasher.update(rev.hash);
        }
        None => hasher.update([0u8; 24]),
    }
    hasher.update([deleted as u8]);
    hasher.update((body.len() as u64).to_le_bytes());
    hasher.update(body);
    for att in atts {
        hasher.update((att.name.len() as u64).to_le_bytes());
        hasher.update(att.name.as_bytes());
        hasher.update((att.data.len() as u64).to_le_bytes());
        hasher.update(&att.data);
    }
    let digest = hasher.finalize();
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest[..16]);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keytree::path;

    fn h(n: u8) -> RevHash {
        let mut out = [0u8; 16];
        out[0] = n;
        out
    }

    fn leaf(seq: u64, deleted: bool, ptr: u64, size: Option<u64>) -> NodeValue {
        NodeValue::Leaf(LeafValue {
            deleted,
            body: BodyState::OnDisk(ptr),
            seq,
            size,
        })
    }

    #[test]
    fn rev_id_renders_position_and_hash() {
        let rev = RevId { pos: 3, hash: h(0xab) };
        let s = rev.to_string();
        assert!(s.starts_with("3-ab"), "{s}");
    }

    #[test]
    fn rev_hash_is_deterministic_and_parent_sensitive() {
        let a = new_rev_hash(None, false, b"body", &[]);
        let b = new_rev_hash(None, false, b"body", &[]);
        assert_eq!(a, b);

        let parent = RevId { pos: 1, hash: a };
        let c = new_rev_hash(Some(&parent), false, b"body", &[]);
        assert_ne!(a, c);
        let d = new_rev_hash(Some(&parent), true, b"body", &[]);
        assert_ne!(c, d);
    }

    #[test]
    fn aggregates_track_leaves() {
        let mut info = FullDocInfo::empty("a".into());
        info.rev_tree.merge(path(1, &[h(1)], leaf(3, false, 10, Some(5))), 1000);
        info.rev_tree.merge(path(1, &[h(2)], leaf(7, true, 20, Some(9))), 1000);
        info.refresh_aggregates();
        assert_eq!(info.update_seq, 7);
        assert!(!info.deleted, "one live leaf keeps the doc live");
        assert_eq!(info.leafs_size, Some(14));
    }

    #[test]
    fn null_size_leaf_poisons_the_total() {
        let mut info = FullDocInfo::empty("a".into());
        info.rev_tree.merge(path(1, &[h(1)], leaf(1, false, 10, Some(5))), 1000);
        info.rev_tree.merge(path(1, &[h(2)], leaf(2, false, 20, None)), 1000);
        info.refresh_aggregates();
        assert_eq!(info.leafs_size, None);
    }

    #[test]
    fn winning_rev_prefers_live_then_highest() {
        let mut info = FullDocInfo::empty("a".into());
        info.rev_tree.merge(path(2, &[h(9), h(1)], leaf(5, true, 10, Some(1))), 1000);
        info.rev_tree.merge(path(2, &[h(2), h(1)], leaf(4, false, 20, Some(1))), 1000);
        info.refresh_aggregates();
        let (rev, value) = info.winning_rev().unwrap();
        assert_eq!(rev.hash, h(2), "live leaf beats higher deleted one");
        assert!(!value.deleted);
    }

    #[test]
    fn doc_info_puts_the_winner_first() {
        let mut info = FullDocInfo::empty("a".into());
        info.rev_tree.merge(path(2, &[h(9), h(1)], leaf(5, true, 10, Some(1))), 1000);
        info.rev_tree.merge(path(2, &[h(2), h(1)], leaf(4, false, 20, Some(1))), 1000);
        info.refresh_aggregates();
        let di = info.to_doc_info();
        assert_eq!(di.high_seq, 5);
        assert_eq!(di.revs.len(), 2);
        assert_eq!(di.revs[0].rev.hash, h(2));
        assert!(!di.revs[0].deleted);
    }
}
