//! Grouping and coalescing of incoming document batches.
//!
//! The updater drains its mailbox opportunistically: compatible batches
//! already queued behind the one being processed are merged into it before
//! any work happens, so one header commit covers them all. Merging is a
//! strict optimization; per-id order is preserved because both sides are
//! id-sorted and identical-id runs concatenate in arrival order.

use crate::docs::{Doc, DocId};

/// One queued document, tagged with its originating client and the
/// client's correlation ref.
#[derive(Debug, Clone)]
pub struct QueuedDoc {
    /// Index into the batch's collected client list.
    pub client: usize,
    /// Client-chosen ref echoed back on this doc's reply.
    pub doc_ref: u64,
    /// The document.
    pub doc: Doc,
}

/// A run of queued docs sharing one id.
#[derive(Debug, Clone)]
pub struct DocGroup {
    /// The shared document id.
    pub id: DocId,
    /// Docs in arrival order.
    pub docs: Vec<QueuedDoc>,
}

/// Stable-sort docs by id and collapse runs into groups.
pub fn group_alike(docs: Vec<QueuedDoc>) -> Vec<DocGroup> {
    let mut docs = docs;
    docs.sort_by(|a, b| a.doc.id.cmp(&b.doc.id));
    let mut groups: Vec<DocGroup> = Vec::new();
    for doc in docs {
        match groups.last_mut() {
            Some(group) if group.id == doc.doc.id => group.docs.push(doc),
            _ => groups.push(DocGroup {
                id: doc.doc.id.clone(),
                docs: vec![doc],
            }),
        }
    }
    groups
}

/// Merge two id-sorted group lists, concatenating identical-id runs.
///
/// `offset` is added to every client index in `b`, re-basing it onto the
/// combined client list of the coalesced batch.
pub fn merge_grouped(a: Vec<DocGroup>, b: Vec<DocGroup>, offset: usize) -> Vec<DocGroup> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(ga), Some(gb)) => {
                if ga.id < gb.id {
                    out.push(a.next().expect("peeked"));
                } else if gb.id < ga.id {
                    out.push(rebase(b.next().expect("peeked"), offset));
                } else {
                    let mut merged = a.next().expect("peeked");
                    let tail = rebase(b.next().expect("peeked"), offset);
                    merged.docs.extend(tail.docs);
                    out.push(merged);
                }
            }
            (Some(_), None) => out.push(a.next().expect("peeked")),
            (None, Some(_)) => out.push(rebase(b.next().expect("peeked"), offset)),
            (None, None) => break,
        }
    }
    out
}

fn rebase(mut group: DocGroup, offset: usize) -> DocGroup {
    for doc in &mut group.docs {
        doc.client += offset;
    }
    group
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qd(client: usize, doc_ref: u64, id: &str) -> QueuedDoc {
        QueuedDoc {
            client,
            doc_ref,
            doc: Doc::new(id, b"{}".to_vec()),
        }
    }

    fn ids(groups: &[DocGroup]) -> Vec<(&str, usize)> {
        groups.iter().map(|g| (g.id.as_str(), g.docs.len())).collect()
    }

    #[test]
    fn grouping_sorts_by_id_and_keeps_arrival_order_within_runs() {
        let groups = group_alike(vec![
            qd(0, 1, "b"),
            qd(0, 2, "a"),
            qd(0, 3, "b"),
            qd(0, 4, "a"),
        ]);
        assert_eq!(ids(&groups), vec![("a", 2), ("b", 2)]);
        assert_eq!(groups[0].docs[0].doc_ref, 2);
        assert_eq!(groups[0].docs[1].doc_ref, 4, "stable within a run");
    }

    #[test]
    fn merging_interleaves_disjoint_ids() {
        let a = group_alike(vec![qd(0, 1, "a"), qd(0, 2, "c")]);
        let b = group_alike(vec![qd(0, 3, "b"), qd(0, 4, "d")]);
        let merged = merge_grouped(a, b, 1);
        assert_eq!(ids(&merged), vec![("a", 1), ("b", 1), ("c", 1), ("d", 1)]);
        assert_eq!(merged[1].docs[0].client, 1, "second batch re-based");
    }

    #[test]
    fn merging_concatenates_identical_id_runs_first_batch_first() {
        let a = group_alike(vec![qd(0, 1, "a")]);
        let b = group_alike(vec![qd(0, 2, "a")]);
        let merged = merge_grouped(a, b, 3);
        assert_eq!(ids(&merged), vec![("a", 2)]);
        assert_eq!(merged[0].docs[0].doc_ref, 1);
        assert_eq!(merged[0].docs[1].doc_ref, 2);
        assert_eq!(merged[0].docs[1].client, 3);
    }
}
