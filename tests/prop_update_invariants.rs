//! Property tests for the updater's cross-tree invariants.
//!
//! For arbitrary operation sequences, after every commit:
//! - `update_seq` equals the greatest by-seq key and bounds every leaf seq
//! - by-id and by-seq name the same documents
//! - `purge_seq` is strictly monotone
//! - no revision tree is deeper than `revs_limit`
//! - re-applying an identical edit conflicts without changing state

mod support;

use docstore::btree::Fold;
use docstore::docs::NodeValue;
use docstore::{Doc, DocOutcome, RevId, Revisions, UpdaterHandle};
use proptest::prelude::*;
use support::{capture_model, spawn_db};

const REVS_LIMIT: u64 = 3;

#[derive(Debug, Clone)]
enum Op {
    Put { id: u8, body: u8 },
    EditWinner { id: u8, body: u8 },
    DeleteWinner { id: u8 },
    ReplicateFork { id: u8, seed: u8, depth: u8 },
    PurgeWinner { id: u8 },
    FullCommit,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..6, any::<u8>()).prop_map(|(id, body)| Op::Put { id, body }),
            (0u8..6, any::<u8>()).prop_map(|(id, body)| Op::EditWinner { id, body }),
            (0u8..6).prop_map(|id| Op::DeleteWinner { id }),
            (0u8..6, any::<u8>(), 1u8..5).prop_map(|(id, seed, depth)| Op::ReplicateFork {
                id,
                seed,
                depth
            }),
            (0u8..6).prop_map(|id| Op::PurgeWinner { id }),
            Just(Op::FullCommit),
        ],
        1..40,
    )
}

fn doc_id(id: u8) -> String {
    format!("doc-{id}")
}

fn winner(handle: &UpdaterHandle, id: u8) -> Option<RevId> {
    handle
        .snapshot()
        .unwrap()
        .full_doc_info(&doc_id(id))
        .unwrap()
        .and_then(|info| info.winning_rev())
        .map(|(rev, _)| rev)
}

fn apply(handle: &UpdaterHandle, op: &Op, purge_seqs: &mut Vec<u64>) {
    match op {
        Op::Put { id, body } => {
            let doc = Doc::new(doc_id(*id), vec![*body]);
            let _ = handle.update_docs(vec![doc], false, false).unwrap();
        }
        Op::EditWinner { id, body } => {
            if let Some(rev) = winner(handle, *id) {
                let mut doc = Doc::new(doc_id(*id), vec![*body]);
                doc.revs = Revisions {
                    start: rev.pos,
                    ids: vec![rev.hash],
                };
                let _ = handle.update_docs(vec![doc], false, false).unwrap();
            }
        }
        Op::DeleteWinner { id } => {
            if let Some(rev) = winner(handle, *id) {
                let mut doc = Doc::new(doc_id(*id), Vec::new());
                doc.deleted = true;
                doc.revs = Revisions {
                    start: rev.pos,
                    ids: vec![rev.hash],
                };
                let _ = handle.update_docs(vec![doc], false, false).unwrap();
            }
        }
        Op::ReplicateFork { id, seed, depth } => {
            let depth = *depth as u64;
            let ids: Vec<[u8; 16]> = (0..depth)
                .map(|d| {
                    let mut h = [0u8; 16];
                    h[0] = *seed;
                    h[1] = d as u8;
                    h
                })
                .collect();
            let mut doc = Doc::new(doc_id(*id), vec![*seed]);
            doc.revs = Revisions { start: depth, ids };
            let _ = handle.update_docs(vec![doc], true, false).unwrap();
        }
        Op::PurgeWinner { id } => {
            if let Some(rev) = winner(handle, *id) {
                let result = handle.purge_docs(vec![(doc_id(*id), vec![rev])]).unwrap();
                if !result.purged.is_empty() {
                    purge_seqs.push(result.purge_seq);
                }
            }
        }
        Op::FullCommit => handle.full_commit().unwrap(),
    }
}

fn assert_invariants(handle: &UpdaterHandle, purged_any: bool) {
    let db = handle.snapshot().unwrap();
    // capture_model already cross-checks by-seq against by-id.
    let model = capture_model(&db, &[]);

    let mut max_seq = 0u64;
    let mut by_seq_count = 0u64;
    db.fold_changes(0, &mut |info| {
        max_seq = max_seq.max(info.high_seq);
        by_seq_count += 1;
        Ok(Fold::Continue)
    })
    .unwrap();

    let (live, deleted) = db.doc_counts();
    assert_eq!(
        live + deleted,
        by_seq_count,
        "by-id and by-seq must name the same documents"
    );
    assert_eq!(
        model.docs.len() as u64,
        by_seq_count,
        "one by-seq record per id"
    );
    assert!(db.update_seq() >= max_seq);
    if by_seq_count > 0 && !purged_any {
        // A purge that empties a document removes its by-seq entry without
        // spending a seq, so equality only holds for pure update traffic.
        assert_eq!(db.update_seq(), max_seq, "update_seq tracks the tail");
    }

    for id in model.docs.keys() {
        let info = db.full_doc_info(id).unwrap().unwrap();
        for leaf in info.rev_tree.leaves() {
            assert!(
                leaf.path.len() as u64 <= REVS_LIMIT,
                "{id} rev tree deeper than revs_limit"
            );
            if let NodeValue::Leaf(v) = leaf.value {
                assert!(v.seq <= db.update_seq(), "{id} leaf seq beyond update_seq");
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn invariants_hold_for_arbitrary_op_sequences(ops in arb_ops()) {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_db(tmp.path(), "inv", true);
        handle.set_revs_limit(REVS_LIMIT).unwrap();

        let mut purge_seqs: Vec<u64> = Vec::new();
        for op in &ops {
            apply(&handle, op, &mut purge_seqs);
        }
        assert_invariants(&handle, !purge_seqs.is_empty());

        // Purge seq is strictly monotone across the whole run.
        prop_assert!(purge_seqs.windows(2).all(|w| w[0] < w[1]));

        // Durability: what we see now is what a reopen sees.
        handle.full_commit().unwrap();
        let before = capture_model(&handle.snapshot().unwrap(), &[]);
        handle.close();
        let handle = spawn_db(tmp.path(), "inv", false);
        prop_assert_eq!(capture_model(&handle.snapshot().unwrap(), &[]), before);
        handle.close();
    }

    #[test]
    fn identical_edit_applied_twice_conflicts_second_time(id in 0u8..4, body in any::<u8>()) {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_db(tmp.path(), "idem", true);

        let doc = Doc::new(doc_id(id), vec![body]);
        let first = handle.update_docs(vec![doc.clone()], false, false).unwrap();
        prop_assert!(matches!(first[0], DocOutcome::Written(_)));
        let seq_after_first = handle.snapshot().unwrap().update_seq();

        let second = handle.update_docs(vec![doc], false, false).unwrap();
        prop_assert!(matches!(second[0], DocOutcome::Conflict));
        prop_assert_eq!(handle.snapshot().unwrap().update_seq(), seq_after_first);
        handle.close();
    }
}
