//! Property test: mailbox coalescing never changes observable results.
//!
//! The same batch sequence is fed to two databases. One receives batches
//! strictly one at a time (each call waits for `Done`, so nothing can
//! coalesce); the other gets every request fired into the mailbox up
//! front, giving the actor every opportunity to coalesce. Per-doc
//! outcomes and the final state must be identical.

mod support;

use crossbeam_channel::unbounded;
use docstore::{Doc, DocOutcome, Revisions, UpdateRequest, UpdaterHandle, WriteEvent};
use proptest::prelude::*;
use support::{capture_model, spawn_db};

#[derive(Debug, Clone)]
struct BatchSpec {
    merge_conflicts: bool,
    docs: Vec<DocSpec>,
}

#[derive(Debug, Clone)]
struct DocSpec {
    id: u8,
    body: u8,
    /// Depth of a replicated path; interactive create when zero.
    depth: u8,
    seed: u8,
}

fn arb_batches() -> impl Strategy<Value = Vec<BatchSpec>> {
    prop::collection::vec(
        (
            any::<bool>(),
            prop::collection::vec(
                (0u8..5, any::<u8>(), 0u8..4, any::<u8>()).prop_map(|(id, body, depth, seed)| {
                    DocSpec {
                        id,
                        body,
                        depth,
                        seed,
                    }
                }),
                1..6,
            ),
        )
            .prop_map(|(merge_conflicts, docs)| BatchSpec {
                merge_conflicts,
                docs,
            }),
        1..8,
    )
}

fn build_docs(spec: &BatchSpec) -> Vec<Doc> {
    spec.docs
        .iter()
        .map(|d| {
            let mut doc = Doc::new(format!("doc-{}", d.id), vec![d.body]);
            if spec.merge_conflicts && d.depth > 0 {
                let ids: Vec<[u8; 16]> = (0..d.depth)
                    .map(|lvl| {
                        let mut h = [0u8; 16];
                        h[0] = d.seed;
                        h[1] = lvl;
                        h
                    })
                    .collect();
                doc.revs = Revisions {
                    start: d.depth as u64,
                    ids,
                };
            }
            doc
        })
        .collect()
}

fn run_sequential(handle: &UpdaterHandle, batches: &[BatchSpec]) -> Vec<Vec<DocOutcome>> {
    batches
        .iter()
        .map(|b| {
            handle
                .update_docs(build_docs(b), b.merge_conflicts, false)
                .unwrap()
        })
        .collect()
}

fn run_firehose(handle: &UpdaterHandle, batches: &[BatchSpec]) -> Vec<Vec<DocOutcome>> {
    // Fire every request before reading any reply, so queued batches are
    // available for coalescing while the first one is processed.
    let mut streams = Vec::new();
    for b in batches {
        let (reply, events) = unbounded();
        let docs = build_docs(b);
        handle
            .update_docs_raw(UpdateRequest {
                docs: docs
                    .into_iter()
                    .enumerate()
                    .map(|(i, d)| (i as u64, d))
                    .collect(),
                locals: Vec::new(),
                merge_conflicts: b.merge_conflicts,
                full_commit: false,
                reply,
            })
            .unwrap();
        streams.push((b.docs.len(), events));
    }

    streams
        .into_iter()
        .map(|(len, events)| {
            let mut outcomes: Vec<Option<DocOutcome>> = vec![None; len];
            loop {
                match events.recv().unwrap() {
                    WriteEvent::Doc { doc_ref, outcome } => {
                        outcomes[doc_ref as usize] = Some(outcome);
                    }
                    WriteEvent::Done => {
                        return outcomes.into_iter().map(|o| o.unwrap()).collect();
                    }
                    WriteEvent::Retry => panic!("no compaction runs in this test"),
                }
            }
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn coalescing_preserves_outcomes_and_final_state(batches in arb_batches()) {
        let tmp = tempfile::tempdir().unwrap();

        let sequential = spawn_db(tmp.path(), "seq", true);
        let outcomes_seq = run_sequential(&sequential, &batches);
        sequential.full_commit().unwrap();
        let model_seq = capture_model(&sequential.snapshot().unwrap(), &[]);
        sequential.close();

        let firehose = spawn_db(tmp.path(), "fire", true);
        let outcomes_fire = run_firehose(&firehose, &batches);
        firehose.full_commit().unwrap();
        let model_fire = capture_model(&firehose.snapshot().unwrap(), &[]);
        firehose.close();

        prop_assert_eq!(outcomes_seq, outcomes_fire);
        prop_assert_eq!(model_seq, model_fire);
    }
}
