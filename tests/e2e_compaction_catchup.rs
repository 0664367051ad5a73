//! End-to-end compaction: state preservation, catch-up under live writes,
//! cancellation.

mod support;

use docstore::config::DbConfig;
use docstore::{ChannelNotifier, DbEvent, Doc, DocOutcome, NullStateSink, UpdaterHandle};
use std::sync::Arc;
use std::time::Duration;
use support::{put_edit, put_new, spawn_db, wait_for_compaction};

fn fill(handle: &UpdaterHandle, count: usize, prefix: &str) {
    for chunk in (0..count).collect::<Vec<_>>().chunks(500) {
        let docs: Vec<Doc> = chunk
            .iter()
            .map(|i| Doc::new(format!("{prefix}{i:06}"), format!("body-{i}").into_bytes()))
            .collect();
        let outcomes = handle.update_docs(docs, false, false).unwrap();
        assert!(outcomes.iter().all(|o| matches!(o, DocOutcome::Written(_))));
    }
}

#[test]
fn compaction_preserves_visible_state() {
    let tmp = tempfile::tempdir().unwrap();
    let (notifier, events) = ChannelNotifier::new();
    let handle = UpdaterHandle::spawn(
        "c",
        tmp.path().join("c.db"),
        true,
        DbConfig::default(),
        Arc::new(notifier),
        Arc::new(NullStateSink),
    )
    .unwrap();

    fill(&handle, 800, "doc-");
    // Mix in edits, a tombstone and a replicated fork so the copy loop
    // sees more than fresh single-leaf trees.
    let rev = put_new(&handle, "edited", b"v1");
    put_edit(&handle, "edited", rev, b"v2", false);
    let dead = put_new(&handle, "deleted", b"gone");
    put_edit(&handle, "deleted", dead, b"", true);
    support::replicate(
        &handle,
        "forked",
        docstore::Revisions {
            start: 1,
            ids: vec![[7u8; 16]],
        },
        b"fork",
        false,
    );
    handle.set_revs_limit(40).unwrap();
    handle.full_commit().unwrap();

    let before = support::capture_model(&handle.snapshot().unwrap(), &[]);
    let file_len_before = std::fs::metadata(tmp.path().join("c.db")).unwrap().len();

    handle.start_compact().unwrap();
    wait_for_compaction(&handle, Duration::from_secs(60));

    assert!(
        !tmp.path().join("c.db.compact").exists(),
        "sidecar is consumed by the swap"
    );
    let snapshot = handle.snapshot().unwrap();
    assert_eq!(support::capture_model(&snapshot, &[]), before);

    let file_len_after = std::fs::metadata(tmp.path().join("c.db")).unwrap().len();
    assert!(
        file_len_after < file_len_before,
        "rewritten file dropped dead tree nodes ({file_len_after} >= {file_len_before})"
    );

    assert!(events
        .try_iter()
        .any(|e| e == DbEvent::Compacted { name: "c".into() }));

    // The swapped-in file is a normal database.
    put_new(&handle, "after-compact", b"ok");
    handle.full_commit().unwrap();
    handle.close();

    let handle = spawn_db(tmp.path(), "c", false);
    let reopened = handle.snapshot().unwrap();
    assert!(reopened
        .open_doc(&"after-compact".to_string(), None)
        .unwrap()
        .is_some());
    assert_eq!(reopened.revs_limit(), 40);
    handle.close();
}

#[test]
fn writes_during_compaction_are_never_lost() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_db(tmp.path(), "big", true);

    fill(&handle, 6000, "seed-");
    handle.full_commit().unwrap();

    handle.start_compact().unwrap();

    // Land writes while the copy loop runs; the first hand-off attempt
    // should find itself behind and restart.
    let mut late_ids = Vec::new();
    for i in 0..40 {
        let id = format!("late-{i:03}");
        put_new(&handle, &id, b"late");
        late_ids.push(id);
    }

    let restarts = wait_for_compaction(&handle, Duration::from_secs(120));
    assert!(
        restarts >= 1,
        "a busy database must force at least one catch-up pass"
    );

    let snapshot = handle.snapshot().unwrap();
    for id in &late_ids {
        assert!(
            snapshot.open_doc(id, None).unwrap().is_some(),
            "acknowledged write {id} lost by compaction"
        );
    }
    assert_eq!(snapshot.doc_counts().0, 6000 + 40);
    handle.close();
}

#[test]
fn cancel_compact_removes_the_partial_file() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_db(tmp.path(), "z", true);

    fill(&handle, 4000, "d-");
    handle.full_commit().unwrap();

    handle.start_compact().unwrap();
    handle.cancel_compact().unwrap();

    assert!(!handle.compaction_status().unwrap().running);
    assert!(!tmp.path().join("z.db.compact").exists());

    // Still a perfectly good database.
    put_new(&handle, "more", b"1");
    assert!(handle
        .snapshot()
        .unwrap()
        .open_doc(&"more".to_string(), None)
        .unwrap()
        .is_some());
    handle.close();
}

#[test]
fn start_compact_is_idempotent_while_running() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_db(tmp.path(), "i", true);
    fill(&handle, 2000, "d-");

    handle.start_compact().unwrap();
    handle.start_compact().unwrap(); // no-op, keeps the running task
    wait_for_compaction(&handle, Duration::from_secs(60));

    assert_eq!(handle.snapshot().unwrap().doc_counts().0, 2000);
    handle.close();
}

#[test]
fn local_docs_survive_compaction() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_db(tmp.path(), "l", true);
    fill(&handle, 200, "d-");

    let out = handle
        .update_local_docs(vec![docstore::LocalWrite {
            doc_ref: 0,
            id: "_local/ckpt".into(),
            prev_rev: 0,
            delete: false,
            body: b"state".to_vec(),
        }])
        .unwrap();
    assert_eq!(out[0], DocOutcome::WrittenLocal(1));

    handle.start_compact().unwrap();
    wait_for_compaction(&handle, Duration::from_secs(60));

    let doc = handle
        .snapshot()
        .unwrap()
        .open_local_doc(&"_local/ckpt".to_string())
        .unwrap()
        .expect("local doc copied at hand-off");
    assert_eq!(doc.body, b"state");
    assert_eq!(doc.rev, 1);
    handle.close();
}

#[test]
fn purge_is_refused_while_compacting_and_marker_is_carried() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_db(tmp.path(), "p", true);
    fill(&handle, 4000, "d-");
    let rev = put_new(&handle, "victim", b"x");
    handle.full_commit().unwrap();

    handle.start_compact().unwrap();
    let refused = handle.purge_docs(vec![("victim".to_string(), vec![rev])]);
    match refused {
        Err(docstore::DbError::PurgeDuringCompaction) => {}
        other => panic!("expected purge refusal, got {other:?}"),
    }
    wait_for_compaction(&handle, Duration::from_secs(120));

    // Now purge, then compact again: the purge marker must carry over.
    let result = handle
        .purge_docs(vec![("victim".to_string(), vec![rev])])
        .unwrap();
    assert_eq!(result.purge_seq, 1);

    handle.start_compact().unwrap();
    wait_for_compaction(&handle, Duration::from_secs(120));
    let snapshot = handle.snapshot().unwrap();
    assert_eq!(snapshot.purge_seq(), 1);
    assert!(snapshot.open_doc(&"victim".to_string(), None).unwrap().is_none());
    handle.close();
}
