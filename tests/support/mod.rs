//! Shared helpers for the integration tests.
//!
//! Important: this file lives under `tests/support/` so it is **not**
//! compiled as a standalone integration test target.
#![allow(dead_code)]

use docstore::config::{DbConfig, FsyncOptions};
use docstore::{Db, Doc, DocOutcome, NullNotifier, NullStateSink, RevId, Revisions, UpdaterHandle};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Test config: keep the header barriers, skip the per-open fsync (tests
/// that model crashes corrupt the file bytes directly).
pub fn test_config() -> DbConfig {
    DbConfig {
        fsync: FsyncOptions {
            on_file_open: false,
            ..FsyncOptions::default()
        },
        ..DbConfig::default()
    }
}

/// Spawn an updater on `<dir>/<name>.db`.
pub fn spawn_db(dir: &Path, name: &str, create: bool) -> UpdaterHandle {
    UpdaterHandle::spawn(
        name,
        dir.join(format!("{name}.db")),
        create,
        test_config(),
        Arc::new(NullNotifier),
        Arc::new(NullStateSink),
    )
    .unwrap()
}

/// Write one new document and return its revision.
pub fn put_new(handle: &UpdaterHandle, id: &str, body: &[u8]) -> RevId {
    match &handle
        .update_docs(vec![Doc::new(id, body.to_vec())], false, false)
        .unwrap()[0]
    {
        DocOutcome::Written(rev) => *rev,
        other => panic!("expected write of {id} to land, got {other:?}"),
    }
}

/// Write an edit against a known parent revision.
pub fn put_edit(
    handle: &UpdaterHandle,
    id: &str,
    parent: RevId,
    body: &[u8],
    deleted: bool,
) -> DocOutcome {
    let mut doc = Doc::new(id, body.to_vec());
    doc.deleted = deleted;
    doc.revs = Revisions {
        start: parent.pos,
        ids: vec![parent.hash],
    };
    handle.update_docs(vec![doc], false, false).unwrap()[0].clone()
}

/// Replicate a fully-specified revision path into the database.
pub fn replicate(handle: &UpdaterHandle, id: &str, revs: Revisions, body: &[u8], deleted: bool) {
    let mut doc = Doc::new(id, body.to_vec());
    doc.deleted = deleted;
    doc.revs = revs;
    let outcome = handle.update_docs(vec![doc], true, false).unwrap();
    assert!(
        matches!(outcome[0], DocOutcome::Written(_)),
        "replication is always accepted"
    );
}

/// A comparable model of the visible database contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbModel {
    pub update_seq: u64,
    pub purge_seq: u64,
    pub revs_limit: u64,
    pub doc_counts: (u64, u64),
    pub security: Vec<u8>,
    /// id -> set of (rev, deleted) leaves.
    pub docs: BTreeMap<String, BTreeSet<(String, bool)>>,
    /// id -> (rev, body) for local docs seen via their well-known ids.
    pub locals: BTreeMap<String, (u64, Vec<u8>)>,
}

/// Capture the model through public read APIs, checking by-id and by-seq
/// agree along the way.
pub fn capture_model(db: &Db, local_ids: &[&str]) -> DbModel {
    let mut docs: BTreeMap<String, BTreeSet<(String, bool)>> = BTreeMap::new();
    let mut seq_ids: Vec<(u64, String)> = Vec::new();
    db.fold_changes(0, &mut |info| {
        seq_ids.push((info.high_seq, info.id.clone()));
        let entry = docs.entry(info.id.clone()).or_default();
        for rev in &info.revs {
            entry.insert((rev.rev.to_string(), rev.deleted));
        }
        Ok(docstore::btree::Fold::Continue)
    })
    .unwrap();

    // By-seq must agree with by-id: same ids, matching high seqs.
    for (high_seq, id) in &seq_ids {
        let info = db
            .full_doc_info(id)
            .unwrap()
            .unwrap_or_else(|| panic!("{id} in by-seq but not by-id"));
        assert_eq!(info.update_seq, *high_seq, "high_seq mismatch for {id}");
    }

    let mut locals = BTreeMap::new();
    for id in local_ids {
        if let Some(doc) = db.open_local_doc(&id.to_string()).unwrap() {
            locals.insert(doc.id.clone(), (doc.rev, doc.body.clone()));
        }
    }

    DbModel {
        update_seq: db.update_seq(),
        purge_seq: db.purge_seq(),
        revs_limit: db.revs_limit(),
        doc_counts: db.doc_counts(),
        security: db.security().to_vec(),
        docs,
        locals,
    }
}

/// Poll until no compaction is running, panicking after `timeout`.
pub fn wait_for_compaction(handle: &UpdaterHandle, timeout: Duration) -> u64 {
    let deadline = Instant::now() + timeout;
    loop {
        let status = handle.compaction_status().unwrap();
        if !status.running {
            return status.restarts;
        }
        assert!(
            Instant::now() < deadline,
            "compaction did not finish within {timeout:?}"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}
