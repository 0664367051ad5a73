//! `docstore`: the write path and compaction core of an append-only MVCC
//! document store.
//!
//! Scope:
//! - append-only database file with framed records (`dbfile`, `formats`)
//! - per-document revision trees preserving conflicts (`keytree`)
//! - copy-on-write B+-trees with reductions (`btree`, `codec`)
//! - the single-writer updater actor and its write pipeline (`updater`,
//!   `pipeline`, `merger`)
//! - concurrent compaction with atomic swap (`compactor`)
//!
//! Non-goal: queries, views, replication transport, or any outer surface
//! (those belong to the process embedding a database).
//!
//! ## Contract (what you can rely on)
//!
//! - **Single-writer linearization**: every mutation goes through one actor
//!   thread per database; observable results are as if batches ran one at a
//!   time in arrival order, even when the mailbox coalesces them.
//! - **Append-only durability protocol**: data is fsynced before a header
//!   is appended and the header is fsynced after (configurable via
//!   [`config::FsyncOptions`]); after a crash the freshest valid header
//!   wins and everything it references is durable.
//! - **Conflicts are data**: divergent edits of one document coexist as
//!   tree leaves; interactive edits are refused with `Conflict` instead of
//!   silently losing writes, and replication merges everything.
//! - **Compaction never loses acknowledged writes**: the live file is only
//!   replaced when the rebuilt file has caught up with the exact
//!   `update_seq` the updater holds; otherwise the compactor goes around
//!   again.
//!
//! Terminology:
//! - An **update seq** increments once per modified document; a **purge
//!   seq** increments once per purge batch.
//! - `Done` to a client is an *applied* boundary, not a durability
//!   guarantee; durability needs `full_commit` (or the 1-second delayed
//!   commit to fire).

pub mod btree;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod db;
pub mod dbfile;
pub mod docs;
pub mod error;
pub mod formats;
pub mod header;
pub mod keytree;
pub mod merger;
pub mod notify;
pub mod pipeline;
pub mod updater;

pub use db::{Db, DocRead};
pub use docs::{Attachment, Doc, DocId, LocalDoc, RevId, Revisions};
pub use error::{DbError, DbResult};
pub use notify::{ChannelNotifier, DbEvent, Notifier, NullNotifier, NullStateSink, StateSink};
pub use pipeline::{DocOutcome, PurgeResult, WriteEvent};
pub use updater::{CompactionStatus, LocalWrite, UpdaterHandle, UpdateRequest};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use std::sync::Arc;

    fn spawn_db(tmp: &tempfile::TempDir, name: &str) -> UpdaterHandle {
        UpdaterHandle::spawn(
            name,
            tmp.path().join(format!("{name}.db")),
            true,
            DbConfig::default(),
            Arc::new(NullNotifier),
            Arc::new(NullStateSink),
        )
        .unwrap()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_db(&tmp, "smoke");

        let outcomes = handle
            .update_docs(vec![Doc::new("a", b"{\"v\":1}".to_vec())], false, true)
            .unwrap();
        let DocOutcome::Written(rev) = outcomes[0].clone() else {
            panic!("expected a written doc, got {:?}", outcomes[0]);
        };
        assert_eq!(rev.pos, 1);

        let snapshot = handle.snapshot().unwrap();
        assert_eq!(snapshot.update_seq(), 1);
        let read = snapshot.open_doc(&"a".to_string(), None).unwrap().unwrap();
        assert_eq!(read.rev, rev);
        assert_eq!(read.body, b"{\"v\":1}");
        handle.close();
    }

    #[test]
    fn second_edit_from_stale_parent_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_db(&tmp, "conflict");

        let first = handle
            .update_docs(vec![Doc::new("a", b"1".to_vec())], false, false)
            .unwrap();
        let DocOutcome::Written(rev1) = first[0].clone() else {
            panic!("first write must land");
        };

        let mut edit = Doc::new("a", b"2".to_vec());
        edit.revs = Revisions {
            start: rev1.pos,
            ids: vec![rev1.hash],
        };
        let second = handle.update_docs(vec![edit.clone()], false, false).unwrap();
        assert!(matches!(second[0], DocOutcome::Written(_)));

        // Same parent again: the tree does not change, so it is a conflict.
        let third = handle.update_docs(vec![edit], false, false).unwrap();
        assert!(matches!(third[0], DocOutcome::Conflict));
        handle.close();
    }
}
