//! The updater actor: single-threaded owner of a database's mutable state.
//!
//! All mutations are linearized through one dedicated thread consuming a
//! typed command mailbox; callers hold an [`UpdaterHandle`] and talk to the
//! actor through reply channels. This is the whole concurrency story: the
//! multi-tree invariant (by-id, by-seq, header agree) never needs a lock
//! because only this thread touches the state.
//!
//! ## Ordering guarantees
//!
//! - Commands are processed strictly in arrival order; coalescing merges
//!   *already queued* compatible batches into the one being processed and
//!   never reorders per-id work.
//! - A `full_commit` reply implies every previously acknowledged write is
//!   durable.
//! - `compact_done` is handled after every `update_docs` the actor accepted
//!   before it, which makes the catch-up comparison race-free.
//!
//! ## Delayed commit
//!
//! Instead of an OS timer, the mailbox wait carries the deadline: when a
//! batch leaves uncommitted state, the actor waits with `recv_timeout` and
//! commits on expiry. At most one deadline is armed; any forced commit
//! clears it.
//!
//! ## Termination
//!
//! Dropping the last handle or calling [`UpdaterHandle::close`] stops the
//! actor; a pending delayed commit is flushed, the compactor (if any) is
//! joined, and the file closes with the state. Internal failures stop the
//! actor and surface through [`StateSink::db_closed`].

use crate::compactor::{self, CompactorHandle};
use crate::config::DbConfig;
use crate::db::Db;
use crate::dbfile;
use crate::docs::{Doc, DocId, RevId};
use crate::error::{DbError, DbResult};
use crate::merger::{self, DocGroup, QueuedDoc};
use crate::notify::{DbEvent, Notifier, StateSink};
use crate::pipeline::{
    self, BatchOutcome, DocOutcome, LocalEdit, PurgeResult, UpdateBatch, WriteEvent,
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long a dirty state may sit before the owed header is written.
const DELAYED_COMMIT_AFTER: Duration = Duration::from_secs(1);

/// An edit to a local document, as submitted by clients.
#[derive(Debug, Clone)]
pub struct LocalWrite {
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

/// A raw `update_docs` request: documents with refs plus the reply stream.
#[derive(Debug)]
pub struct UpdateRequest {
    /// Documents, each tagged with a client-chosen ref.
    pub docs: Vec<(u64, Doc)>,
    /// Local-doc edits.
    pub locals: Vec<LocalWrite>,
    /// Replication mode: accept every merge.
    pub merge_conflicts: bool,
    /// Demand a synchronous header commit for this batch.
    pub full_commit: bool,
    /// Where the per-doc results and the terminal `Done`/`Retry` go.
    pub reply: Sender<WriteEvent>,
}

/// Compaction state visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionStatus {
    /// A compactor task is currently running.
    pub running: bool,
    /// Times the compactor was respawned because it fell behind.
    pub restarts: u64,
}

enum Command {
    Snapshot {
        reply: Sender<Db>,
    },
    FullCommit {
        reply: Sender<DbResult<()>>,
    },
    UpdateDocs(Box<UpdateRequest>),
    IncrementUpdateSeq {
        reply: Sender<DbResult<u64>>,
    },
    SetRevsLimit {
        limit: u64,
        reply: Sender<DbResult<()>>,
    },
    SetSecurity {
        blob: Vec<u8>,
        reply: Sender<DbResult<()>>,
    },
    PurgeDocs {
        pairs: Vec<(DocId, Vec<RevId>)>,
        reply: Sender<DbResult<PurgeResult>>,
    },
    StartCompact {
        reply: Sender<DbResult<()>>,
    },
    CancelCompact {
        reply: Sender<DbResult<()>>,
    },
    CompactDone {
        path: PathBuf,
    },
    CompactionStatus {
        reply: Sender<CompactionStatus>,
    },
    Shutdown,
}

/// Handle to a running updater actor.
pub struct UpdaterHandle {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl UpdaterHandle {
    /// Open (or create) a database and spawn its updater.
    ///
    /// The open runs on the calling thread so errors surface here; only a
    /// successfully opened state starts an actor.
    pub fn spawn(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        create: bool,
        config: DbConfig,
        notifier: Arc<dyn Notifier>,
        server: Arc<dyn StateSink>,
    ) -> DbResult<UpdaterHandle> {
        let db = Db::open(name, path, create, config)?;
        let (tx, rx) = unbounded();
        let actor_tx = tx.clone();
        let db_name = db.name().to_string();
        let thread = std::thread::Builder::new()
            .name(format!("updater:{db_name}"))
            .spawn(move || {
                let mut actor = Actor {
                    db,
                    rx,
                    tx: actor_tx,
                    notifier,
                    server,
                    compactor: None,
                    compact_restarts: 0,
                    delayed_commit: None,
                };
                let result = actor.run();
                if let Err(e) = &result {
                    tracing::error!(db = %db_name, error = %e, "updater terminated");
                }
                actor.server.db_closed(&db_name, result.as_ref().err());
                if let Some(handle) = actor.compactor.take() {
                    handle.cancel_and_join();
                }
            })
            .expect("spawning updater thread");
        Ok(UpdaterHandle {
            tx,
            thread: Some(thread),
        })
    }

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> DbResult<T> {
        let (tx, rx) = bounded(1);
        self.tx
            .send(build(tx))
            .map_err(|_| DbError::UpdaterGone)?;
        rx.recv().map_err(|_| DbError::UpdaterGone)
    }

    /// A snapshot of the current state for reads.
    pub fn snapshot(&self) -> DbResult<Db> {
        self.call(|reply| Command::Snapshot { reply })
    }

    /// Force any owed header write now. On return, every write previously
    /// acknowledged to this caller is durable.
    pub fn full_commit(&self) -> DbResult<()> {
        self.call(|reply| Command::FullCommit { reply })?
    }

    /// Submit a raw update request; events arrive on `request.reply`.
    pub fn update_docs_raw(&self, request: UpdateRequest) -> DbResult<()> {
        self.tx
            .send(Command::UpdateDocs(Box::new(request)))
            .map_err(|_| DbError::UpdaterGone)
    }

    /// Write a batch of documents, resubmitting on a compaction race.
    ///
    /// Returns one outcome per input document, in input order.
    pub fn update_docs(
        &self,
        docs: Vec<Doc>,
        merge_conflicts: bool,
        full_commit: bool,
    ) -> DbResult<Vec<DocOutcome>> {
        loop {
            let (reply, events) = unbounded();
            self.update_docs_raw(UpdateRequest {
                docs: docs
                    .iter()
                    .enumerate()
                    .map(|(i, d)| (i as u64, d.clone()))
                    .collect(),
                locals: Vec::new(),
                merge_conflicts,
                full_commit,
                reply,
            })?;
            match collect_outcomes(docs.len(), &events)? {
                Some(outcomes) => return Ok(outcomes),
                None => continue, // retry: resubmit the whole batch
            }
        }
    }

    /// Write a batch of local (non-replicated) documents.
    ///
    /// Returns one outcome per edit, in input order. Local batches never
    /// race compaction, so there is no retry loop.
    pub fn update_local_docs(&self, edits: Vec<LocalWrite>) -> DbResult<Vec<DocOutcome>> {
        let len = edits.len();
        let (reply, events) = unbounded();
        self.update_docs_raw(UpdateRequest {
            docs: Vec::new(),
            locals: edits
                .into_iter()
                .enumerate()
                .map(|(i, mut e)| {
                    e.doc_ref = i as u64;
                    e
                })
                .collect(),
            merge_conflicts: false,
            full_commit: false,
            reply,
        })?;
        collect_outcomes(len, &events)?.ok_or(DbError::Retry)
    }

    /// Bump the update sequence by one and commit. Returns the new value.
    pub fn increment_update_seq(&self) -> DbResult<u64> {
        self.call(|reply| Command::IncrementUpdateSeq { reply })?
    }

    /// Store a new revision-depth limit and commit.
    pub fn set_revs_limit(&self, limit: u64) -> DbResult<()> {
        self.call(|reply| Command::SetRevsLimit { limit, reply })?
    }

    /// Store a new security policy blob and commit.
    pub fn set_security(&self, blob: Vec<u8>) -> DbResult<()> {
        self.call(|reply| Command::SetSecurity { blob, reply })?
    }

    /// Irrevocably remove specific revisions. Refused while compacting.
    pub fn purge_docs(&self, pairs: Vec<(DocId, Vec<RevId>)>) -> DbResult<PurgeResult> {
        self.call(|reply| Command::PurgeDocs { pairs, reply })?
    }

    /// Start a compaction (no-op if one is already running).
    pub fn start_compact(&self) -> DbResult<()> {
        self.call(|reply| Command::StartCompact { reply })?
    }

    /// Stop a running compaction and delete its partial output.
    pub fn cancel_compact(&self) -> DbResult<()> {
        self.call(|reply| Command::CancelCompact { reply })?
    }

    /// Whether a compactor is running and how often it was respawned.
    pub fn compaction_status(&self) -> DbResult<CompactionStatus> {
        self.call(|reply| Command::CompactionStatus { reply })
    }

    /// Stop the actor, flushing any owed commit first.
    pub fn close(mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UpdaterHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// Drain one reply stream. Ok(Some(..)) on Done, Ok(None) on Retry.
fn collect_outcomes(
    len: usize,
    events: &Receiver<WriteEvent>,
) -> DbResult<Option<Vec<DocOutcome>>> {
    let mut outcomes: Vec<Option<DocOutcome>> = vec![None; len];
    loop {
        match events.recv() {
            Ok(WriteEvent::Doc { doc_ref, outcome }) => {
                let slot = outcomes
                    .get_mut(doc_ref as usize)
                    .ok_or_else(|| DbError::InvalidState("reply for unknown ref".into()))?;
                *slot = Some(outcome);
            }
            Ok(WriteEvent::Done) => {
                return Ok(Some(
                    outcomes
                        .into_iter()
                        .map(|o| o.ok_or_else(|| DbError::InvalidState("missing reply".into())))
                        .collect::<DbResult<_>>()?,
                ));
            }
            Ok(WriteEvent::Retry) => return Ok(None),
            Err(_) => return Err(DbError::UpdaterGone),
        }
    }
}

struct Actor {
    db: Db,
    rx: Receiver<Command>,
    tx: Sender<Command>,
    notifier: Arc<dyn Notifier>,
    server: Arc<dyn StateSink>,
    compactor: Option<CompactorHandle>,
    compact_restarts: u64,
    delayed_commit: Option<Instant>,
}

impl Actor {
    fn run(&mut self) -> DbResult<()> {
        let mut pending: Option<Command> = None;
        loop {
            let command = if let Some(command) = pending.take() {
                command
            } else {
                match self.delayed_commit {
                    Some(deadline) => {
                        let wait = deadline.saturating_duration_since(Instant::now());
                        match self.rx.recv_timeout(wait) {
                            Ok(command) => command,
                            Err(RecvTimeoutError::Timeout) => {
                                self.fire_delayed_commit()?;
                                continue;
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match self.rx.recv() {
                        Ok(command) => command,
                        Err(_) => break,
                    },
                }
            };
            if !self.dispatch(command, &mut pending)? {
                break;
            }
        }
        // Graceful stop: nothing acknowledged may be lost to an unfired
        // delayed commit.
        self.commit_now()?;
        Ok(())
    }

    fn dispatch(&mut self, command: Command, pending: &mut Option<Command>) -> DbResult<bool> {
        match command {
            Command::Snapshot { reply } => {
                let _ = reply.send(self.db.clone());
            }
            Command::FullCommit { reply } => {
                reply_fatal(&reply, self.commit_now())?;
            }
            Command::UpdateDocs(request) => {
                self.handle_update_docs(*request, pending)?;
            }
            Command::IncrementUpdateSeq { reply } => {
                self.db.update_seq += 1;
                let result = self.commit_now().map(|()| self.db.update_seq);
                self.server.db_updated(&self.db);
                self.notifier.notify(DbEvent::Updated {
                    name: self.db.name().to_string(),
                });
                reply_fatal(&reply, result)?;
            }
            Command::SetRevsLimit { limit, reply } => {
                self.db.revs_limit = limit.max(1);
                self.db.update_seq += 1;
                let result = self.commit_now();
                self.server.db_updated(&self.db);
                reply_fatal(&reply, result)?;
            }
            Command::SetSecurity { blob, reply } => {
                let result = (|| {
                    let ptr = self.db.file.append_term(&blob)?;
                    self.db.security = blob;
                    self.db.security_ptr = Some(ptr);
                    self.db.update_seq += 1;
                    self.commit_now()
                })();
                self.server.db_updated(&self.db);
                reply_fatal(&reply, result)?;
            }
            Command::PurgeDocs { pairs, reply } => {
                if self.compactor.is_some() {
                    let _ = reply.send(Err(DbError::PurgeDuringCompaction));
                } else {
                    self.delayed_commit = None; // purge commits by itself
                    let result = pipeline::purge_docs(&mut self.db, &pairs);
                    self.server.db_updated(&self.db);
                    reply_fatal(&reply, result)?;
                }
            }
            Command::StartCompact { reply } => {
                if self.compactor.is_none() {
                    tracing::info!(db = %self.db.name(), "starting compaction");
                    self.compactor = Some(self.spawn_compactor());
                }
                let _ = reply.send(Ok(()));
            }
            Command::CancelCompact { reply } => {
                if let Some(handle) = self.compactor.take() {
                    handle.cancel_and_join();
                    dbfile::delete_file(&compactor::target_path_for(&self.db))?;
                    tracing::info!(db = %self.db.name(), "compaction cancelled");
                }
                let _ = reply.send(Ok(()));
            }
            Command::CompactDone { path } => {
                self.handle_compact_done(path)?;
            }
            Command::CompactionStatus { reply } => {
                let _ = reply.send(CompactionStatus {
                    running: self.compactor.is_some(),
                    restarts: self.compact_restarts,
                });
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn spawn_compactor(&self) -> CompactorHandle {
        let tx = self.tx.clone();
        compactor::spawn(self.db.clone(), move |path| {
            let _ = tx.send(Command::CompactDone { path });
        })
    }

    fn handle_update_docs(
        &mut self,
        first: UpdateRequest,
        pending: &mut Option<Command>,
    ) -> DbResult<()> {
        let merge_conflicts = first.merge_conflicts;
        let mut full_commit = first.full_commit;
        let mut clients = vec![first.reply];
        let mut groups = queue_request(first.docs, 0);
        let locals: Vec<LocalEdit> = first
            .locals
            .into_iter()
            .map(|w| LocalEdit {
                client: 0,
                doc_ref: w.doc_ref,
                id: w.id,
                prev_rev: w.prev_rev,
                delete: w.delete,
                body: w.body,
            })
            .collect();

        // Coalesce compatible batches already waiting in the mailbox. This
        // is purely an optimization: results must match processing them
        // one by one.
        if locals.is_empty() {
            while let Ok(next) = self.rx.try_recv() {
                match next {
                    Command::UpdateDocs(request)
                        if request.locals.is_empty()
                            && request.merge_conflicts == merge_conflicts =>
                    {
                        let offset = clients.len();
                        let request = *request;
                        clients.push(request.reply);
                        full_commit |= request.full_commit;
                        let more = queue_request(request.docs, 0);
                        groups = merger::merge_grouped(groups, more, offset);
                    }
                    other => {
                        *pending = Some(other);
                        break;
                    }
                }
            }
        }

        let batch = UpdateBatch {
            groups,
            locals,
            clients,
            merge_conflicts,
            full_commit,
        };
        match pipeline::update_docs(&mut self.db, &batch)? {
            BatchOutcome::Retry => Ok(()),
            BatchOutcome::Applied { seq_changed, ddocs } => {
                if batch.full_commit {
                    self.commit_now()?;
                } else {
                    self.arm_delayed_commit()?;
                }
                self.server.db_updated(&self.db);
                if seq_changed {
                    self.notifier.notify(DbEvent::Updated {
                        name: self.db.name().to_string(),
                    });
                }
                for client in &batch.clients {
                    let _ = client.send(WriteEvent::Done);
                }
                for id in ddocs {
                    self.notifier.notify(DbEvent::DdocUpdated {
                        name: self.db.name().to_string(),
                        id,
                    });
                }
                Ok(())
            }
        }
    }

    fn handle_compact_done(&mut self, path: PathBuf) -> DbResult<()> {
        let Some(handle) = self.compactor.take() else {
            // A cancel raced the completion; the partial file was removed.
            return Ok(());
        };
        handle.join();

        match compactor::install_compacted(&self.db, &path)? {
            Some(new_db) => {
                // The swapped-in state is live; the old fd closes with the
                // old state. The compactor handle was already cleared.
                self.db = new_db;
                self.delayed_commit = None;
                self.server.db_updated(&self.db);
                self.notifier.notify(DbEvent::Compacted {
                    name: self.db.name().to_string(),
                });
            }
            None => {
                // Writes landed while copying: go around again from the
                // target's checkpointed seq.
                self.compact_restarts += 1;
                self.compactor = Some(self.spawn_compactor());
            }
        }
        Ok(())
    }

    // Arm the deadline only when a header write is actually owed, so an
    // all-conflict batch does not schedule a pointless wakeup.
    fn arm_delayed_commit(&mut self) -> DbResult<()> {
        if self.delayed_commit.is_none() && self.db.build_header()? != self.db.header {
            self.delayed_commit = Some(Instant::now() + DELAYED_COMMIT_AFTER);
        }
        Ok(())
    }

    fn fire_delayed_commit(&mut self) -> DbResult<()> {
        self.delayed_commit = None;
        self.db.commit()?;
        Ok(())
    }

    fn commit_now(&mut self) -> DbResult<()> {
        self.delayed_commit = None;
        self.db.commit()?;
        Ok(())
    }
}

// Answer the caller, then propagate a cross-cutting fault (disk, header)
// so the actor terminates and the supervisor observes the reason.
fn reply_fatal<T>(reply: &Sender<DbResult<T>>, result: DbResult<T>) -> DbResult<()> {
    match result {
        Ok(value) => {
            let _ = reply.send(Ok(value));
            Ok(())
        }
        Err(e) => {
            let _ = reply.send(Err(DbError::InvalidState(format!(
                "updater terminating: {e}"
            ))));
            Err(e)
        }
    }
}

fn queue_request(docs: Vec<(u64, Doc)>, client: usize) -> Vec<DocGroup> {
    merger::group_alike(
        docs.into_iter()
            .map(|(doc_ref, doc)| QueuedDoc {
                client,
                doc_ref,
                doc,
            })
            .collect(),
    )
}
