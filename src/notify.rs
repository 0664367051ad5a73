//! Change notification seams.
//!
//! The updater reports observable events through these traits; the process
//! embedding a database decides what to do with them. Tests use the
//! channel-backed implementation to assert on event order.

use crate::db::Db;
use crate::docs::DocId;
use crate::error::DbError;

/// Broadcast events emitted by the updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbEvent {
    /// The database advanced its update sequence.
    Updated {
        /// Database name.
        name: String,
    },
    /// A design document changed in the committed batch.
    DdocUpdated {
        /// Database name.
        name: String,
        /// The design document's id.
        id: DocId,
    },
    /// A compaction swapped in a rebuilt file.
    Compacted {
        /// Database name.
        name: String,
    },
}

/// Receiver for broadcast events.
pub trait Notifier: Send + Sync {
    /// Deliver one event. Must not block the updater for long.
    fn notify(&self, event: DbEvent);
}

/// The supervising server's view of the updater.
///
/// `db_updated` fires with a fresh snapshot after every state change;
/// `db_closed` fires once when the actor terminates, carrying the fatal
/// error if there was one.
pub trait StateSink: Send + Sync {
    /// A new state was produced.
    fn db_updated(&self, db: &Db);
    /// The actor terminated.
    fn db_closed(&self, name: &str, error: Option<&DbError>) {
        let _ = (name, error);
    }
}

/// A state sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateSink;

impl StateSink for NullStateSink {
    fn db_updated(&self, _db: &Db) {}
}

/// A notifier that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: DbEvent) {}
}

/// A notifier that forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: crossbeam_channel::Sender<DbEvent>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end for assertions.
    pub fn new() -> (ChannelNotifier, crossbeam_channel::Receiver<DbEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ChannelNotifier { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: DbEvent) {
        let _ = self.tx.send(event);
    }
}
