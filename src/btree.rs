//! Append-only copy-on-write B+-tree.
//!
//! Nodes are postcard term frames in the database file; a mutation rewrites
//! the leaf-to-root path and returns a new root pointer, so every committed
//! header names a complete immutable tree. Interior entries carry the
//! subtree's reduction, making totals (doc counts, sizes) O(1) from the
//! root.
//!
//! The tree is parameterized by a [`TreeSpec`]: `split`/`join` project the
//! caller's item into the stored key/value pair and back, `reduce`/
//! `rereduce` fold items and child reductions. This mirrors how the write
//! path wants to think in full documents while the tree thinks in disk
//! records.
//!
//! ## Invariants
//!
//! - Keys are unique and sorted within and across leaves.
//! - An interior entry's key is the greatest key of its subtree.
//! - Node frames are immutable once written; old roots stay readable until
//!   compaction drops them.

use crate::dbfile::DbFile;
use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Soft cap on a node's serialized size before it is split.
const CHUNK_THRESHOLD: usize = 1279;

/// Projection and reduction callbacks for one tree.
pub trait TreeSpec {
    /// In-memory form handled by callers.
    type Item: Clone;
    /// Stored key.
    type Key: Ord + Clone + Serialize + DeserializeOwned;
    /// Stored value (the disk form of an item).
    type Value: Clone + Serialize + DeserializeOwned;
    /// Reduction carried on interior entries and the root.
    type Reduction: Clone + Serialize + DeserializeOwned;

    /// Project an item into its stored pair.
    fn split(item: &Self::Item) -> (Self::Key, Self::Value);
    /// Reassemble an item from its stored pair.
    fn join(key: Self::Key, value: Self::Value) -> Self::Item;
    /// Fold a leaf's items.
    fn reduce(items: &[Self::Item]) -> Self::Reduction;
    /// Fold child reductions.
    fn rereduce(reductions: &[Self::Reduction]) -> Self::Reduction;
}

/// Serialized root state, stored inside the database header.
///
/// The reduction is kept as opaque postcard bytes so headers need no
/// per-tree generics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeState {
    /// `(root pointer, encoded reduction)`, or `None` for an empty tree.
    pub root: Option<(u64, Vec<u8>)>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "K: Serialize + DeserializeOwned, V: Serialize + DeserializeOwned, \
                 R: Serialize + DeserializeOwned")]
enum DiskNode<K, V, R> {
    /// Interior node: `(greatest key of subtree, (child ptr, reduction))`.
    Kp(Vec<(K, (u64, R))>),
    /// Leaf node: sorted `(key, value)` pairs.
    Kv(Vec<(K, V)>),
}

/// Flow control for [`Btree::foldl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// Keep iterating.
    Continue,
    /// Stop the fold early.
    Stop,
}

enum Action<S: TreeSpec> {
    Remove(S::Key),
    Insert(S::Key, S::Value),
}

impl<S: TreeSpec> Action<S> {
    fn key(&self) -> &S::Key {
        match self {
            Action::Remove(k) => k,
            Action::Insert(k, _) => k,
        }
    }
    fn rank(&self) -> u8 {
        // Removes sort before inserts of the same key, so replacing a key
        // in one batch behaves as remove-then-insert.
        match self {
            Action::Remove(_) => 0,
            Action::Insert(..) => 1,
        }
    }
}

/// One append-only B+-tree bound to an open database file.
pub struct Btree<S: TreeSpec> {
    file: Arc<DbFile>,
    root: Option<(u64, S::Reduction)>,
}

impl<S: TreeSpec> Clone for Btree<S> {
    fn clone(&self) -> Self {
        Btree {
            file: Arc::clone(&self.file),
            root: self.root.clone(),
        }
    }
}

impl<S: TreeSpec> Btree<S> {
    /// Bind a tree to `file`, resuming from a serialized root state.
    pub fn open(file: Arc<DbFile>, state: &TreeState) -> DbResult<Btree<S>> {
        let root = match &state.root {
            None => None,
            Some((ptr, red_bytes)) => {
                let reduction: S::Reduction = postcard::from_bytes(red_bytes)
                    .map_err(|e| DbError::Decode(e.to_string()))?;
                Some((*ptr, reduction))
            }
        };
        Ok(Btree { file, root })
    }

    /// Serialize the root state for storage in a header.
    pub fn get_state(&self) -> DbResult<TreeState> {
        let root = match &self.root {
            None => None,
            Some((ptr, reduction)) => {
                let bytes = postcard::to_allocvec(reduction)
                    .map_err(|e| DbError::Encode(e.to_string()))?;
                Some((*ptr, bytes))
            }
        };
        Ok(TreeState { root })
    }

    /// The file this tree reads and writes.
    pub fn file(&self) -> &Arc<DbFile> {
        &self.file
    }

    /// The full-tree reduction, or `None` for an empty tree.
    pub fn reduction(&self) -> Option<&S::Reduction> {
        self.root.as_ref().map(|(_, r)| r)
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn read_node(&self, ptr: u64) -> DbResult<DiskNode<S::Key, S::Value, S::Reduction>> {
        self.file.pread_term(ptr)
    }

    /// Look up one key.
    pub fn lookup_one(&self, key: &S::Key) -> DbResult<Option<S::Item>> {
        let Some((mut ptr, _)) = self.root.clone() else {
            return Ok(None);
        };
        loop {
            match self.read_node(ptr)? {
                DiskNode::Kv(kvs) => {
                    return Ok(kvs
                        .into_iter()
                        .find(|(k, _)| k == key)
                        .map(|(k, v)| S::join(k, v)));
                }
                DiskNode::Kp(entries) => {
                    let Some((_, (child, _))) = entries.iter().find(|(last, _)| key <= last)
                    else {
                        return Ok(None);
                    };
                    ptr = *child;
                }
            }
        }
    }

    /// Look up many keys, preserving input order.
    pub fn lookup(&self, keys: &[S::Key]) -> DbResult<Vec<Option<S::Item>>> {
        keys.iter().map(|k| self.lookup_one(k)).collect()
    }

    /// Insert items (replacing equal keys) and remove keys, in one pass.
    pub fn add_remove(&mut self, additions: Vec<S::Item>, removals: Vec<S::Key>) -> DbResult<()> {
        if additions.is_empty() && removals.is_empty() {
            return Ok(());
        }
        let mut actions: Vec<Action<S>> = Vec::with_capacity(additions.len() + removals.len());
        for key in removals {
            actions.push(Action::Remove(key));
        }
        for item in &additions {
            let (k, v) = S::split(item);
            actions.push(Action::Insert(k, v));
        }
        actions.sort_by(|a, b| a.key().cmp(b.key()).then(a.rank().cmp(&b.rank())));

        let root_ptr = self.root.as_ref().map(|(p, _)| *p);
        let mut entries = self.modify(root_ptr, actions)?;

        // Collapse upward until one root remains.
        while entries.len() > 1 {
            entries = self.write_kp_chunks(entries)?;
        }
        self.root = entries.into_iter().next().map(|(_, pr)| pr);
        Ok(())
    }

    /// Insert items only.
    pub fn add(&mut self, additions: Vec<S::Item>) -> DbResult<()> {
        self.add_remove(additions, Vec::new())
    }

    // Apply actions below `ptr`, returning replacement interior entries.
    fn modify(
        &self,
        ptr: Option<u64>,
        actions: Vec<Action<S>>,
    ) -> DbResult<Vec<(S::Key, (u64, S::Reduction))>> {
        match ptr {
            None => {
                let kvs: Vec<(S::Key, S::Value)> = actions
                    .into_iter()
                    .filter_map(|a| match a {
                        Action::Insert(k, v) => Some((k, v)),
                        Action::Remove(_) => None,
                    })
                    .collect();
                self.write_kv_chunks(kvs)
            }
            Some(ptr) => match self.read_node(ptr)? {
                DiskNode::Kv(kvs) => {
                    let merged = merge_actions::<S>(kvs, actions);
                    self.write_kv_chunks(merged)
                }
                DiskNode::Kp(entries) => {
                    let mut out: Vec<(S::Key, (u64, S::Reduction))> = Vec::new();
                    let mut actions = actions.into_iter().peekable();
                    let last_index = entries.len() - 1;
                    for (i, (last_key, (child, reduction))) in entries.into_iter().enumerate() {
                        let mut mine: Vec<Action<S>> = Vec::new();
                        if i == last_index {
                            // The rightmost child absorbs everything left,
                            // including keys beyond the recorded maximum.
                            mine.extend(actions.by_ref());
                        } else {
                            while actions.peek().is_some_and(|a| a.key() <= &last_key) {
                                mine.push(actions.next().expect("peeked"));
                            }
                        }
                        if mine.is_empty() {
                            out.push((last_key, (child, reduction)));
                        } else {
                            out.extend(self.modify(Some(child), mine)?);
                        }
                    }
                    if out.len() <= 1 {
                        Ok(out)
                    } else {
                        self.write_kp_chunks(out)
                    }
                }
            },
        }
    }

    fn write_kv_chunks(
        &self,
        kvs: Vec<(S::Key, S::Value)>,
    ) -> DbResult<Vec<(S::Key, (u64, S::Reduction))>> {
        let mut out = Vec::new();
        for chunk in chunkify(kvs, 1)? {
            let items: Vec<S::Item> = chunk
                .iter()
                .map(|(k, v)| S::join(k.clone(), v.clone()))
                .collect();
            let reduction = S::reduce(&items);
            let last_key = chunk.last().expect("chunkify yields non-empty chunks").0.clone();
            let ptr = self
                .file
                .append_term(&DiskNode::<S::Key, S::Value, S::Reduction>::Kv(chunk))?;
            out.push((last_key, (ptr, reduction)));
        }
        Ok(out)
    }

    fn write_kp_chunks(
        &self,
        entries: Vec<(S::Key, (u64, S::Reduction))>,
    ) -> DbResult<Vec<(S::Key, (u64, S::Reduction))>> {
        let mut out = Vec::new();
        // At least two entries per interior chunk, so collapsing towards a
        // single root always terminates even with oversized keys.
        for chunk in chunkify(entries, 2)? {
            let reductions: Vec<S::Reduction> =
                chunk.iter().map(|(_, (_, r))| r.clone()).collect();
            let reduction = S::rereduce(&reductions);
            let last_key = chunk.last().expect("chunkify yields non-empty chunks").0.clone();
            let ptr = self
                .file
                .append_term(&DiskNode::<S::Key, S::Value, S::Reduction>::Kp(chunk))?;
            out.push((last_key, (ptr, reduction)));
        }
        Ok(out)
    }

    /// Fold items in ascending key order, starting at `start` (inclusive).
    pub fn foldl<F>(&self, start: Option<&S::Key>, f: &mut F) -> DbResult<Fold>
    where
        F: FnMut(S::Item) -> DbResult<Fold>,
    {
        let Some((ptr, _)) = &self.root else {
            return Ok(Fold::Continue);
        };
        self.fold_node(*ptr, start, f)
    }

    fn fold_node<F>(&self, ptr: u64, start: Option<&S::Key>, f: &mut F) -> DbResult<Fold>
    where
        F: FnMut(S::Item) -> DbResult<Fold>,
    {
        match self.read_node(ptr)? {
            DiskNode::Kv(kvs) => {
                for (k, v) in kvs {
                    if start.is_some_and(|s| &k < s) {
                        continue;
                    }
                    if f(S::join(k, v))? == Fold::Stop {
                        return Ok(Fold::Stop);
                    }
                }
                Ok(Fold::Continue)
            }
            DiskNode::Kp(entries) => {
                for (last_key, (child, _)) in entries {
                    if start.is_some_and(|s| &last_key < s) {
                        continue;
                    }
                    if self.fold_node(child, start, f)? == Fold::Stop {
                        return Ok(Fold::Stop);
                    }
                }
                Ok(Fold::Continue)
            }
        }
    }
}

fn merge_actions<S: TreeSpec>(
    kvs: Vec<(S::Key, S::Value)>,
    actions: Vec<Action<S>>,
) -> Vec<(S::Key, S::Value)> {
    let mut out: Vec<(S::Key, S::Value)> = Vec::with_capacity(kvs.len());
    let mut kvs = kvs.into_iter().peekable();
    for action in actions {
        while kvs.peek().is_some_and(|(k, _)| k < action.key()) {
            out.push(kvs.next().expect("peeked"));
        }
        match action {
            Action::Remove(key) => {
                if kvs.peek().is_some_and(|(k, _)| *k == key) {
                    kvs.next();
                }
            }
            Action::Insert(key, value) => {
                if kvs.peek().is_some_and(|(k, _)| *k == key) {
                    kvs.next();
                }
                // Replace a previous insert of the same key within this batch.
                if out.last().is_some_and(|(k, _)| *k == key) {
                    out.pop();
                }
                out.push((key, value));
            }
        }
    }
    out.extend(kvs);
    out
}

// Split a sorted entry list into write-sized chunks by serialized size.
// A chunk is closed once it holds at least `min_per_chunk` entries and the
// next entry would push it past the threshold.
fn chunkify<T: Serialize>(entries: Vec<T>, min_per_chunk: usize) -> DbResult<Vec<Vec<T>>> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    let mut chunks: Vec<Vec<T>> = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_size = 0usize;
    for entry in entries {
        let size = postcard::to_allocvec(&entry)
            .map_err(|e| DbError::Encode(e.to_string()))?
            .len();
        if current_size + size > CHUNK_THRESHOLD && current.len() >= min_per_chunk {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(entry);
        current_size += size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}
