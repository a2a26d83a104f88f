//! Typed, indexed, in-memory object store with transactions.
//!
//! Entities live in per-type arenas ([`Table`]); all cross-entity references
//! are opaque [`Id`]s. Secondary indexes are lambda-computed: the key
//! function returns `None` to exclude a row (filtered indexes) or an
//! [`IndexKey`] (possibly composite) to include it. Index maintenance is
//! automatic on insert/update/delete.
//!
//! Concurrency model: a single writer at a time behind a `parking_lot`
//! RwLock. `view` takes the read lock and sees a consistent snapshot;
//! `transaction` takes the write lock, observes its own writes, and rolls
//! every table back through an undo log if the closure returns `Err`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// A typed handle into a [`Table`]. Ids are never reused within a store.
pub struct Id<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Id {
            raw,
            _marker: PhantomData,
        }
    }

    /// The raw arena index. Useful for composite index keys.
    pub fn raw(self) -> u64 {
        self.raw
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.raw)
    }
}

// ---------------------------------------------------------------------------
// Index keys
// ---------------------------------------------------------------------------

/// A hashable key produced by an index lambda.
///
/// Composite keys are expressed as `Tuple`; filtered indexes return `None`
/// from the key function instead of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    Raw(u64),
    Tuple(Vec<IndexKey>),
}

impl From<bool> for IndexKey {
    fn from(v: bool) -> Self {
        IndexKey::Bool(v)
    }
}
impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        IndexKey::Int(v)
    }
}
impl From<&str> for IndexKey {
    fn from(v: &str) -> Self {
        IndexKey::Str(v.to_string())
    }
}
impl From<String> for IndexKey {
    fn from(v: String) -> Self {
        IndexKey::Str(v)
    }
}
impl<T> From<Id<T>> for IndexKey {
    fn from(v: Id<T>) -> Self {
        IndexKey::Raw(v.raw())
    }
}
impl<A: Into<IndexKey>, B: Into<IndexKey>> From<(A, B)> for IndexKey {
    fn from((a, b): (A, B)) -> Self {
        IndexKey::Tuple(vec![a.into(), b.into()])
    }
}

/// Build a composite key from three parts.
pub fn key3(a: impl Into<IndexKey>, b: impl Into<IndexKey>, c: impl Into<IndexKey>) -> IndexKey {
    IndexKey::Tuple(vec![a.into(), b.into(), c.into()])
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

type KeyFn<T> = fn(&T) -> Option<IndexKey>;

struct IndexDef<T> {
    name: &'static str,
    key_fn: KeyFn<T>,
    map: HashMap<IndexKey, BTreeSet<u64>>,
}

enum Undo<T> {
    Inserted(u64),
    Updated(u64, T),
    Deleted(u64, T),
}

/// One typed arena plus its secondary indexes and transaction undo log.
pub struct Table<T: Clone> {
    rows: HashMap<u64, T>,
    next_id: u64,
    indexes: Vec<IndexDef<T>>,
    undo: Vec<Undo<T>>,
}

impl<T: Clone> Default for Table<T> {
    fn default() -> Self {
        Table {
            rows: HashMap::new(),
            next_id: 1,
            indexes: Vec::new(),
            undo: Vec::new(),
        }
    }
}

impl<T: Clone> Table<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secondary index. Must be called before any rows exist.
    pub fn add_index(&mut self, name: &'static str, key_fn: KeyFn<T>) {
        debug_assert!(self.rows.is_empty(), "indexes must be registered on an empty table");
        self.indexes.push(IndexDef {
            name,
            key_fn,
            map: HashMap::new(),
        });
    }

    /// Insert a row, maintaining every index. Ids are monotonically
    /// increasing, so ascending-id order is insertion order.
    pub fn insert(&mut self, row: T) -> Id<T> {
        let raw = self.next_id;
        self.next_id += 1;
        for idx in &mut self.indexes {
            if let Some(key) = (idx.key_fn)(&row) {
                idx.map.entry(key).or_default().insert(raw);
            }
        }
        self.rows.insert(raw, row);
        self.undo.push(Undo::Inserted(raw));
        Id::from_raw(raw)
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.rows.get(&id.raw)
    }

    pub fn contains(&self, id: Id<T>) -> bool {
        self.rows.contains_key(&id.raw)
    }

    /// Mutate a row in place through a closure, reindexing afterwards.
    ///
    /// Returns `false` if the id is not present.
    pub fn update(&mut self, id: Id<T>, f: impl FnOnce(&mut T)) -> bool {
        let Some(row) = self.rows.get_mut(&id.raw) else {
            return false;
        };
        let before = row.clone();
        f(row);
        let after = row.clone();
        for idx in &mut self.indexes {
            let old_key = (idx.key_fn)(&before);
            let new_key = (idx.key_fn)(&after);
            if old_key != new_key {
                if let Some(key) = old_key {
                    if let Some(set) = idx.map.get_mut(&key) {
                        set.remove(&id.raw);
                        if set.is_empty() {
                            idx.map.remove(&key);
                        }
                    }
                }
                if let Some(key) = new_key {
                    idx.map.entry(key).or_default().insert(id.raw);
                }
            }
        }
        self.undo.push(Undo::Updated(id.raw, before));
        true
    }

    /// Remove a row, maintaining every index.
    pub fn delete(&mut self, id: Id<T>) -> bool {
        let Some(row) = self.rows.remove(&id.raw) else {
            return false;
        };
        for idx in &mut self.indexes {
            if let Some(key) = (idx.key_fn)(&row) {
                if let Some(set) = idx.map.get_mut(&key) {
                    set.remove(&id.raw);
                    if set.is_empty() {
                        idx.map.remove(&key);
                    }
                }
            }
        }
        self.undo.push(Undo::Deleted(id.raw, row));
        true
    }

    fn index(&self, name: &str) -> &IndexDef<T> {
        self.indexes
            .iter()
            .find(|i| i.name == name)
            .unwrap_or_else(|| panic!("no index named {name:?}"))
    }

    /// All ids matching `key` in ascending-id (insertion) order.
    pub fn lookup_all(&self, name: &str, key: impl Into<IndexKey>) -> Vec<Id<T>> {
        self.index(name)
            .map
            .get(&key.into())
            .map(|set| set.iter().map(|raw| Id::from_raw(*raw)).collect())
            .unwrap_or_default()
    }

    /// At most one id matching `key` (the earliest-inserted if several).
    pub fn lookup_any(&self, name: &str, key: impl Into<IndexKey>) -> Option<Id<T>> {
        self.index(name)
            .map
            .get(&key.into())
            .and_then(|set| set.iter().next())
            .map(|raw| Id::from_raw(*raw))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.rows.iter().map(|(raw, row)| (Id::from_raw(*raw), row))
    }

    fn commit_tx(&mut self) {
        self.undo.clear();
    }

    fn rollback_tx(&mut self) {
        while let Some(op) = self.undo.pop() {
            match op {
                Undo::Inserted(raw) => {
                    let _ = self.delete_for_rollback(raw);
                }
                Undo::Updated(raw, before) => {
                    self.restore_for_rollback(raw, before);
                }
                Undo::Deleted(raw, row) => {
                    for idx in &mut self.indexes {
                        if let Some(key) = (idx.key_fn)(&row) {
                            idx.map.entry(key).or_default().insert(raw);
                        }
                    }
                    self.rows.insert(raw, row);
                }
            }
        }
    }

    fn delete_for_rollback(&mut self, raw: u64) -> bool {
        let Some(row) = self.rows.remove(&raw) else {
            return false;
        };
        for idx in &mut self.indexes {
            if let Some(key) = (idx.key_fn)(&row) {
                if let Some(set) = idx.map.get_mut(&key) {
                    set.remove(&raw);
                    if set.is_empty() {
                        idx.map.remove(&key);
                    }
                }
            }
        }
        true
    }

    fn restore_for_rollback(&mut self, raw: u64, before: T) {
        if let Some(current) = self.rows.get(&raw) {
            for idx in &mut self.indexes {
                let cur_key = (idx.key_fn)(current);
                let old_key = (idx.key_fn)(&before);
                if cur_key != old_key {
                    if let Some(key) = cur_key {
                        if let Some(set) = idx.map.get_mut(&key) {
                            set.remove(&raw);
                            if set.is_empty() {
                                idx.map.remove(&key);
                            }
                        }
                    }
                    if let Some(key) = old_key {
                        idx.map.entry(key).or_default().insert(raw);
                    }
                }
            }
        }
        self.rows.insert(raw, before);
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Implemented by the concrete database struct so [`Store`] can commit or
/// roll back every table uniformly.
pub trait Transactional {
    fn commit_all(&mut self);
    fn rollback_all(&mut self);
}

/// The store: one RwLock around the whole database.
pub struct Store<D: Transactional> {
    state: RwLock<D>,
}

impl<D: Transactional> Store<D> {
    pub fn new(db: D) -> Self {
        Store {
            state: RwLock::new(db),
        }
    }

    /// Read-only snapshot. No writes are possible through `&D`.
    pub fn view<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.state.read())
    }

    /// Read-write transaction. Returning `Err` rolls every table back to
    /// its pre-transaction state; `Ok` commits.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&mut D) -> Result<R, E>) -> Result<R, E> {
        let mut guard = self.state.write();
        match f(&mut guard) {
            Ok(r) => {
                guard.commit_all();
                Ok(r)
            }
            Err(e) => {
                guard.rollback_all();
                Err(e)
            }
        }
    }
}

/// Commit/rollback helpers used by `Transactional` implementations.
pub fn commit_table<T: Clone>(table: &mut Table<T>) {
    table.commit_tx();
}

pub fn rollback_table<T: Clone>(table: &mut Table<T>) {
    table.rollback_tx();
}
