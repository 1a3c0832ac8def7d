//! In-memory record store.
//!
//! Each table maps an id to an `Arc<Mutex<Record>>`. The table lock is held
//! only to look up or insert an entry; every mutation locks the one record it
//! touches. Records are never deleted.
//!
//! Lock order when more than one record is held: task, then inbound, then
//! node. Nothing else is locked while a node record is held. Table locks are
//! leaf locks: one may be taken while records are held, never the reverse.

use crate::inbounds::Inbound;
use crate::node::Node;
use crate::task::Task;
use mindvpn_common::{InboundId, NodeId, TaskId};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Locks a record, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct TableInner<K, V> {
    rows: HashMap<K, Arc<Mutex<V>>>,
    /// Secondary unique keys (hostname, node/port pair) to row id
    unique: HashMap<String, K>,
}

/// A table of records with monotonically allocated ids.
pub struct Table<K, V> {
    inner: RwLock<TableInner<K, V>>,
    next_id: AtomicU64,
}

impl<K, V> Table<K, V>
where
    K: Copy + Eq + Hash + Ord + From<u64>,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                rows: HashMap::new(),
                unique: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableInner<K, V>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableInner<K, V>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts a record built from its freshly allocated id.
    ///
    /// When `unique_key` is given and already claimed, nothing is inserted
    /// and the id owning the key is returned as the error.
    pub fn insert(&self, unique_key: Option<String>, build: impl FnOnce(K) -> V) -> Result<K, K> {
        let mut inner = self.write();
        if let Some(key) = &unique_key {
            if let Some(existing) = inner.unique.get(key) {
                return Err(*existing);
            }
        }
        let id = K::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        inner.rows.insert(id, Arc::new(Mutex::new(build(id))));
        if let Some(key) = unique_key {
            inner.unique.insert(key, id);
        }
        Ok(id)
    }

    /// Frees a unique key so another record may claim it.
    pub fn release_key(&self, key: &str) {
        self.write().unique.remove(key);
    }

    pub fn lookup(&self, key: &str) -> Option<K> {
        self.read().unique.get(key).copied()
    }

    pub fn get(&self, id: K) -> Option<Arc<Mutex<V>>> {
        self.read().rows.get(&id).cloned()
    }

    /// All records ordered by id.
    pub fn all(&self) -> Vec<(K, Arc<Mutex<V>>)> {
        let mut rows: Vec<_> = self
            .read()
            .rows
            .iter()
            .map(|(id, row)| (*id, row.clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }

    pub fn len(&self) -> usize {
        self.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for Table<K, V>
where
    K: Copy + Eq + Hash + Ord + From<u64>,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Node, task and inbound tables shared by the registry and orchestrator.
#[derive(Default)]
pub struct Store {
    pub nodes: Table<NodeId, Node>,
    pub tasks: Table<TaskId, Task>,
    pub inbounds: Table<InboundId, Inbound>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }
}
