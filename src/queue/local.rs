//! Local state that handlers project events into, with all-or-nothing writes.
//!
//! A handler never writes to [`LocalStore`] directly. It receives a
//! [`UnitOfWork`] that reads through to the store but buffers every write;
//! the dispatcher commits the buffer only after the handler returns `Ok`.
//! A handler that errors or panics therefore leaves no trace.
//!
//! Records live in memory only. The binary uses this store as a stand-in for
//! the storefront's own persistence, so projections are rebuilt from nothing
//! after a restart.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

/// Keyed JSON records, e.g. `order:O-100` or `stock:SKU-1`.
#[derive(Debug, Default)]
pub struct LocalStore {
    records: RwLock<BTreeMap<String, Value>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Starts a unit of work over this store.
    pub fn begin(self: &Arc<Self>) -> UnitOfWork {
        UnitOfWork {
            base: Arc::clone(self),
            staged: BTreeMap::new(),
        }
    }

    /// Applies every staged write at once.
    pub fn commit(&self, work: UnitOfWork) {
        let mut records = self.write();
        for (key, change) in work.staged {
            match change {
                Some(value) => {
                    records.insert(key, value);
                }
                None => {
                    records.remove(&key);
                }
            }
        }
    }
}

/// Buffered writes against a [`LocalStore`].
///
/// `None` in the buffer is a staged delete.
#[derive(Debug)]
pub struct UnitOfWork {
    base: Arc<LocalStore>,
    staged: BTreeMap<String, Option<Value>>,
}

impl UnitOfWork {
    /// Reads a record, seeing this unit's own staged writes first.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.staged.get(key) {
            Some(change) => change.clone(),
            None => self.base.get(key),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.staged.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.staged.insert(key.into(), None);
    }

    /// Number of staged writes.
    pub fn pending_writes(&self) -> usize {
        self.staged.len()
    }
}
