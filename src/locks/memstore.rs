//! In-memory lock store.
//!
//! Lock state is a flat key/value mapping from node id to the JSON
//! serialization of a [`LockRecord`](crate::locks::LockRecord). Keeping
//! the stored form opaque (a string, not the struct) means a persistent
//! backend can be dropped in without touching the lock manager.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::repo::NodeId;

/// Key/value storage for serialized lock records.
pub trait LockStore: Send + Sync + 'static {
    fn get(&self, id: &NodeId) -> Option<String>;
    fn put(&self, id: &NodeId, record: String);
    fn remove(&self, id: &NodeId);
}

#[derive(Debug, Default)]
pub struct MemLockStore {
    map: Mutex<HashMap<NodeId, String>>,
}

impl MemLockStore {
    pub fn new() -> MemLockStore {
        MemLockStore::default()
    }
}

impl LockStore for MemLockStore {
    fn get(&self, id: &NodeId) -> Option<String> {
        self.map.lock().unwrap().get(id).cloned()
    }

    fn put(&self, id: &NodeId, record: String) {
        self.map.lock().unwrap().insert(id.clone(), record);
    }

    fn remove(&self, id: &NodeId) {
        self.map.lock().unwrap().remove(id);
    }
}
