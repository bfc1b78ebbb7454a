//! Flow keys and the concurrent connection table.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::{Arc, PoisonError, RwLock};

/// The 4-tuple of a flow, oriented as captured: `src` is the local sender, `dst` is the endpoint it
/// is trying to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl FlowKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }
}

/// Deterministic `src<->dst` form used in logs.
impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.src, self.dst)
    }
}

/// What the table needs from an entry to cascade a stack-wide close.
pub trait FlowEntry: Send + Sync {
    fn shutdown(&self);
}

/// Maps live flows by key.
///
/// The lock is held only for the duration of a single operation, never across a state
/// transition of the flow itself.
pub struct ConnectionTable<T> {
    flows: RwLock<HashMap<FlowKey, Arc<T>>>,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: FlowEntry> ConnectionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry`; returns `false` (leaving the table untouched) if `key` is taken.
    pub fn insert(&self, key: FlowKey, entry: Arc<T>) -> bool {
        let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
        if flows.contains_key(&key) {
            return false;
        }
        flows.insert(key, entry);
        true
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<T>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<T>> {
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Removes `key` only while it still maps to `entry`, so a finished flow cannot evict a newer
    /// flow that reused its 4-tuple.
    pub fn remove_entry(&self, key: &FlowKey, entry: &Arc<T>) -> bool {
        let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
        match flows.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                flows.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the table and shuts every drained entry down. Returns how many were closed.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<Arc<T>> = {
            let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
            flows.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.shutdown();
        }
        drained.len()
    }
}
