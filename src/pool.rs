//! Per-kind tables of analysis state keyed by (node, context).
//!
//! Logical states and version managers are long-lived and looked up on
//! every traversal. Each entry sits behind its own lock so that disjoint
//! (node, context) pairs never contend; the table lock is only held long
//! enough to find or insert the entry.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::primitives::ContextId;
use crate::primitives::NodeId;

pub type StateKey = (NodeId, ContextId);

pub struct StateTable<T> {
    entries: RwLock<FxHashMap<StateKey, Arc<T>>>,
}

impl<T> StateTable<T> {
    pub fn new() -> StateTable<T> {
        return StateTable { entries: RwLock::new(FxHashMap::default()) };
    }

    pub fn get(&self, node: NodeId, ctx: ContextId) -> Option<Arc<T>> {
        return self.entries.read().get(&(node, ctx)).cloned();
    }

    pub fn contains(&self, node: NodeId, ctx: ContextId) -> bool {
        return self.entries.read().contains_key(&(node, ctx));
    }

    /// Find the entry, creating it with `init` on first use.
    pub fn get_or_create(&self, node: NodeId, ctx: ContextId, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(entry) = self.get(node, ctx) {
            return entry;
        }
        let mut entries = self.entries.write();
        return entries.entry((node, ctx)).or_insert_with(|| Arc::new(init())).clone();
    }

    pub fn remove(&self, node: NodeId, ctx: ContextId) -> Option<Arc<T>> {
        return self.entries.write().remove(&(node, ctx));
    }

    /// Snapshot of every entry, in no particular order.
    pub fn values(&self) -> Vec<Arc<T>> {
        return self.entries.read().values().cloned().collect();
    }

    /// Snapshot of the entries of one context.
    pub fn in_context(&self, ctx: ContextId) -> Vec<(NodeId, Arc<T>)> {
        let entries = self.entries.read();
        let mut out: Vec<(NodeId, Arc<T>)> = entries
            .iter()
            .filter(|((_, c), _)| *c == ctx)
            .map(|((n, _), e)| (*n, e.clone()))
            .collect();
        out.sort_by_key(|(n, _)| *n);
        return out;
    }

    pub fn len(&self) -> usize {
        return self.entries.read().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }
}

impl<T> Default for StateTable<T> {
    fn default() -> StateTable<T> {
        return StateTable::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn creates_once() {
        let table: StateTable<Mutex<u32>> = StateTable::new();
        let a = table.get_or_create(NodeId(1), ContextId(0), || Mutex::new(5));
        *a.lock() += 1;
        let b = table.get_or_create(NodeId(1), ContextId(0), || Mutex::new(0));
        assert_eq!(*b.lock(), 6);
        assert!(table.get(NodeId(1), ContextId(1)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lists_one_context() {
        let table: StateTable<u32> = StateTable::new();
        table.get_or_create(NodeId(2), ContextId(0), || 2);
        table.get_or_create(NodeId(1), ContextId(0), || 1);
        table.get_or_create(NodeId(1), ContextId(1), || 9);
        let nodes: Vec<NodeId> = table.in_context(ContextId(0)).into_iter().map(|(n, _)| n).collect();
        assert_eq!(nodes, vec![NodeId(1), NodeId(2)]);
        assert!(table.remove(NodeId(1), ContextId(1)).is_some());
        assert_eq!(table.len(), 2);
    }
}
