//! In-process most-recently-used node cache.
//!
//! Sits in front of node reads by id. Any structural change to stored
//! hierarchy (clearing, soft deletes, rolled back savepoints) drops the
//! whole cache rather than tracking which entries it touched.

use hiercache_kernel::{NavNode, NodeId};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Entries = Option<LruCache<NodeId, Arc<NavNode>>>;

/// Nodes by id, behind their own mutex. A zero capacity disables it.
#[derive(Debug)]
pub struct HotNodeCache {
    entries: Mutex<Entries>,
}

impl HotNodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(NonZeroUsize::new(capacity).map(LruCache::new)),
        }
    }

    // Entries are disposable, so a poisoned lock just hands back the data.
    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a node and mark it most recently used.
    pub fn get(&self, id: &NodeId) -> Option<Arc<NavNode>> {
        self.entries().as_mut()?.get(id).cloned()
    }

    /// Insert or refresh a node, evicting the least recently used entry
    /// past capacity. Nodes without an id are ignored.
    pub fn insert(&self, node: Arc<NavNode>) {
        let Some(id) = node.id else {
            return;
        };
        if let Some(entries) = self.entries().as_mut() {
            entries.put(id, node);
        }
    }

    /// Drop one node, e.g. when it turns virtual.
    pub fn remove(&self, id: &NodeId) -> bool {
        self.entries()
            .as_mut()
            .is_some_and(|entries| entries.pop(id).is_some())
    }

    pub fn clear(&self) {
        if let Some(entries) = self.entries().as_mut() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries().as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Membership without touching recency.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries()
            .as_ref()
            .is_some_and(|entries| entries.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiercache_kernel::{InstanceKey, NodeKey};

    fn node(n: u64) -> Arc<NavNode> {
        let mut node = NavNode::new(
            NodeKey::instances(None, "spec", vec![InstanceKey::new(1, n)]),
            format!("node {n}"),
        );
        node.id = Some(NodeId::generate());
        Arc::new(node)
    }

    fn id_of(node: &Arc<NavNode>) -> NodeId {
        node.id.expect("test nodes carry ids")
    }

    #[test]
    fn eleventh_insert_evicts_least_recently_used() {
        let cache = HotNodeCache::new(10);
        let nodes: Vec<_> = (0..11).map(node).collect();
        for n in &nodes[..10] {
            cache.insert(n.clone());
        }
        cache.insert(nodes[10].clone());

        assert_eq!(cache.len(), 10);
        assert!(!cache.contains(&id_of(&nodes[0])));
        for n in &nodes[1..] {
            assert!(cache.contains(&id_of(n)));
        }
    }

    #[test]
    fn reads_refresh_recency() {
        let cache = HotNodeCache::new(2);
        let a = node(1);
        let b = node(2);
        let c = node(3);
        cache.insert(a.clone());
        cache.insert(b.clone());
        assert!(cache.get(&id_of(&a)).is_some());
        cache.insert(c.clone());

        assert!(cache.contains(&id_of(&a)));
        assert!(!cache.contains(&id_of(&b)));
        assert!(cache.contains(&id_of(&c)));
    }

    #[test]
    fn reinsert_does_not_duplicate() {
        let cache = HotNodeCache::new(3);
        let a = node(1);
        cache.insert(a.clone());
        cache.insert(a.clone());
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&id_of(&a)).is_none());
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let cache = HotNodeCache::new(0);
        let a = node(1);
        cache.insert(a.clone());
        assert!(cache.is_empty());
        assert!(!cache.remove(&id_of(&a)));
        assert!(cache.get(&id_of(&a)).is_none());
    }
}
