//! Bounded node cache keyed by virtual chunk offset.
//!
//! The key carries the chunk's allocation generation, so entries belonging
//! to a chunk that was reclaimed and reused can never alias the new
//! contents.  The budget is a byte budget over [`Node::memory_size`];
//! accessors hold `Arc`s, so eviction never invalidates a node someone is
//! still traversing.

use crate::pool::FileOffset;
use crate::trie::node::Node;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;

/// Cache key: `(chunk, offset)` plus the chunk's allocation generation as
/// discriminator.  The same bytes serve every version referencing them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct VirtualOffset {
    raw: u64,
    generation: u8,
}

impl VirtualOffset {
    pub fn new(offset: FileOffset, generation: u8) -> Self {
        debug_assert!(!offset.is_none());
        Self { raw: offset.raw(), generation }
    }
}

struct Inner {
    map: LruCache<VirtualOffset, Arc<Node>>,
    bytes: usize,
}

pub struct NodeCache {
    inner: Mutex<Inner>,
    budget: usize,
}

impl NodeCache {
    pub fn new(budget: usize) -> Self {
        Self { inner: Mutex::new(Inner { map: LruCache::unbounded(), bytes: 0 }), budget }
    }

    pub fn get(&self, key: &VirtualOffset) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        match inner.map.get(key) {
            Some(node) => {
                crate::metrics::NODE_CACHE_HITS.inc();
                Some(Arc::clone(node))
            }
            None => {
                crate::metrics::NODE_CACHE_MISSES.inc();
                None
            }
        }
    }

    /// Inserts `node`, evicting least-recently-used entries until the byte
    /// budget is satisfied.  The newest entry always survives.
    pub fn insert(&self, key: VirtualOffset, node: Arc<Node>) {
        let size = node.memory_size();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.map.push(key, node) {
            // push returns the displaced entry: the old value under the
            // same key, or an unrelated LRU victim.
            inner.bytes -= old.1.memory_size();
        }
        inner.bytes += size;
        while inner.bytes > self.budget && inner.map.len() > 1 {
            let (_, evicted) = inner.map.pop_lru().expect("non-empty cache");
            inner.bytes -= evicted.memory_size();
        }
        crate::metrics::NODE_CACHE_BYTES.set(inner.bytes as i64);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::nibbles::Nibbles;

    fn node_with_value(len: usize) -> Arc<Node> {
        Arc::new(Node::new(
            0,
            Nibbles::new(),
            Some(vec![0xee; len].into_boxed_slice()),
            Vec::new(),
            1,
        ))
    }

    fn key(chunk: u32, generation: u8) -> VirtualOffset {
        VirtualOffset::new(FileOffset::new(chunk, 4096, 1), generation)
    }

    #[test]
    fn lru_eviction_respects_byte_budget() {
        let probe = node_with_value(64);
        let unit = probe.memory_size();
        let cache = NodeCache::new(3 * unit);

        cache.insert(key(1, 0), node_with_value(64));
        cache.insert(key(2, 0), node_with_value(64));
        cache.insert(key(3, 0), node_with_value(64));
        assert_eq!(cache.len(), 3);

        // Touch 1 so 2 becomes the LRU victim.
        assert!(cache.get(&key(1, 0)).is_some());
        cache.insert(key(4, 0), node_with_value(64));
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&key(2, 0)).is_none());
        assert!(cache.get(&key(1, 0)).is_some());
        assert!(cache.get(&key(4, 0)).is_some());
    }

    #[test]
    fn oversized_entry_evicts_everything_else_but_survives() {
        let probe = node_with_value(64);
        let unit = probe.memory_size();
        let cache = NodeCache::new(3 * unit);
        cache.insert(key(1, 0), node_with_value(64));
        cache.insert(key(2, 0), node_with_value(64));
        cache.insert(key(3, 0), node_with_value(64));
        cache.insert(key(6, 0), node_with_value(64 * 8));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(6, 0)).is_some());
    }

    #[test]
    fn replacing_same_key_keeps_accounting_straight() {
        let cache = NodeCache::new(1 << 20);
        cache.insert(key(1, 0), node_with_value(100));
        let first = cache.bytes();
        cache.insert(key(1, 0), node_with_value(100));
        assert_eq!(cache.bytes(), first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn generation_discriminates_reused_chunks() {
        let cache = NodeCache::new(1 << 20);
        cache.insert(key(1, 0), node_with_value(8));
        cache.insert(key(1, 1), node_with_value(16));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(1, 0)).is_some());
        assert!(cache.get(&key(1, 1)).is_some());
    }

    #[test]
    fn held_accessor_survives_eviction() {
        let probe = node_with_value(64);
        let unit = probe.memory_size();
        let cache = NodeCache::new(unit);
        cache.insert(key(1, 0), node_with_value(64));
        let held = cache.get(&key(1, 0)).unwrap();
        cache.insert(key(2, 0), node_with_value(64));
        assert!(cache.get(&key(1, 0)).is_none());
        // The Arc we hold is unaffected by eviction.
        assert_eq!(held.value().unwrap().len(), 64);
    }
}
