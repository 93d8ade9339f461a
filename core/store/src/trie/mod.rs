//! The versioned Merkle Patricia Trie engine.

pub mod cache;
pub mod encoding;
pub mod find;
pub mod nibbles;
pub mod node;
pub mod update;
pub mod writer;

use crate::io::AsyncIO;
use crate::mem::DISK_PAGE_SIZE;
use crate::pool::{FileOffset, PoolError, StoragePool};
use cache::{NodeCache, VirtualOffset};
use node::{InvalidNodeBytes, Node};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TrieError {
    /// I/O failure on the backing pool.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Bytes at a node offset failed to deserialize; an integrity failure
    /// that aborts the surrounding operation.
    #[error("{0}")]
    Corrupt(#[from] InvalidNodeBytes),

    /// The free list ran dry while appending.
    #[error("out of chunks")]
    OutOfChunks,
}

impl From<PoolError> for TrieError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfChunks => Self::OutOfChunks,
            PoolError::Io(err) => Self::Io(err),
            other => Self::Io(std::io::Error::other(other)),
        }
    }
}

/// Per-subtree policy predicates threaded through traversal, keyed by
/// nibble depth.  Callers tune these per workload (e.g. cache account
/// levels but not storage leaves).
#[derive(Clone, Copy)]
pub struct TriePolicy {
    /// Whether nodes at this depth enter the node cache.
    pub cache_at_depth: fn(usize) -> bool,
    /// Whether the compactor caches nodes it relocates at this depth.
    pub compact_at_depth: fn(usize) -> bool,
    /// Whether subtrees at this depth are expected to expire with history
    /// and should stay out of the cache on the write path.
    pub auto_expire_at_depth: fn(usize) -> bool,
}

fn default_cache_at_depth(depth: usize) -> bool {
    depth <= 10
}

fn always(_depth: usize) -> bool {
    true
}

fn never(_depth: usize) -> bool {
    false
}

impl Default for TriePolicy {
    fn default() -> Self {
        Self {
            cache_at_depth: default_cache_at_depth,
            compact_at_depth: always,
            auto_expire_at_depth: never,
        }
    }
}

/// Shared state threaded through trie traversals on one reactor thread.
pub(crate) struct TrieCtx {
    pub io: AsyncIO,
    pub pool: Rc<RefCell<StoragePool>>,
    pub cache: Arc<NodeCache>,
    pub policy: TriePolicy,
}

impl TrieCtx {
    /// Loads the node at `offset`, via the cache when possible.  The read
    /// covers the 1..=3 pages recorded in the offset's top bits, so the
    /// node is always fully resident in one buffer.
    pub async fn read_node(&self, offset: FileOffset, depth: usize) -> Result<Arc<Node>, TrieError> {
        debug_assert!(!offset.is_none());
        let (key, device, device_offset, read_len, skip) = {
            let pool = self.pool.borrow();
            let key = VirtualOffset::new(offset, pool.generation_of(offset.chunk()));
            if let Some(node) = self.cache.get(&key) {
                return Ok(node);
            }
            let aligned = offset.offset() / DISK_PAGE_SIZE as u64 * DISK_PAGE_SIZE as u64;
            let (device, device_offset) = pool.locate(offset.chunk(), aligned);
            let skip = (offset.offset() - aligned) as usize;
            (key, device as u32, device_offset, offset.pages() * DISK_PAGE_SIZE, skip)
        };
        let buf = self.io.read(device, device_offset, read_len).await?;
        let (node, _) = Node::decode(&buf[skip..])?;
        drop(buf);
        let node = Arc::new(node);
        if (self.policy.cache_at_depth)(depth) {
            self.cache.insert(key, Arc::clone(&node));
        }
        Ok(node)
    }
}
