//! In-memory trie node and its packed on-disk form.
//!
//! A node is one shape, `(path, mask, children, value)`, projected into
//! leaf/extension/branch behavior by predicates rather than a class
//! hierarchy.
//! Nodes are immutable after construction except for the weak loaded-child
//! back-references managed by the cache.  A node's on-disk bytes are fully
//! self-contained: deserializing needs nothing but the bytes at its file
//! offset.

use crate::mem::DISK_PAGE_SIZE;
use crate::pool::FileOffset;
use crate::trie::encoding::{self, NodeRef, HASH_LENGTH};
use crate::trie::nibbles::{NibbleSlice, Nibbles, MAX_NIBBLES};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Fixed header: mask, flags, path length, version.
const NODE_HEADER_BYTES: usize = 2 + 1 + 1 + 8;
const FLAG_HAS_VALUE: u8 = 1;
const REF_LEN_HASH_BIT: u8 = 0x80;

/// No node ever spans more than 3 disk pages; with page-boundary padding
/// in the writers this caps the serialized size at two pages.
pub const MAX_DISK_NODE_SIZE: usize = 2 * DISK_PAGE_SIZE;

/// Largest value an update may carry, leaving room for a worst-case node
/// around it (16 children, maximal paths).
pub const MAX_VALUE_SIZE: usize = MAX_DISK_NODE_SIZE - 768;

#[derive(Debug, thiserror::Error)]
#[error("invalid node bytes: {0}")]
pub struct InvalidNodeBytes(pub &'static str);

/// Per-branch child record.
#[derive(Debug)]
pub struct Child {
    /// Inline RLP (< 32 bytes) or Keccak-256 of the child's encoding.
    pub reference: NodeRef,
    /// Length of the child's own path fragment, in nibbles.
    pub path_len: u8,
    /// Authoritative on-disk location of the child.
    pub offset: FileOffset,
    /// Weak back-reference to the loaded child; dropped on cache eviction.
    loaded: Mutex<Weak<Node>>,
}

impl Child {
    pub fn new(reference: NodeRef, path_len: u8, offset: FileOffset) -> Self {
        Self { reference, path_len, offset, loaded: Mutex::new(Weak::new()) }
    }

    pub fn loaded(&self) -> Option<Arc<Node>> {
        self.loaded.lock().upgrade()
    }

    pub fn set_loaded(&self, node: &Arc<Node>) {
        *self.loaded.lock() = Arc::downgrade(node);
    }
}

impl Clone for Child {
    fn clone(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            path_len: self.path_len,
            offset: self.offset,
            loaded: Mutex::new(self.loaded.lock().clone()),
        }
    }
}

#[derive(Debug)]
pub struct Node {
    mask: u16,
    version: u64,
    path: Nibbles,
    value: Option<Box<[u8]>>,
    /// One entry per set mask bit, in branch order.
    children: Box<[Child]>,
}

impl Node {
    pub fn new(
        mask: u16,
        path: Nibbles,
        value: Option<Box<[u8]>>,
        children: Vec<Child>,
        version: u64,
    ) -> Self {
        assert_eq!(mask.count_ones() as usize, children.len());
        Self { mask, version, path, value, children: children.into_boxed_slice() }
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn path(&self) -> NibbleSlice<'_> {
        self.path.as_slice()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_extension(&self) -> bool {
        !self.path.is_empty() && !self.children.is_empty()
    }

    pub fn has_branch(&self, branch: u8) -> bool {
        self.mask & (1 << branch) != 0
    }

    /// Index into `children` of `branch`, which must be present.
    pub fn child_index(&self, branch: u8) -> usize {
        debug_assert!(self.has_branch(branch));
        (self.mask & ((1u16 << branch) - 1)).count_ones() as usize
    }

    pub fn child_at(&self, branch: u8) -> Option<&Child> {
        self.has_branch(branch).then(|| &self.children[self.child_index(branch)])
    }

    pub fn set_loaded_child(&self, branch: u8, node: &Arc<Node>) {
        if let Some(child) = self.child_at(branch) {
            child.set_loaded(node);
        }
    }

    /// `(branch, child)` pairs in branch order.
    pub fn branches(&self) -> impl Iterator<Item = (u8, &Child)> {
        (0u8..16).filter(|b| self.has_branch(*b)).zip(self.children.iter())
    }

    /// Child references laid out per branch, the shape the RLP encoders
    /// take.
    pub fn child_refs(&self) -> [Option<&NodeRef>; 16] {
        let mut refs: [Option<&NodeRef>; 16] = [None; 16];
        for (branch, child) in self.branches() {
            refs[branch as usize] = Some(&child.reference);
        }
        refs
    }

    /// Canonical RLP of this node.
    pub fn rlp(&self) -> Vec<u8> {
        encoding::encode_node_rlp(self.path(), self.value(), &self.child_refs())
    }

    /// Heap bytes held by this node.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Node>()
            + self.path.memory_size()
            + self.value.as_ref().map_or(0, |v| v.len())
            + self.children.len() * std::mem::size_of::<Child>()
    }

    /// Bytes this node occupies on disk, fixed header included.
    pub fn disk_size(&self) -> usize {
        NODE_HEADER_BYTES
            + if self.value.is_some() { 2 } else { 0 }
            + self.path.len().div_ceil(2)
            + self.value.as_ref().map_or(0, |v| v.len())
            + self
                .children
                .iter()
                .map(|c| 1 + 1 + c.reference.len() + 8)
                .sum::<usize>()
    }

    /// Serializes into `out`, which must be exactly `disk_size` bytes.
    pub fn encode_into(&self, out: &mut [u8]) {
        assert_eq!(out.len(), self.disk_size());
        let mut at = 0;
        let mut put = |bytes: &[u8], at: &mut usize| {
            out[*at..*at + bytes.len()].copy_from_slice(bytes);
            *at += bytes.len();
        };
        put(&self.mask.to_le_bytes(), &mut at);
        let flags = if self.value.is_some() { FLAG_HAS_VALUE } else { 0 };
        put(&[flags, self.path.len() as u8], &mut at);
        put(&self.version.to_le_bytes(), &mut at);
        if let Some(value) = &self.value {
            put(&(value.len() as u16).to_le_bytes(), &mut at);
        }
        put(self.path.packed(), &mut at);
        if let Some(value) = &self.value {
            put(value, &mut at);
        }
        for child in self.children.iter() {
            let hash_bit = if child.reference.is_hash() { REF_LEN_HASH_BIT } else { 0 };
            put(&[child.reference.len() as u8 | hash_bit, child.path_len], &mut at);
            put(child.reference.as_bytes(), &mut at);
            put(&child.offset.raw().to_le_bytes(), &mut at);
        }
        debug_assert_eq!(at, out.len());
    }

    /// Parses a node from the front of `bytes`, returning it together with
    /// the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Node, usize), InvalidNodeBytes> {
        fn take<'a>(
            bytes: &'a [u8],
            at: &mut usize,
            count: usize,
        ) -> Result<&'a [u8], InvalidNodeBytes> {
            let slice = bytes
                .get(*at..*at + count)
                .ok_or(InvalidNodeBytes("truncated node"))?;
            *at += count;
            Ok(slice)
        }
        let mut at = 0;
        let mask = u16::from_le_bytes(take(bytes, &mut at, 2)?.try_into().unwrap());
        let header = take(bytes, &mut at, 2)?;
        let (flags, path_len) = (header[0], header[1] as usize);
        if flags & !FLAG_HAS_VALUE != 0 {
            return Err(InvalidNodeBytes("unknown flags"));
        }
        if path_len > MAX_NIBBLES {
            return Err(InvalidNodeBytes("path too long"));
        }
        let version = u64::from_le_bytes(take(bytes, &mut at, 8)?.try_into().unwrap());
        let has_value = flags & FLAG_HAS_VALUE != 0;
        let value_len = if has_value {
            u16::from_le_bytes(take(bytes, &mut at, 2)?.try_into().unwrap()) as usize
        } else {
            0
        };
        let path_bytes = take(bytes, &mut at, path_len.div_ceil(2))?;
        let path = NibbleSlice::new(path_bytes, 0, path_len).to_owned();
        let value = if has_value {
            Some(take(bytes, &mut at, value_len)?.to_vec().into_boxed_slice())
        } else {
            None
        };
        let child_count = mask.count_ones() as usize;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let header = take(bytes, &mut at, 2)?;
            let (ref_len_raw, child_path_len) = (header[0], header[1]);
            let is_hash = ref_len_raw & REF_LEN_HASH_BIT != 0;
            let ref_len = (ref_len_raw & !REF_LEN_HASH_BIT) as usize;
            if ref_len > HASH_LENGTH || (is_hash && ref_len != HASH_LENGTH) {
                return Err(InvalidNodeBytes("bad reference length"));
            }
            let reference = NodeRef::from_parts(take(bytes, &mut at, ref_len)?, is_hash);
            let offset = FileOffset::from_raw(u64::from_le_bytes(
                take(bytes, &mut at, 8)?.try_into().unwrap(),
            ));
            if offset.is_none() || offset.pages() == 0 {
                return Err(InvalidNodeBytes("bad child offset"));
            }
            children.push(Child::new(reference, child_path_len, offset));
        }
        if !has_value && child_count == 0 {
            return Err(InvalidNodeBytes("node with neither value nor children"));
        }
        Ok((Node::new(mask, path, value, children, version), at))
    }
}
