//! Read path: point lookups and in-order traversal.

use crate::pool::FileOffset;
use crate::trie::nibbles::{concat, concat3, NibbleSlice, Nibbles};
use crate::trie::node::Node;
use crate::trie::{TrieCtx, TrieError};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Walks from the root at `root` consuming `key` nibble by nibble.
///
/// Returns the value stored exactly at `key`, or `None` on a path
/// mismatch, a missing branch, or a key that ends inside a node's path
/// fragment.  Re-entrant; concurrent finds share the node cache and the
/// per-child loaded handles.
pub(crate) async fn find(
    ctx: &TrieCtx,
    root: FileOffset,
    key: NibbleSlice<'_>,
) -> Result<Option<Vec<u8>>, TrieError> {
    if root.is_none() {
        return Ok(None);
    }
    let mut node: Arc<Node> = ctx.read_node(root, 0).await?;
    let mut consumed = 0usize;
    loop {
        let path = node.path();
        if !key.mid(consumed).starts_with(&path) {
            return Ok(None);
        }
        consumed += path.len();
        if consumed == key.len() {
            return Ok(node.value().map(|v| v.to_vec()));
        }
        let branch = key.at(consumed);
        consumed += 1;
        let (offset, loaded) = match node.child_at(branch) {
            Some(child) => (child.offset, child.loaded()),
            None => return Ok(None),
        };
        let next = match loaded {
            Some(next) => next,
            None => {
                let next = ctx.read_node(offset, consumed).await?;
                node.set_loaded_child(branch, &next);
                next
            }
        };
        node = next;
    }
}

/// Depth-first, key-ordered walk of the subtree at `offset`, delivering
/// every `(key, value)` pair to `visitor`.
pub(crate) fn traverse<'a>(
    ctx: &'a TrieCtx,
    offset: FileOffset,
    prefix: Nibbles,
    visitor: &'a mut dyn FnMut(&Nibbles, &[u8]),
    depth: usize,
) -> LocalBoxFuture<'a, Result<(), TrieError>> {
    async move {
        if offset.is_none() {
            return Ok(());
        }
        let node = ctx.read_node(offset, depth).await?;
        let full = concat(prefix.as_slice(), node.path());
        if let Some(value) = node.value() {
            visitor(&full, value);
        }
        let child_depth = depth + node.path().len() + 1;
        for (branch, child) in node.branches() {
            let child_prefix = concat3(full.as_slice(), branch, Nibbles::new().as_slice());
            traverse(ctx, child.offset, child_prefix, &mut *visitor, child_depth).await?;
        }
        Ok(())
    }
    .boxed_local()
}
