//! The update engine: applies an ordered batch of upserts and deletes to a
//! versioned trie, materializing a new root.
//!
//! A commit runs in two phases.  The build phase traverses the old trie
//! together with the update list, reading missing children in parallel,
//! and produces an in-memory tree of new nodes; children that no update
//! touches are carried by reference and never rewritten.  Degeneracy
//! collapse happens here, on unwritten nodes.  The write phase then
//! streams the built tree post-order through the fast writer, assigning
//! file offsets and computing Merkle references bottom-up.

use crate::pool::{FileOffset, PoolError, StoragePool};
use crate::trie::cache::{NodeCache, VirtualOffset};
use crate::trie::encoding::NodeRef;
use crate::trie::nibbles::{concat3, NibbleSlice, Nibbles};
use crate::trie::node::{Child, Node};
use crate::trie::writer::NodeWriter;
use crate::trie::{TrieCtx, TrieError, TriePolicy};
use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use std::sync::Arc;

/// One record of an update batch.
///
/// `value: None` deletes the key (a no-op when absent).  `incarnation`
/// drops any existing subtree under the key before the rest of the record
/// applies.  `next` nests a whole update list under the key's node (the
/// account-to-storage shape) with keys relative to that subtree.
pub struct Update {
    pub key: Nibbles,
    pub value: Option<Vec<u8>>,
    pub incarnation: bool,
    pub next: UpdateList,
    /// Must equal the commit version of the batch.
    pub version: u64,
}

impl Update {
    /// Plain upsert.
    pub fn put(key: Nibbles, value: Vec<u8>, version: u64) -> Self {
        Self { key, value: Some(value), incarnation: false, next: Vec::new(), version }
    }

    /// Plain delete.
    pub fn delete(key: Nibbles, version: u64) -> Self {
        Self { key, value: None, incarnation: false, next: Vec::new(), version }
    }
}

pub type UpdateList = Vec<Update>;

/// A subtree produced by the build phase.
pub(crate) enum ChildSlot {
    /// Untouched old subtree, carried by reference.
    Kept { reference: NodeRef, path_len: u8, offset: FileOffset },
    /// New node awaiting the write phase; its own children may be kept.
    New(Built),
}

pub(crate) struct Built {
    path: Nibbles,
    value: Option<Box<[u8]>>,
    /// `(branch, slot)`, sorted by branch.
    children: Vec<(u8, ChildSlot)>,
}

/// Reference to the old subtree at a position, as the parent knows it.
pub(crate) struct OldChild {
    /// `None` at the root, where no parent recorded a reference; computed
    /// from the loaded node if an unchanged root must be reported.
    pub reference: Option<NodeRef>,
    pub path_len: u8,
    pub offset: FileOffset,
    pub node: Option<Arc<Node>>,
}

pub(crate) struct Entry {
    key: Nibbles,
    /// Nibbles of `key` already consumed by the traversal.
    from: usize,
    value: Option<Vec<u8>>,
    incarnation: bool,
    next: UpdateList,
}

impl Entry {
    fn from_update(update: Update) -> Self {
        Self {
            key: update.key,
            from: 0,
            value: update.value,
            incarnation: update.incarnation,
            next: update.next,
        }
    }

    fn rel(&self) -> NibbleSlice<'_> {
        self.key.as_slice().mid(self.from)
    }
}

pub(crate) fn entries_from_updates(updates: UpdateList) -> Vec<Entry> {
    updates.into_iter().map(Entry::from_update).collect()
}

/// Applies `entries` to the subtree rooted at `old`, returning the new
/// subtree (`None` when everything below this position was deleted).
pub(crate) fn apply<'a>(
    ctx: &'a TrieCtx,
    old: Option<OldChild>,
    entries: Vec<Entry>,
    depth: usize,
    version: u64,
) -> LocalBoxFuture<'a, Result<Option<ChildSlot>, TrieError>> {
    async move {
        match old {
            None => apply_resolved(ctx, None, entries, depth, version).await,
            Some(old) => {
                let node = match old.node {
                    Some(node) => node,
                    None => ctx.read_node(old.offset, depth).await?,
                };
                let resolved = ResolvedOld {
                    node,
                    path_override: None,
                    kept: Some((old.reference, old.path_len, old.offset)),
                };
                apply_resolved(ctx, Some(resolved), entries, depth, version).await
            }
        }
    }
    .boxed_local()
}

struct ResolvedOld {
    node: Arc<Node>,
    /// Replaces the node's stored path fragment after a split; forces a
    /// rewrite.
    path_override: Option<Nibbles>,
    /// `(reference, path_len, offset)` when the node sits on disk in this
    /// exact shape, so an untouched subtree can be kept.
    kept: Option<(Option<NodeRef>, u8, FileOffset)>,
}

fn apply_resolved<'a>(
    ctx: &'a TrieCtx,
    old: Option<ResolvedOld>,
    entries: Vec<Entry>,
    depth: usize,
    version: u64,
) -> LocalBoxFuture<'a, Result<Option<ChildSlot>, TrieError>> {
    async move {
        let node_path: Nibbles = match &old {
            Some(o) => o.path_override.clone().unwrap_or_else(|| o.node.path().to_owned()),
            None => Nibbles::new(),
        };

        if entries.is_empty() {
            // Nothing to do below this position.
            return Ok(match old {
                None => None,
                Some(o) => Some(keep_or_rewrite(o, node_path)),
            });
        }

        let cp = match &old {
            Some(_) => entries
                .iter()
                .map(|e| e.rel().common_prefix_len(&node_path.as_slice()))
                .min()
                .unwrap(),
            None => {
                let first = entries.first().unwrap().rel();
                let last = entries.last().unwrap().rel();
                first.common_prefix_len(&last)
            }
        };

        match old {
            Some(o) if cp < node_path.len() => {
                split_node(ctx, o, node_path, cp, entries, depth, version).await
            }
            old => descend(ctx, old, node_path, cp, entries, depth, version).await,
        }
    }
    .boxed_local()
}

/// An untouched subtree: kept by reference when it is on disk in this
/// shape, rewritten (children still kept) when a split changed its path.
fn keep_or_rewrite(old: ResolvedOld, node_path: Nibbles) -> ChildSlot {
    match old.kept {
        Some((reference, path_len, offset)) => {
            let reference =
                reference.unwrap_or_else(|| NodeRef::from_rlp(&old.node.rlp()));
            ChildSlot::Kept { reference, path_len, offset }
        }
        None => ChildSlot::New(rewrite_with_path(&old.node, node_path)),
    }
}

/// The old node re-expressed with a different path fragment; every child
/// is carried by reference.
fn rewrite_with_path(node: &Node, path: Nibbles) -> Built {
    Built {
        path,
        value: node.value().map(|v| v.to_vec().into_boxed_slice()),
        children: node
            .branches()
            .map(|(branch, child)| {
                (
                    branch,
                    ChildSlot::Kept {
                        reference: child.reference.clone(),
                        path_len: child.path_len,
                        offset: child.offset,
                    },
                )
            })
            .collect(),
    }
}

/// Partitions `entries` at relative position `cp`: the update terminating
/// exactly there (last one wins) and 16 buckets by next nibble.  The
/// terminal's nested list is folded into the buckets, keyed from the
/// branch point.
fn partition(entries: Vec<Entry>, cp: usize) -> (Option<Entry>, Vec<Vec<Entry>>) {
    let mut terminal: Option<Entry> = None;
    let mut buckets: Vec<Vec<Entry>> = (0..16).map(|_| Vec::new()).collect();
    for mut entry in entries {
        debug_assert!(entry.rel().len() >= cp);
        if entry.rel().len() == cp {
            terminal = Some(entry);
        } else {
            let branch = entry.rel().at(cp);
            entry.from += cp + 1;
            buckets[branch as usize].push(entry);
        }
    }
    if let Some(terminal) = &mut terminal {
        for nested in std::mem::take(&mut terminal.next) {
            if nested.key.is_empty() {
                // A nested value at the node itself is the terminal's own
                // value slot; ignore the degenerate record.
                continue;
            }
            let branch = nested.key.at(0);
            let mut entry = Entry::from_update(nested);
            entry.from = 1;
            let bucket = &mut buckets[branch as usize];
            let at = bucket
                .partition_point(|e| e.rel().cmp_with(&entry.rel()) != std::cmp::Ordering::Greater);
            bucket.insert(at, entry);
        }
    }
    (terminal, buckets)
}

/// Split: the updates diverge from the old node's path fragment at `cp`.
/// A new branch node takes the shared prefix; the old node continues
/// under its divergence nibble with a truncated path.
async fn split_node(
    ctx: &TrieCtx,
    old: ResolvedOld,
    node_path: Nibbles,
    cp: usize,
    entries: Vec<Entry>,
    depth: usize,
    version: u64,
) -> Result<Option<ChildSlot>, TrieError> {
    let tail_branch = node_path.at(cp);
    let (terminal, buckets) = partition(entries, cp);
    let drop_tail = terminal.as_ref().is_some_and(|t| t.incarnation);
    let value = terminal.and_then(|t| t.value).map(Vec::into_boxed_slice);

    let mut slots: Vec<(u8, ChildSlot)> = Vec::new();
    let mut pending: Vec<(u8, LocalBoxFuture<'_, Result<Option<ChildSlot>, TrieError>>)> =
        Vec::new();
    for (branch, bucket) in buckets.into_iter().enumerate() {
        let branch = branch as u8;
        let child_depth = depth + cp + 1;
        if branch == tail_branch && !drop_tail {
            let tail_path = node_path.as_slice().mid(cp + 1).to_owned();
            if bucket.is_empty() {
                slots.push((branch, ChildSlot::New(rewrite_with_path(&old.node, tail_path))));
            } else {
                let resolved = ResolvedOld {
                    node: Arc::clone(&old.node),
                    path_override: Some(tail_path),
                    kept: None,
                };
                pending.push((
                    branch,
                    apply_resolved(ctx, Some(resolved), bucket, child_depth, version),
                ));
            }
        } else if !bucket.is_empty() {
            pending.push((branch, apply_resolved(ctx, None, bucket, child_depth, version)));
        }
    }
    let (branches, futures): (Vec<u8>, Vec<_>) = pending.into_iter().unzip();
    for (branch, result) in branches.into_iter().zip(join_all(futures).await) {
        if let Some(slot) = result? {
            slots.push((branch, slot));
        }
    }
    finalize(ctx, node_path.as_slice().prefix(cp).to_owned(), value, slots, depth).await
}

/// The updates all pass through (or terminate at) the old node's branch
/// point; recurse into the touched branches in parallel and keep the rest.
async fn descend(
    ctx: &TrieCtx,
    old: Option<ResolvedOld>,
    node_path: Nibbles,
    cp: usize,
    entries: Vec<Entry>,
    depth: usize,
    version: u64,
) -> Result<Option<ChildSlot>, TrieError> {
    let (node, forced_rewrite, kept) = match old {
        Some(o) => (Some(o.node), o.path_override.is_some(), o.kept),
        None => (None, false, None),
    };
    let new_path = match &node {
        Some(_) => node_path,
        // Fresh subtree: the new node absorbs the whole shared prefix.
        None => entries.first().unwrap().rel().prefix(cp).to_owned(),
    };

    let (terminal, buckets) = partition(entries, cp);
    let incarnation = terminal.as_ref().is_some_and(|t| t.incarnation);
    let mut changed = forced_rewrite || (incarnation && node.as_ref().is_some_and(|n| n.child_count() > 0));

    let old_value = node.as_ref().and_then(|n| n.value().map(|v| v.to_vec().into_boxed_slice()));
    let value = match terminal {
        Some(terminal) => {
            let new_value = terminal.value.map(Vec::into_boxed_slice);
            changed |= new_value.as_deref() != old_value.as_deref();
            new_value
        }
        None => old_value,
    };

    let mut slots: Vec<(u8, ChildSlot)> = Vec::new();
    let mut pending: Vec<(u8, LocalBoxFuture<'_, Result<Option<ChildSlot>, TrieError>>)> =
        Vec::new();
    for (branch, bucket) in buckets.into_iter().enumerate() {
        let branch = branch as u8;
        let old_child = if incarnation {
            None
        } else {
            node.as_ref().and_then(|n| n.child_at(branch))
        };
        if bucket.is_empty() {
            if let Some(child) = old_child {
                slots.push((
                    branch,
                    ChildSlot::Kept {
                        reference: child.reference.clone(),
                        path_len: child.path_len,
                        offset: child.offset,
                    },
                ));
            }
            continue;
        }
        let old_child = old_child.map(|child| OldChild {
            reference: Some(child.reference.clone()),
            path_len: child.path_len,
            offset: child.offset,
            node: child.loaded(),
        });
        pending.push((branch, apply(ctx, old_child, bucket, depth + cp + 1, version)));
    }
    let (branches, futures): (Vec<u8>, Vec<_>) = pending.into_iter().unzip();
    for (branch, result) in branches.into_iter().zip(join_all(futures).await) {
        let had_old = !incarnation
            && node.as_ref().is_some_and(|n| n.has_branch(branch));
        match result? {
            Some(slot) => {
                // A kept slot comes back only when the subtree is
                // untouched, so anything new marks a change.
                changed |= matches!(slot, ChildSlot::New(_)) || !had_old;
                slots.push((branch, slot));
            }
            None => changed |= had_old,
        }
    }

    if !changed {
        if let Some((reference, path_len, offset)) = kept {
            let node = node.expect("kept info implies a resolved node");
            let reference = reference.unwrap_or_else(|| NodeRef::from_rlp(&node.rlp()));
            return Ok(Some(ChildSlot::Kept { reference, path_len, offset }));
        }
    }
    finalize(ctx, new_path, value, slots, depth).await
}

/// Assembles the new node, applying degeneracy collapse: a node with no
/// value and exactly one child merges into that child, concatenating
/// `path ‖ branch ‖ child path`; a node with nothing left vanishes.
async fn finalize(
    ctx: &TrieCtx,
    path: Nibbles,
    value: Option<Box<[u8]>>,
    mut slots: Vec<(u8, ChildSlot)>,
    depth: usize,
) -> Result<Option<ChildSlot>, TrieError> {
    slots.sort_by_key(|(branch, _)| *branch);
    if value.is_none() {
        match slots.len() {
            0 => return Ok(None),
            1 => {
                let (branch, slot) = slots.pop().unwrap();
                let merged = match slot {
                    ChildSlot::New(built) => Built {
                        path: concat3(path.as_slice(), branch, built.path.as_slice()),
                        value: built.value,
                        children: built.children,
                    },
                    ChildSlot::Kept { offset, .. } => {
                        let child = ctx.read_node(offset, depth + path.len() + 1).await?;
                        let mut rewritten =
                            rewrite_with_path(&child, child.path().to_owned());
                        rewritten.path = concat3(path.as_slice(), branch, child.path());
                        rewritten
                    }
                };
                return Ok(Some(ChildSlot::New(merged)));
            }
            _ => {}
        }
    }
    Ok(Some(ChildSlot::New(Built { path, value, children: slots })))
}

pub(crate) struct WrittenChild {
    pub reference: NodeRef,
    pub path_len: u8,
    pub offset: FileOffset,
}

/// Write phase: streams `built` post-order through `writer`, assigning
/// offsets and computing Merkle references bottom-up.  Children written
/// before parents, so a parent's serialized form always points at durable
/// (or in-flight) bytes with version ≤ its own.
pub(crate) fn write_subtree(
    built: Built,
    pool: &mut StoragePool,
    writer: &mut NodeWriter,
    cache: &NodeCache,
    policy: &TriePolicy,
    depth: usize,
    version: u64,
) -> Result<(WrittenChild, Arc<Node>), PoolError> {
    let child_depth = depth + built.path.len() + 1;
    let mut mask = 0u16;
    let mut children = Vec::with_capacity(built.children.len());
    for (branch, slot) in built.children {
        debug_assert_eq!(mask >> branch, 0, "children out of branch order");
        mask |= 1 << branch;
        match slot {
            ChildSlot::Kept { reference, path_len, offset } => {
                children.push(Child::new(reference, path_len, offset));
            }
            ChildSlot::New(sub) => {
                let (written, _) =
                    write_subtree(sub, pool, writer, cache, policy, child_depth, version)?;
                children.push(Child::new(written.reference, written.path_len, written.offset));
            }
        }
    }
    let node = Node::new(mask, built.path, built.value, children, version);
    let reference = NodeRef::from_rlp(&node.rlp());
    let offset = writer.write_node(pool, &node)?;
    let path_len = node.path().len() as u8;
    let node = Arc::new(node);
    if (policy.cache_at_depth)(depth) && !(policy.auto_expire_at_depth)(depth) {
        let key = VirtualOffset::new(offset, pool.generation_of(offset.chunk()));
        cache.insert(key, Arc::clone(&node));
    }
    Ok((WrittenChild { reference, path_len, offset }, node))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8], value: Option<&[u8]>) -> Entry {
        Entry {
            key: Nibbles::from_nibbles(key),
            from: 0,
            value: value.map(|v| v.to_vec()),
            incarnation: false,
            next: Vec::new(),
        }
    }

    #[test]
    fn partition_buckets_by_next_nibble() {
        let entries = vec![
            entry(&[1, 2], Some(b"t")),
            entry(&[1, 2, 3, 4], Some(b"a")),
            entry(&[1, 2, 3, 9], Some(b"b")),
            entry(&[1, 2, 7], Some(b"c")),
        ];
        let (terminal, buckets) = partition(entries, 2);
        assert_eq!(terminal.as_ref().unwrap().value.as_deref(), Some(&b"t"[..]));
        assert_eq!(buckets[3].len(), 2);
        assert_eq!(buckets[7].len(), 1);
        assert!(buckets[0].is_empty());
        // Consumed positions advance past the branch nibble.
        assert_eq!(buckets[3][0].rel().len(), 1);
        assert_eq!(buckets[3][0].rel().at(0), 4);
    }

    #[test]
    fn partition_folds_nested_updates_into_buckets() {
        let mut terminal = entry(&[5, 5], Some(b"account"));
        terminal.next = vec![
            Update::put(Nibbles::from_nibbles(&[3, 1]), b"s1".to_vec(), 1),
            Update::put(Nibbles::from_nibbles(&[3, 8]), b"s2".to_vec(), 1),
        ];
        let entries = vec![entry(&[5, 5, 3, 0], Some(b"outer")), terminal];
        let (term, buckets) = partition(entries, 2);
        assert!(term.is_some());
        // Outer [3,0] plus the two nested keys, merged in sorted order.
        let bucket = &buckets[3];
        assert_eq!(bucket.len(), 3);
        let rels: Vec<Vec<u8>> = bucket.iter().map(|e| e.rel().iter().collect()).collect();
        assert_eq!(rels, vec![vec![0], vec![1], vec![8]]);
    }

    #[test]
    fn later_duplicate_terminal_wins() {
        let entries = vec![entry(&[4], Some(b"old")), entry(&[4], Some(b"new"))];
        let (terminal, _) = partition(entries, 1);
        assert_eq!(terminal.unwrap().value.as_deref(), Some(&b"new"[..]));
    }
}
