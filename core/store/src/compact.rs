//! Compactor: relocates live nodes out of an expiring chunk so the chunk
//! can return to the free list.
//!
//! A chunk is a candidate when the free list falls under the low
//! watermark, or when the oldest chunk of a list holds no node younger
//! than the history window.  Every live version's root is walked; chains
//! leading into the candidate are rewritten through the slow writer
//! (only child offsets move, Merkle references are unchanged), the ring
//! records are updated in place, and the chunk is freed with a bumped
//! generation.  Subtrees whose root version predates the candidate's
//! oldest node cannot reference into it (a child's version never exceeds
//! its parent's) and are pruned from the walk.

use crate::history::HistoryIndex;
use crate::pool::{ChunkList, FileOffset, StoragePool};
use crate::trie::node::{Child, Node};
use crate::trie::writer::NodeWriter;
use crate::trie::{TrieCtx, TrieError};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::cell::RefCell;
use std::collections::HashMap;

/// Free-list population that triggers compaction under space pressure.
pub(crate) const FREE_LOW_WATERMARK: usize = 4;

/// Picks the chunk to reclaim, oldest in-list first.  Chunks hosting a
/// writer frontier are never candidates, and the pinned-root chunk sits
/// outside both scanned lists entirely.
///
/// The expired-by-history trigger applies to fast chunks only: their
/// contents age out as commits supersede them, while slow chunks hold
/// relocated nodes whose recorded versions are old by construction, so
/// treating those as expired would relocate the same nodes forever.
/// Slow chunks are reclaimed under free-space pressure, where dead
/// relocated nodes make the copy shrink.
fn pick_candidate(pool: &StoragePool, exclude: &[Option<u32>]) -> Option<u32> {
    let min_valid = pool.min_valid_version();
    let mut oldest: Option<u32> = None;
    for list in [ChunkList::Fast, ChunkList::Slow] {
        let Some(chunk) = pool
            .chunks_in(list)
            .into_iter()
            .find(|c| !exclude.contains(&Some(*c)))
        else {
            continue;
        };
        if list == ChunkList::Fast && pool.chunk_state(chunk).max_version < min_valid {
            return Some(chunk);
        }
        let better = match oldest {
            Some(best) => pool.chunk_state(chunk).seq < pool.chunk_state(best).seq,
            None => true,
        };
        if better {
            oldest = Some(chunk);
        }
    }
    if pool.free_chunks() < FREE_LOW_WATERMARK {
        return oldest;
    }
    None
}

/// Rewrites the chain(s) leading from `offset` into `candidate`, copying
/// touched nodes through the slow writer.  Returns the node's relocated
/// offset, or `None` when nothing below it references the candidate.
fn rewrite<'a>(
    ctx: &'a TrieCtx,
    slow: &'a RefCell<NodeWriter>,
    memo: &'a RefCell<HashMap<u64, FileOffset>>,
    candidate: u32,
    candidate_min_version: u64,
    offset: FileOffset,
    depth: usize,
) -> LocalBoxFuture<'a, Result<Option<FileOffset>, TrieError>> {
    async move {
        if let Some(&moved) = memo.borrow().get(&offset.raw()) {
            return Ok(Some(moved));
        }
        let node = ctx.read_node(offset, depth).await?;
        if node.version() < candidate_min_version {
            return Ok(None);
        }
        let child_depth = depth + node.path().len() + 1;
        let mut moved_children: Vec<Option<FileOffset>> =
            Vec::with_capacity(node.child_count());
        for (_, child) in node.branches() {
            moved_children.push(
                rewrite(ctx, slow, memo, candidate, candidate_min_version, child.offset, child_depth)
                    .await?,
            );
        }
        if offset.chunk() != candidate && moved_children.iter().all(Option::is_none) {
            return Ok(None);
        }
        let children: Vec<Child> = node
            .branches()
            .zip(moved_children)
            .map(|((_, child), moved)| {
                Child::new(
                    child.reference.clone(),
                    child.path_len,
                    moved.unwrap_or(child.offset),
                )
            })
            .collect();
        let copy = Node::new(
            node.mask(),
            node.path().to_owned(),
            node.value().map(|v| v.to_vec().into_boxed_slice()),
            children,
            node.version(),
        );
        let new_offset = {
            let mut pool = ctx.pool.borrow_mut();
            let new_offset = slow.borrow_mut().write_node(&mut pool, &copy)?;
            if (ctx.policy.compact_at_depth)(depth) && (ctx.policy.cache_at_depth)(depth) {
                let generation = pool.generation_of(new_offset.chunk());
                ctx.cache.insert(
                    crate::trie::cache::VirtualOffset::new(new_offset, generation),
                    std::sync::Arc::new(copy),
                );
            }
            new_offset
        };
        memo.borrow_mut().insert(offset.raw(), new_offset);
        Ok(Some(new_offset))
    }
    .boxed_local()
}

/// Runs one compaction cycle if a candidate exists.  Returns the id of
/// the reclaimed chunk, if any.  Never blocks commits: it runs between
/// them on the writer thread and shares its reactor.
pub(crate) fn run_if_needed(
    ctx: &TrieCtx,
    history: &HistoryIndex,
    slow: &RefCell<NodeWriter>,
    fast_chunk: Option<u32>,
) -> Result<Option<u32>, TrieError> {
    let (candidate, candidate_min_version, min_valid, latest) = {
        let pool = ctx.pool.borrow();
        let exclude = [fast_chunk, slow.borrow().current_chunk()];
        let Some(candidate) = pick_candidate(&pool, &exclude) else {
            return Ok(None);
        };
        let state = pool.chunk_state(candidate);
        // An untouched chunk keeps min_version at u64::MAX, which prunes
        // every walk immediately; the unreadable-header fallback pins it
        // to 0, forcing full walks.
        (candidate, state.min_version, pool.min_valid_version(), pool.latest_version())
    };
    tracing::info!(
        target: "store::compact",
        chunk = candidate,
        min_valid,
        latest,
        "compacting chunk"
    );

    let memo = RefCell::new(HashMap::new());
    let mut moved_roots: Vec<(u64, FileOffset)> = Vec::new();
    for version in min_valid.max(1)..=latest {
        let Some(root) = history.lookup(version) else { continue };
        if root.is_none() {
            continue;
        }
        let moved = ctx.io.block_on(rewrite(
            ctx,
            slow,
            &memo,
            candidate,
            candidate_min_version,
            root,
            0,
        ))?;
        if let Some(new_root) = moved {
            moved_roots.push((version, new_root));
        }
    }

    // Barrier: every relocated node must be durable before any ring
    // record points at it.
    let slow_frontier = {
        let mut pool = ctx.pool.borrow_mut();
        slow.borrow_mut().flush(&mut pool)
    };
    ctx.io.wait_until_done();
    if let Some(err) = ctx.io.take_write_error() {
        return Err(err.into());
    }
    {
        let pool = ctx.pool.borrow();
        if slow_frontier.0 != u32::MAX {
            pool.write_chunk_header(slow_frontier.0)?;
        }
        pool.sync_data()?;
    }
    for (version, new_root) in &moved_roots {
        history.record(*version, *new_root);
    }
    {
        let mut pool = ctx.pool.borrow_mut();
        pool.release(candidate)?;
        // Relocation may have moved the oldest live root; keep the pinned
        // chunk in step with it.
        let pin_root = history.lookup(pool.min_valid_version());
        let exclude = [pool.fast_frontier().0, slow_frontier.0];
        pool.refresh_root_pin(pin_root, &exclude)?;
        let fast_frontier = pool.fast_frontier();
        let (latest, min_valid) = (pool.latest_version(), pool.min_valid_version());
        pool.advance_heads(fast_frontier, slow_frontier, latest, min_valid)?;
    }
    crate::metrics::COMPACTION_RUNS.inc();
    crate::metrics::CHUNKS_FREED.inc();
    tracing::info!(
        target: "store::compact",
        chunk = candidate,
        moved_roots = moved_roots.len(),
        "chunk reclaimed"
    );
    Ok(Some(candidate))
}
