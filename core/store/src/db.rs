//! Caller-facing handles: one writable [`Db`] per pool, any number of
//! [`ReadOnlyDb`]s tracking it through the durable metadata snapshot.

use crate::compact;
use crate::config::StoreConfig;
use crate::history::HistoryIndex;
use crate::io::AsyncIO;
use crate::pool::{ChunkList, FileOffset, PoolError, StoragePool};
use crate::trie::cache::NodeCache;
use crate::trie::find as trie_find;
use crate::trie::nibbles::{NibbleSlice, Nibbles};
use crate::trie::node::{InvalidNodeBytes, MAX_VALUE_SIZE};
use crate::trie::update::{self, ChildSlot, OldChild, UpdateList};
use crate::trie::writer::NodeWriter;
use crate::trie::{TrieCtx, TrieError, TriePolicy};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use triedb_primitives::{Hash256, EMPTY_TRIE_ROOT};

/// Hooks for events the engine publishes.  Set at open; the engine never
/// installs process-wide singletons.
pub trait EventSink {
    fn commit_published(&self, _version: u64, _root: FileOffset) {}
    fn chunk_compacted(&self, _chunk: u32) {}
    fn version_rewound(&self, _version: u64) {}
}

struct NoopEvents;

impl EventSink for NoopEvents {}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// I/O error while opening or validating the pool.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Pool-level failure (missing, corrupt, locked, misconfigured).
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Versions are dense: the first commit picks any version ≥ 1, after
    /// that each commit must use the successor of the latest version.
    #[error("commit version {got} is not valid after {latest}")]
    InvalidVersion { got: u64, latest: u64 },

    /// An update's own version field disagrees with the commit version.
    #[error("update version {0} does not match commit version {1}")]
    UpdateVersionMismatch(u64, u64),

    /// Updates must be sorted ascending by nibble path.
    #[error("updates are not sorted by key")]
    UnsortedUpdates,

    /// A value exceeds what fits a node within the 3-page read contract.
    #[error("value exceeds {MAX_VALUE_SIZE} bytes")]
    ValueTooLarge,

    /// Free list ran dry; the caller may run compaction and retry.
    #[error("out of chunks")]
    OutOfChunks,

    /// I/O failure; the commit is aborted and the version not published.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Stored node bytes failed validation mid-commit.
    #[error("{0}")]
    Corrupt(#[from] InvalidNodeBytes),
}

impl From<TrieError> for CommitError {
    fn from(err: TrieError) -> Self {
        match err {
            TrieError::Io(err) => Self::Io(err),
            TrieError::Corrupt(err) => Self::Corrupt(err),
            TrieError::OutOfChunks => Self::OutOfChunks,
        }
    }
}

impl From<PoolError> for CommitError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfChunks => Self::OutOfChunks,
            PoolError::Io(err) => Self::Io(err),
            other => Self::Io(io::Error::other(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FindError {
    /// The version is outside the retained `[min_valid, latest]` window.
    #[error("version pruned from history")]
    PrunedVersion,

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Corrupt(#[from] InvalidNodeBytes),
}

impl From<TrieError> for FindError {
    fn from(err: TrieError) -> Self {
        match err {
            TrieError::Io(err) => Self::Io(err),
            TrieError::Corrupt(err) => Self::Corrupt(err),
            TrieError::OutOfChunks => Self::Io(io::Error::other("out of chunks on read path")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RewindError {
    /// Target must satisfy `min_valid ≤ target ≤ latest`.
    #[error("rewind target {target} outside [{min_valid}, {latest}]")]
    InvalidVersion { target: u64, min_valid: u64, latest: u64 },

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// The writable handle.  Owns the reactor of its thread, the fast and
/// slow writers, and the node cache; deliberately `!Send`.
pub struct Db {
    config: StoreConfig,
    pool: Rc<RefCell<StoragePool>>,
    io: AsyncIO,
    history: HistoryIndex,
    cache: Arc<NodeCache>,
    fast: RefCell<NodeWriter>,
    slow: RefCell<NodeWriter>,
    policy: TriePolicy,
    events: Arc<dyn EventSink>,
}

/// Whether `root` lies in durably-written bytes.  Writes only ever happen
/// at the two frontier chunks, so any allocated chunk (fast, slow, or
/// pinned) is fully written except for the tail past a frontier.
fn root_is_durable(pool: &StoragePool, root: FileOffset) -> bool {
    if root.is_none() {
        return true;
    }
    if root.chunk() >= pool.chunk_count() {
        return false;
    }
    if pool.chunk_state(root.chunk()).list == ChunkList::Free {
        return false;
    }
    for frontier in [pool.fast_frontier(), pool.slow_frontier()] {
        if frontier.0 == root.chunk() && root.offset() >= frontier.1 as u64 {
            return false;
        }
    }
    true
}

fn validate_updates(updates: &UpdateList, version: u64) -> Result<(), CommitError> {
    for pair in updates.windows(2) {
        if pair[0].key.as_slice().cmp_with(&pair[1].key.as_slice())
            == std::cmp::Ordering::Greater
        {
            return Err(CommitError::UnsortedUpdates);
        }
    }
    for update in updates {
        if update.version != version {
            return Err(CommitError::UpdateVersionMismatch(update.version, version));
        }
        if update.value.as_ref().is_some_and(|v| v.len() > MAX_VALUE_SIZE) {
            return Err(CommitError::ValueTooLarge);
        }
        validate_updates(&update.next, version)?;
    }
    Ok(())
}

impl Db {
    /// Opens (or creates, per the config) the pool in read-write mode.
    pub fn open(config: StoreConfig) -> Result<Self, OpenError> {
        Self::open_with(config, TriePolicy::default(), Arc::new(NoopEvents))
    }

    /// Opens with a caller-supplied traversal policy and event hooks.
    pub fn open_with(
        config: StoreConfig,
        policy: TriePolicy,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, OpenError> {
        let mut pool = StoragePool::open(&config, true)?;
        let fds: Vec<i32> = pool.devices().iter().map(|d| d.data_fd()).collect();
        let io = AsyncIO::new(
            config.uring_entries,
            config.sq_thread_cpu,
            config.rd_buffers,
            config.wr_buffers,
            &fds,
        )?;
        let history = HistoryIndex::new(&pool, true)?;

        // Reconcile the ring with the durable write frontier: anything
        // recorded past it never became durable and is discarded.
        let latest = pool.latest_version();
        if latest > 0 {
            let reconciled = history.reconcile(latest, pool.min_valid_version(), |root| {
                root_is_durable(&pool, root)
            });
            if reconciled != latest {
                tracing::warn!(
                    target: "store::opener",
                    latest,
                    reconciled,
                    "dropping versions that were never made durable"
                );
                let min_valid = pool.min_valid_version().min(reconciled);
                pool.set_versions(reconciled, min_valid);
                pool.flush_meta()?;
            } else if config.rewind_to_latest_finalized {
                // Finality of anything newer is the caller's business;
                // the newest durable version is the newest one the engine
                // can vouch for, so republish the window at it.
                pool.flush_meta()?;
                tracing::info!(
                    target: "store::opener",
                    version = latest,
                    "pinned open at latest finalized version"
                );
            }
        }

        let fast = NodeWriter::new(ChunkList::Fast, io.clone(), pool.fast_frontier());
        let slow = NodeWriter::new(ChunkList::Slow, io.clone(), pool.slow_frontier());
        let cache = Arc::new(NodeCache::new(config.node_cache_size.as_u64() as usize));
        tracing::info!(
            target: "store::opener",
            latest_version = pool.latest_version(),
            min_valid_version = pool.min_valid_version(),
            "store open"
        );
        Ok(Self {
            pool: Rc::new(RefCell::new(pool)),
            io,
            history,
            cache,
            fast: RefCell::new(fast),
            slow: RefCell::new(slow),
            policy,
            events,
            config,
        })
    }

    fn ctx(&self) -> TrieCtx {
        TrieCtx {
            io: self.io.clone(),
            pool: Rc::clone(&self.pool),
            cache: Arc::clone(&self.cache),
            policy: self.policy,
        }
    }

    /// Applies a sorted batch of updates, producing the new version's
    /// root.  The commit is transactional at version granularity: either
    /// the version record becomes visible with all its nodes durable, or
    /// neither happens.
    pub fn commit(&mut self, updates: UpdateList, version: u64) -> Result<FileOffset, CommitError> {
        let latest = self.pool.borrow().latest_version();
        let valid = if latest == 0 { version >= 1 } else { version == latest + 1 };
        if !valid {
            return Err(CommitError::InvalidVersion { got: version, latest });
        }
        validate_updates(&updates, version)?;

        let old_root = if latest > 0 {
            let offset = self
                .history
                .lookup(latest)
                .ok_or_else(|| io::Error::other("missing record for latest version"))?;
            (!offset.is_none()).then_some(OldChild {
                reference: None,
                path_len: 0,
                offset,
                node: None,
            })
        } else {
            None
        };

        let ctx = self.ctx();
        let entries = update::entries_from_updates(updates);
        let built = self.io.block_on(update::apply(&ctx, old_root, entries, 0, version))?;
        let root_offset = match built {
            None => FileOffset::NONE,
            Some(ChildSlot::Kept { offset, .. }) => offset,
            Some(ChildSlot::New(built)) => {
                let mut pool = self.pool.borrow_mut();
                let mut fast = self.fast.borrow_mut();
                let (written, _) = update::write_subtree(
                    built,
                    &mut pool,
                    &mut fast,
                    &self.cache,
                    &self.policy,
                    0,
                    version,
                )?;
                written.offset
            }
        };

        // Flush both streams, then the barrier: all node writes complete
        // before the version record referencing them is written.
        let (fast_frontier, slow_frontier) = {
            let mut pool = self.pool.borrow_mut();
            let fast = self.fast.borrow_mut().flush(&mut pool);
            let slow = self.slow.borrow_mut().flush(&mut pool);
            (fast, slow)
        };
        self.io.wait_until_done();
        if let Some(err) = self.io.take_write_error() {
            return Err(err.into());
        }
        {
            let pool = self.pool.borrow();
            if fast_frontier.0 != u32::MAX {
                pool.write_chunk_header(fast_frontier.0)?;
            }
            if slow_frontier.0 != u32::MAX {
                pool.write_chunk_header(slow_frontier.0)?;
            }
            pool.sync_data()?;
        }
        self.history.record(version, root_offset);
        let min_valid = {
            let pool = self.pool.borrow();
            let by_history = version.saturating_sub(pool.history_length().saturating_sub(1));
            // The first commit anchors the readable window: versions below
            // it never existed.
            let floor = if latest == 0 { version } else { 0 };
            pool.min_valid_version().max(by_history).max(floor)
        };
        {
            let mut pool = self.pool.borrow_mut();
            // Keep the chunk backing the oldest live root on the
            // pinned-root list; the membership change flushes with the
            // heads below.
            let pin_root = self.history.lookup(min_valid);
            pool.refresh_root_pin(pin_root, &[fast_frontier.0, slow_frontier.0])?;
            pool.advance_heads(fast_frontier, slow_frontier, version, min_valid)?;
        }

        crate::metrics::COMMITS.inc();
        self.events.commit_published(version, root_offset);
        tracing::debug!(target: "store", version, ?root_offset, "commit published");

        if self.config.compaction {
            if let Err(err) = self.run_compaction() {
                tracing::warn!(target: "store::compact", %err, "compaction failed, continuing");
            }
        }
        Ok(root_offset)
    }

    /// Runs one compaction cycle if a candidate chunk exists; also
    /// invoked opportunistically after each commit when enabled.
    pub fn run_compaction(&self) -> Result<bool, CommitError> {
        let ctx = self.ctx();
        let fast_chunk = self.fast.borrow().current_chunk();
        let reclaimed = compact::run_if_needed(&ctx, &self.history, &self.slow, fast_chunk)?;
        if let Some(chunk) = reclaimed {
            self.events.chunk_compacted(chunk);
        }
        Ok(reclaimed.is_some())
    }

    fn resolve_root(&self, version: u64) -> Result<FileOffset, FindError> {
        let (latest, min_valid) = {
            let pool = self.pool.borrow();
            (pool.latest_version(), pool.min_valid_version())
        };
        resolve_root_in(&self.history, version, latest, min_valid)
    }

    /// Value stored at `key` in `version`, or `None`.
    pub fn find(&self, version: u64, key: &[u8]) -> Result<Option<Vec<u8>>, FindError> {
        self.io.block_on(self.find_async(version, key))
    }

    /// Asynchronous point lookup; resolved by this handle's reactor.
    pub async fn find_async(&self, version: u64, key: &[u8]) -> Result<Option<Vec<u8>>, FindError> {
        let root = self.resolve_root(version)?;
        let ctx = self.ctx();
        Ok(trie_find::find(&ctx, root, NibbleSlice::from_key(key)).await?)
    }

    /// Point lookup from an explicit root offset, for callers that work
    /// with the block-oriented layout directly.
    pub fn find_at(&self, root: FileOffset, key: &[u8]) -> Result<Option<Vec<u8>>, FindError> {
        let ctx = self.ctx();
        Ok(self
            .io
            .block_on(trie_find::find(&ctx, root, NibbleSlice::from_key(key)))?)
    }

    /// Latest committed version; 0 when nothing has been committed.
    pub fn latest_version(&self) -> u64 {
        self.pool.borrow().latest_version()
    }

    /// Latest version together with its root offset.
    pub fn latest(&self) -> (u64, FileOffset) {
        let version = self.latest_version();
        let root = if version == 0 {
            FileOffset::NONE
        } else {
            self.history.lookup(version).unwrap_or(FileOffset::NONE)
        };
        (version, root)
    }

    /// Oldest version still readable.
    pub fn min_valid_version(&self) -> u64 {
        self.pool.borrow().min_valid_version()
    }

    /// Keccak-256 of the version's root node encoding (the canonical
    /// empty-trie hash for an empty version).
    pub fn root_hash(&self, version: u64) -> Result<Hash256, FindError> {
        let root = self.resolve_root(version)?;
        if root.is_none() {
            return Ok(EMPTY_TRIE_ROOT);
        }
        let ctx = self.ctx();
        let node = self.io.block_on(ctx.read_node(root, 0))?;
        Ok(crate::trie::encoding::root_hash_of_rlp(&node.rlp()))
    }

    /// Depth-first, key-ordered walk of `version`, invoking `visitor` for
    /// every `(key, value)` pair.
    pub fn traverse(
        &self,
        version: u64,
        visitor: &mut dyn FnMut(&Nibbles, &[u8]),
    ) -> Result<(), FindError> {
        let root = self.resolve_root(version)?;
        let ctx = self.ctx();
        Ok(self
            .io
            .block_on(trie_find::traverse(&ctx, root, Nibbles::new(), visitor, 0))?)
    }

    /// Truncates readable history to `[min_valid, target]`.  Chunks
    /// holding newer data are reclaimed later by compaction, never here.
    pub fn rewind(&mut self, target: u64) -> Result<(), RewindError> {
        let (latest, min_valid) = {
            let pool = self.pool.borrow();
            (pool.latest_version(), pool.min_valid_version())
        };
        if target < min_valid || target > latest {
            return Err(RewindError::InvalidVersion { target, min_valid, latest });
        }
        {
            let mut pool = self.pool.borrow_mut();
            pool.set_versions(target, min_valid);
            pool.flush_meta().map_err(|err| match err {
                PoolError::Io(err) => RewindError::Io(err),
                other => RewindError::Io(io::Error::other(other)),
            })?;
        }
        self.events.version_rewound(target);
        tracing::info!(target: "store", target, "history rewound");
        Ok(())
    }
}

fn resolve_root_in(
    history: &HistoryIndex,
    version: u64,
    latest: u64,
    min_valid: u64,
) -> Result<FileOffset, FindError> {
    if version > latest || version < min_valid {
        return Err(FindError::PrunedVersion);
    }
    if version == 0 {
        return Ok(FileOffset::NONE);
    }
    history
        .lookup(version)
        .ok_or_else(|| FindError::Io(io::Error::other("missing record for version in window")))
}

/// Read-only handle over the same paths.  Sees the writer's progress by
/// re-reading the durable metadata snapshot; takes no lock.
pub struct ReadOnlyDb {
    pool: Rc<RefCell<StoragePool>>,
    io: AsyncIO,
    history: HistoryIndex,
    cache: Arc<NodeCache>,
    policy: TriePolicy,
}

impl ReadOnlyDb {
    pub fn open(config: StoreConfig) -> Result<Self, OpenError> {
        let pool = StoragePool::open(&config, false)?;
        let fds: Vec<i32> = pool.devices().iter().map(|d| d.data_fd()).collect();
        let io = AsyncIO::new(
            config.uring_entries,
            config.sq_thread_cpu,
            config.rd_buffers,
            config.wr_buffers,
            &fds,
        )?;
        let history = HistoryIndex::new(&pool, false)?;
        let cache = Arc::new(NodeCache::new(config.node_cache_size.as_u64() as usize));
        Ok(Self {
            pool: Rc::new(RefCell::new(pool)),
            io,
            history,
            cache,
            policy: TriePolicy::default(),
        })
    }

    /// Re-reads the metadata snapshot, picking up the writer's latest
    /// durable commit.
    pub fn refresh(&self) -> Result<(), OpenError> {
        self.pool.borrow_mut().refresh()?;
        Ok(())
    }

    /// Latest durable version (refreshes the snapshot first).
    pub fn latest_version(&self) -> Result<u64, OpenError> {
        self.refresh()?;
        Ok(self.pool.borrow().latest_version())
    }

    pub fn min_valid_version(&self) -> u64 {
        self.pool.borrow().min_valid_version()
    }

    fn ctx(&self) -> TrieCtx {
        TrieCtx {
            io: self.io.clone(),
            pool: Rc::clone(&self.pool),
            cache: Arc::clone(&self.cache),
            policy: self.policy,
        }
    }

    pub fn find(&self, version: u64, key: &[u8]) -> Result<Option<Vec<u8>>, FindError> {
        let (latest, min_valid) = {
            let pool = self.pool.borrow();
            (pool.latest_version(), pool.min_valid_version())
        };
        let root = resolve_root_in(&self.history, version, latest, min_valid)?;
        let ctx = self.ctx();
        Ok(self
            .io
            .block_on(trie_find::find(&ctx, root, NibbleSlice::from_key(key)))?)
    }

    pub fn root_hash(&self, version: u64) -> Result<Hash256, FindError> {
        let (latest, min_valid) = {
            let pool = self.pool.borrow();
            (pool.latest_version(), pool.min_valid_version())
        };
        let root = resolve_root_in(&self.history, version, latest, min_valid)?;
        if root.is_none() {
            return Ok(EMPTY_TRIE_ROOT);
        }
        let ctx = self.ctx();
        let node = self.io.block_on(ctx.read_node(root, 0))?;
        Ok(crate::trie::encoding::root_hash_of_rlp(&node.rlp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::encoding::{encode_branch, encode_two_piece, NodeRef, SecondPiece};
    use crate::trie::update::Update;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use triedb_primitives::keccak256;

    fn test_db(dir: &tempfile::TempDir) -> Db {
        Db::open(StoreConfig::test_config(dir.path().join("db"))).unwrap()
    }

    fn put(key: &[u8], value: &[u8], version: u64) -> Update {
        Update::put(Nibbles::from_key(key), value.to_vec(), version)
    }

    fn del(key: &[u8], version: u64) -> Update {
        Update::delete(Nibbles::from_key(key), version)
    }

    fn sorted(mut updates: Vec<Update>) -> Vec<Update> {
        updates.sort_by(|a, b| a.key.as_slice().cmp_with(&b.key.as_slice()));
        updates
    }

    #[test]
    fn empty_pool_has_empty_trie() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir);
        assert_eq!(db.latest_version(), 0);
        assert_eq!(db.min_valid_version(), 0);
        assert_eq!(db.find(0, &[0xab, 0xcd]).unwrap(), None);
        assert_eq!(db.root_hash(0).unwrap(), EMPTY_TRIE_ROOT);
        assert_matches!(db.find(1, &[0xab]), Err(FindError::PrunedVersion));
    }

    #[test]
    fn single_leaf_root_hash_matches_two_piece_rlp() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = test_db(&dir);
        db.commit(vec![put(&[0xab, 0xcd], &[0x12, 0x34, 0x56, 0x78], 1)], 1).unwrap();
        assert_eq!(db.find(1, &[0xab, 0xcd]).unwrap(), Some(vec![0x12, 0x34, 0x56, 0x78]));

        // keccak(rlp([HP(key, leaf), value])) computed from the raw pieces.
        let mut leaf = rlp::RlpStream::new_list(2);
        leaf.append(&vec![0x20u8, 0xab, 0xcd]);
        leaf.append(&vec![0x12u8, 0x34, 0x56, 0x78]);
        assert_eq!(db.root_hash(1).unwrap(), keccak256(leaf.out().to_vec()));
    }

    #[test]
    fn two_leaves_sharing_a_nibble_form_extension_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = test_db(&dir);
        db.commit(
            vec![put(&[0xab, 0xcd], b"v1", 1), put(&[0xac, 0xcd], b"v2", 1)],
            1,
        )
        .unwrap();
        assert_eq!(db.find(1, &[0xab, 0xcd]).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.find(1, &[0xac, 0xcd]).unwrap(), Some(b"v2".to_vec()));
        assert_eq!(db.find(1, &[0xab, 0xce]).unwrap(), None);
        assert_eq!(db.find(1, &[0xab]).unwrap(), None);

        // extension(a) -> branch{ b -> leaf(cd, v1), c -> leaf(cd, v2) }.
        let leaf = |value: &[u8]| {
            encode_two_piece(
                Nibbles::from_nibbles(&[0xc, 0xd]).as_slice(),
                SecondPiece::Value(value),
            )
        };
        let (l1, l2) = (NodeRef::from_rlp(&leaf(b"v1")), NodeRef::from_rlp(&leaf(b"v2")));
        let mut children: [Option<&NodeRef>; 16] = [None; 16];
        children[0xb] = Some(&l1);
        children[0xc] = Some(&l2);
        let branch = NodeRef::from_rlp(&encode_branch(&children, None));
        let root = encode_two_piece(
            Nibbles::from_nibbles(&[0xa]).as_slice(),
            SecondPiece::Ref(&branch),
        );
        assert_eq!(db.root_hash(1).unwrap(), keccak256(root));
    }

    #[test]
    fn delete_collapses_back_to_single_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = test_db(&dir);
        db.commit(
            vec![
                put(&[0xab, 0xcd], &[0x12, 0x34, 0x56, 0x78], 1),
                put(&[0xac, 0xcd], b"doomed", 1),
            ],
            1,
        )
        .unwrap();
        db.commit(vec![del(&[0xac, 0xcd], 2)], 2).unwrap();
        assert_eq!(db.find(2, &[0xac, 0xcd]).unwrap(), None);
        assert_eq!(db.find(2, &[0xab, 0xcd]).unwrap(), Some(vec![0x12, 0x34, 0x56, 0x78]));

        // Identical to having only ever committed the surviving leaf.
        let other_dir = tempfile::tempdir().unwrap();
        let mut other = test_db(&other_dir);
        other.commit(vec![put(&[0xab, 0xcd], &[0x12, 0x34, 0x56, 0x78], 1)], 1).unwrap();
        assert_eq!(db.root_hash(2).unwrap(), other.root_hash(1).unwrap());

        // Deleting the last key empties the trie.
        db.commit(vec![del(&[0xab, 0xcd], 3)], 3).unwrap();
        assert_eq!(db.root_hash(3).unwrap(), EMPTY_TRIE_ROOT);
        assert_eq!(db.find(3, &[0xab, 0xcd]).unwrap(), None);
    }

    #[test]
    fn recommitting_identical_batch_reuses_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = test_db(&dir);
        let batch = |version| {
            vec![put(&[0x11, 0x22], b"a", version), put(&[0x11, 0xf2], b"b", version)]
        };
        let first = db.commit(batch(1), 1).unwrap();
        let second = db.commit(batch(2), 2).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.latest_version(), 2);
        assert_eq!(db.root_hash(1).unwrap(), db.root_hash(2).unwrap());
        // Deletes of absent keys are no-ops too.
        let third = db.commit(vec![del(&[0x99, 0x99], 3)], 3).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn root_is_a_pure_function_of_final_state() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut kvs: Vec<([u8; 8], [u8; 16])> = (0..30).map(|_| rng.r#gen()).collect();
        kvs.sort();
        kvs.dedup_by_key(|(k, _)| *k);

        let dir_a = tempfile::tempdir().unwrap();
        let mut db_a = test_db(&dir_a);
        db_a.commit(
            sorted(kvs.iter().map(|(k, v)| put(k, v, 1)).collect()),
            1,
        )
        .unwrap();

        // Same state reached through three commits, interleaved subsets,
        // with an overwrite on the way.
        let dir_b = tempfile::tempdir().unwrap();
        let mut db_b = test_db(&dir_b);
        let (evens, odds): (Vec<_>, Vec<_>) =
            kvs.iter().enumerate().partition(|(i, _)| i % 2 == 0);
        db_b.commit(
            sorted(odds.iter().map(|(_, (k, v))| put(k, v, 1)).collect()),
            1,
        )
        .unwrap();
        db_b.commit(
            sorted(evens.iter().map(|(_, (k, _))| put(k, b"garbage", 2)).collect()),
            2,
        )
        .unwrap();
        db_b.commit(
            sorted(evens.iter().map(|(_, (k, v))| put(k, v, 3)).collect()),
            3,
        )
        .unwrap();
        assert_eq!(db_a.root_hash(1).unwrap(), db_b.root_hash(3).unwrap());
    }

    #[test]
    fn durability_and_history_bound_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("db"));
        let key = [0x42u8; 4];
        {
            let mut db = Db::open(config.clone()).unwrap();
            for version in 1..=150u64 {
                db.commit(vec![put(&key, &version.to_le_bytes(), version)], version).unwrap();
            }
            assert_eq!(db.latest_version(), 150);
            // history_length = 100 in the test config.
            assert_eq!(db.min_valid_version(), 51);
            assert_eq!(db.find(150, &key).unwrap(), Some(150u64.to_le_bytes().to_vec()));
            assert_eq!(db.find(51, &key).unwrap(), Some(51u64.to_le_bytes().to_vec()));
            assert_matches!(db.find(50, &key), Err(FindError::PrunedVersion));
        }
        let db = Db::open(config).unwrap();
        assert_eq!(db.latest_version(), 150);
        assert_eq!(db.min_valid_version(), 51);
        assert_eq!(db.find(150, &key).unwrap(), Some(150u64.to_le_bytes().to_vec()));
        assert_eq!(db.find(51, &key).unwrap(), Some(51u64.to_le_bytes().to_vec()));
        assert_matches!(db.find(50, &key), Err(FindError::PrunedVersion));
    }

    #[test]
    fn rewind_truncates_history_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("db"));
        let key = [0x42u8; 4];
        {
            let mut db = Db::open(config.clone()).unwrap();
            for version in 1..=150u64 {
                db.commit(vec![put(&key, &version.to_le_bytes(), version)], version).unwrap();
            }
            db.rewind(100).unwrap();
            assert_eq!(db.latest_version(), 100);
            assert_eq!(db.find(100, &key).unwrap(), Some(100u64.to_le_bytes().to_vec()));
            assert_matches!(db.find(101, &key), Err(FindError::PrunedVersion));
            assert_matches!(
                db.rewind(40),
                Err(RewindError::InvalidVersion { target: 40, .. })
            );
        }
        let mut db = Db::open(config).unwrap();
        assert_eq!(db.latest_version(), 100);
        assert_eq!(db.find(100, &key).unwrap(), Some(100u64.to_le_bytes().to_vec()));
        assert_matches!(db.find(101, &key), Err(FindError::PrunedVersion));
        // History moves forward again past the rewind point.
        db.commit(vec![put(&key, b"fresh", 101)], 101).unwrap();
        assert_eq!(db.find(101, &key).unwrap(), Some(b"fresh".to_vec()));
        assert_eq!(db.find(100, &key).unwrap(), Some(100u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn nested_updates_hang_a_subtree_off_the_value_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = test_db(&dir);
        let account = [0xaa, 0xbb];
        let mut update = put(&account, b"acct-v1", 1);
        update.next = vec![
            put(&[0x11, 0x22], b"slot-1", 1),
            put(&[0x33, 0x44], b"slot-2", 1),
        ];
        db.commit(vec![update], 1).unwrap();
        assert_eq!(db.find(1, &account).unwrap(), Some(b"acct-v1".to_vec()));
        assert_eq!(db.find(1, &[0xaa, 0xbb, 0x11, 0x22]).unwrap(), Some(b"slot-1".to_vec()));
        assert_eq!(db.find(1, &[0xaa, 0xbb, 0x33, 0x44]).unwrap(), Some(b"slot-2".to_vec()));
        assert_eq!(db.find(1, &[0xaa, 0xbb, 0x11, 0x23]).unwrap(), None);

        // Incarnation drops the whole old subtree before the new one
        // applies.
        let mut replace = put(&account, b"acct-v2", 2);
        replace.incarnation = true;
        replace.next = vec![put(&[0x55, 0x66], b"slot-3", 2)];
        db.commit(vec![replace], 2).unwrap();
        assert_eq!(db.find(2, &account).unwrap(), Some(b"acct-v2".to_vec()));
        assert_eq!(db.find(2, &[0xaa, 0xbb, 0x55, 0x66]).unwrap(), Some(b"slot-3".to_vec()));
        assert_eq!(db.find(2, &[0xaa, 0xbb, 0x11, 0x22]).unwrap(), None);
        // The previous version still sees the old storage.
        assert_eq!(db.find(1, &[0xaa, 0xbb, 0x11, 0x22]).unwrap(), Some(b"slot-1".to_vec()));
    }

    #[test]
    fn traverse_yields_pairs_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = test_db(&dir);
        db.commit(
            vec![
                put(&[0x11, 0x11], b"a", 1),
                put(&[0x11, 0x99], b"b", 1),
                put(&[0xf0, 0x00], b"c", 1),
            ],
            1,
        )
        .unwrap();
        let mut seen: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        db.traverse(1, &mut |key, value| {
            seen.push((key.as_slice().iter().collect(), value.to_vec()));
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                (vec![1, 1, 1, 1], b"a".to_vec()),
                (vec![1, 1, 9, 9], b"b".to_vec()),
                (vec![0xf, 0, 0, 0], b"c".to_vec()),
            ]
        );
    }

    struct CountingEvents {
        commits: AtomicUsize,
        compacted: std::sync::Mutex<Vec<u32>>,
    }

    impl EventSink for CountingEvents {
        fn commit_published(&self, _version: u64, _root: FileOffset) {
            self.commits.fetch_add(1, Ordering::Relaxed);
        }
        fn chunk_compacted(&self, chunk: u32) {
            self.compacted.lock().unwrap().push(chunk);
        }
    }

    #[test]
    fn compaction_reclaims_expired_chunks_and_preserves_finds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::test_config(dir.path().join("db"));
        config.history_length = 5;
        config.chunk_size = bytesize::ByteSize::kib(128);
        config.device_size = bytesize::ByteSize::mib(16);
        let events = Arc::new(CountingEvents {
            commits: AtomicUsize::new(0),
            compacted: std::sync::Mutex::new(Vec::new()),
        });
        let mut db =
            Db::open_with(config, TriePolicy::default(), Arc::clone(&events) as Arc<dyn EventSink>)
                .unwrap();

        // A broad base of stable keys, then churn on one hot key so the
        // stable subtrees stay behind in aging chunks.
        let stable: Vec<[u8; 4]> = (0..60u32).map(|i| (i.wrapping_mul(2654435761)).to_be_bytes()).collect();
        let base = sorted(stable.iter().map(|k| put(k, &[0xd0; 1000], 1)).collect());
        db.commit(base, 1).unwrap();
        let hot = [0x07u8, 0x07, 0x07, 0x07];
        for version in 2..=60u64 {
            db.commit(vec![put(&hot, &vec![0xbe; 3000], version)], version).unwrap();
        }

        let latest = db.latest_version();
        let hash_before = db.root_hash(latest).unwrap();
        while db.run_compaction().unwrap() {}
        {
            let compacted = events.compacted.lock().unwrap();
            assert!(!compacted.is_empty(), "no chunk was ever reclaimed");
            // The hook reports the real reclaimed chunk ids.
            let total = db.pool.borrow().chunk_count();
            assert!(compacted.iter().all(|&chunk| chunk < total), "{compacted:?}");
        }

        // Every retained version still resolves every key.
        assert_eq!(db.root_hash(latest).unwrap(), hash_before);
        for version in db.min_valid_version()..=latest {
            for key in &stable {
                assert_eq!(db.find(version, key).unwrap(), Some(vec![0xd0; 1000]));
            }
            assert_eq!(db.find(version, &hot).unwrap(), Some(vec![0xbe; 3000]));
        }

        // Chunk conservation: every chunk is on exactly one list.
        let pool = db.pool.borrow();
        let total = pool.chunk_count() as usize;
        let summed = pool.list_len(ChunkList::Free)
            + pool.list_len(ChunkList::Fast)
            + pool.list_len(ChunkList::Slow)
            + pool.list_len(ChunkList::PinnedRoot);
        assert_eq!(summed, total);
    }

    #[test]
    fn oldest_live_root_chunk_is_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::test_config(dir.path().join("db"));
        config.history_length = 3;
        config.chunk_size = bytesize::ByteSize::kib(128);
        config.device_size = bytesize::ByteSize::mib(16);
        let mut db = Db::open(config).unwrap();

        // Full-batch rewrites big enough that the oldest live root falls
        // behind the fast writer's current chunk.
        let keys: Vec<[u8; 4]> = (0..20u32).map(|i| (i.wrapping_mul(2654435761)).to_be_bytes()).collect();
        for version in 1..=40u64 {
            let batch = sorted(
                keys.iter().map(|k| put(k, &[version as u8; 3000], version)).collect(),
            );
            db.commit(batch, version).unwrap();
        }

        let min_valid = db.min_valid_version();
        let root = db.history.lookup(min_valid).unwrap();
        let pool = db.pool.borrow();
        assert_eq!(pool.chunks_in(ChunkList::PinnedRoot), vec![root.chunk()]);
        assert_ne!(pool.fast_frontier().0, root.chunk());
        // The pinned chunk still counts towards chunk conservation.
        let total = pool.chunk_count() as usize;
        let summed = pool.list_len(ChunkList::Free)
            + pool.list_len(ChunkList::Fast)
            + pool.list_len(ChunkList::Slow)
            + pool.list_len(ChunkList::PinnedRoot);
        assert_eq!(summed, total);
        drop(pool);

        // Every key of every retained version resolves with the pin in
        // place.
        for version in min_valid..=db.latest_version() {
            for key in &keys {
                assert_eq!(
                    db.find(version, key).unwrap(),
                    Some(vec![version as u8; 3000])
                );
            }
        }
    }

    #[test]
    fn readonly_handle_tracks_live_writer() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("db"));
        let mut db = Db::open(config.clone()).unwrap();
        let ro = ReadOnlyDb::open(config).unwrap();
        assert_eq!(ro.latest_version().unwrap(), 0);

        db.commit(vec![put(&[0xab, 0xcd], b"seen", 1)], 1).unwrap();
        assert_eq!(ro.latest_version().unwrap(), 1);
        assert_eq!(ro.find(1, &[0xab, 0xcd]).unwrap(), Some(b"seen".to_vec()));
        assert_eq!(ro.root_hash(1).unwrap(), db.root_hash(1).unwrap());

        db.commit(vec![put(&[0xab, 0xcd], b"newer", 2)], 2).unwrap();
        assert_eq!(ro.latest_version().unwrap(), 2);
        assert_eq!(ro.find(2, &[0xab, 0xcd]).unwrap(), Some(b"newer".to_vec()));
        assert_eq!(ro.find(1, &[0xab, 0xcd]).unwrap(), Some(b"seen".to_vec()));
    }

    #[test]
    fn commit_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = test_db(&dir);
        assert_matches!(
            db.commit(vec![put(&[0x02], b"b", 1), put(&[0x01], b"a", 1)], 1),
            Err(CommitError::UnsortedUpdates)
        );
        assert_matches!(
            db.commit(vec![put(&[0x01], b"a", 1)], 0),
            Err(CommitError::InvalidVersion { .. })
        );
        db.commit(vec![put(&[0x01], b"a", 1)], 1).unwrap();
        assert_matches!(
            db.commit(vec![put(&[0x01], b"b", 3)], 3),
            Err(CommitError::InvalidVersion { got: 3, latest: 1 })
        );
        assert_matches!(
            db.commit(vec![put(&[0x01], b"b", 1)], 2),
            Err(CommitError::UpdateVersionMismatch(1, 2))
        );
        assert_matches!(
            db.commit(vec![put(&[0x01], &vec![0u8; MAX_VALUE_SIZE + 1], 2)], 2),
            Err(CommitError::ValueTooLarge)
        );
        // The failed commits published nothing.
        assert_eq!(db.latest_version(), 1);
    }
}
