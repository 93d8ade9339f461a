//! Versioned Merkle Patricia Trie storage engine over raw block storage.
//!
//! A content-addressed, append-only key-value store producing
//! cryptographic state roots.  Raw devices or files are carved into
//! fixed-size chunks; trie nodes append through two page-aligned streams
//! (hot commits vs. compacted data) driven by a single-threaded io_uring
//! reactor with registered buffers; a ring of version records maps every
//! retained version to its root, supporting rewind, bounded history and
//! read-only snapshots that track a live writer.
//!
//! One writable [`Db`] per pool, any number of [`ReadOnlyDb`] handles.

pub mod config;
pub mod db;
pub mod history;
pub mod io;
pub mod mem;
pub mod metrics;
pub mod pool;
pub mod trie;

mod compact;

pub use config::StoreConfig;
pub use db::{CommitError, Db, EventSink, FindError, OpenError, ReadOnlyDb, RewindError};
pub use pool::{ChunkList, FileOffset, PoolError, StoragePool};
pub use trie::nibbles::{NibbleSlice, Nibbles};
pub use trie::update::{Update, UpdateList};
pub use trie::{TrieError, TriePolicy};
pub use triedb_primitives::{keccak256, Hash256, EMPTY_TRIE_ROOT};

// The offset packing, page-count bits and mmap'd ring all assume a
// 64-bit platform.
#[cfg(not(target_pointer_width = "64"))]
compile_error!("triedb-store requires a 64-bit platform");
