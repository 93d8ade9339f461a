//! Versioned history index: a ring of `(version, root offset)` records at a
//! fixed device offset on device 0.
//!
//! Slot index is `version % RING_SLOTS`.  The region is memory-mapped from
//! the buffered metadata fd; records become durable with the commit's
//! metadata sync, and visible to concurrent read-only handles through
//! shared-mapping coherence.  The version word is stored last with release
//! ordering so a matching version always implies a valid root offset.

use crate::pool::{FileOffset, StoragePool, RING_REGION_BYTES, RING_SLOTS, RING_START};
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct HistoryIndex {
    map: NonNull<u8>,
    writable: bool,
}

// The mapping is shared file memory accessed through atomics.
unsafe impl Send for HistoryIndex {}

impl HistoryIndex {
    pub fn new(pool: &StoragePool, writable: bool) -> io::Result<Self> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                RING_REGION_BYTES as usize,
                prot,
                libc::MAP_SHARED,
                pool.meta_file().as_raw_fd(),
                RING_START as i64,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { map: NonNull::new(map.cast()).expect("mmap returned null"), writable })
    }

    fn slot(&self, version: u64) -> (&AtomicU64, &AtomicU64) {
        let index = version % RING_SLOTS;
        unsafe {
            let base = self.map.as_ptr().add((index * 16) as usize);
            (&*base.cast::<AtomicU64>(), &*base.add(8).cast::<AtomicU64>())
        }
    }

    /// Writes the record for `version`.  Durability rides the caller's
    /// metadata sync.
    pub fn record(&self, version: u64, root: FileOffset) {
        assert!(self.writable);
        assert!(version >= 1, "version 0 is the empty sentinel and is never recorded");
        let (version_word, root_word) = self.slot(version);
        root_word.store(root.raw(), Ordering::Relaxed);
        version_word.store(version, Ordering::Release);
    }

    /// Root offset recorded for `version`, or `None` when the slot has been
    /// overwritten by a later version (or never written).  Window checks
    /// against the pool's `[min_valid, latest]` are the caller's business.
    pub fn lookup(&self, version: u64) -> Option<FileOffset> {
        if version == 0 {
            return None;
        }
        let (version_word, root_word) = self.slot(version);
        if version_word.load(Ordering::Acquire) != version {
            return None;
        }
        Some(FileOffset::from_raw(root_word.load(Ordering::Relaxed)))
    }

    /// Walks back from `latest` to the first version with a valid record
    /// whose root `is_durable`, discarding anything newer.  Used on open to
    /// reconcile the ring with the pool's durable write frontier.
    pub fn reconcile(
        &self,
        latest: u64,
        min_valid: u64,
        is_durable: impl Fn(FileOffset) -> bool,
    ) -> u64 {
        let mut version = latest;
        while version >= min_valid.max(1) {
            match self.lookup(version) {
                Some(root) if is_durable(root) => return version,
                _ => {
                    tracing::warn!(
                        target: "store",
                        version,
                        "discarding version without a durable root record"
                    );
                    version -= 1;
                }
            }
        }
        0
    }
}

impl Drop for HistoryIndex {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.as_ptr().cast(), RING_REGION_BYTES as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn ring(dir: &tempfile::TempDir) -> (StoragePool, HistoryIndex) {
        let config = StoreConfig::test_config(dir.path().join("pool"));
        let pool = StoragePool::open(&config, true).unwrap();
        let index = HistoryIndex::new(&pool, true).unwrap();
        (pool, index)
    }

    #[test]
    fn record_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (_pool, index) = ring(&dir);
        assert_eq!(index.lookup(1), None);
        let root = FileOffset::new(3, 8192, 1);
        index.record(1, root);
        assert_eq!(index.lookup(1), Some(root));
        index.record(2, FileOffset::NONE);
        assert_eq!(index.lookup(2), Some(FileOffset::NONE));
    }

    #[test]
    fn slot_reuse_invalidates_wrapped_version() {
        let dir = tempfile::tempdir().unwrap();
        let (_pool, index) = ring(&dir);
        let old = 5u64;
        let new = old + RING_SLOTS;
        index.record(old, FileOffset::new(1, 4096, 1));
        index.record(new, FileOffset::new(2, 4096, 1));
        assert_eq!(index.lookup(old), None);
        assert_eq!(index.lookup(new), Some(FileOffset::new(2, 4096, 1)));
    }

    #[test]
    fn records_survive_remap() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("pool"));
        {
            let pool = StoragePool::open(&config, true).unwrap();
            let index = HistoryIndex::new(&pool, true).unwrap();
            index.record(7, FileOffset::new(0, 12288, 2));
            pool.meta_file().sync_data().unwrap();
        }
        let pool = StoragePool::open(&config, true).unwrap();
        let index = HistoryIndex::new(&pool, false).unwrap();
        assert_eq!(index.lookup(7), Some(FileOffset::new(0, 12288, 2)));
    }

    #[test]
    fn reconcile_walks_back_past_non_durable_roots() {
        let dir = tempfile::tempdir().unwrap();
        let (_pool, index) = ring(&dir);
        index.record(1, FileOffset::new(0, 4096, 1));
        index.record(2, FileOffset::new(0, 8192, 1));
        index.record(3, FileOffset::new(1, 4096, 1));
        // Only chunk 0 made it to disk.
        let latest = index.reconcile(3, 1, |root| root.chunk() == 0);
        assert_eq!(latest, 2);
        // Nothing durable at all.
        assert_eq!(index.reconcile(3, 1, |_| false), 0);
    }
}
