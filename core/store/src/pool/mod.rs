//! Storage pool: presents one or more block devices or regular files as an
//! ordered array of equal-sized chunks with durable list state.
//!
//! Device 0 layout: two 4 KiB metadata copies, the version ring, then
//! chunks back to back.  Further devices carry chunks only.  All multi-byte
//! integers on disk are little-endian.

pub(crate) mod meta;

use crate::config::StoreConfig;
use crate::mem::{AlignedBuf, DISK_PAGE_SIZE};
use fs2::FileExt;
use meta::{ChunkHeader, MetaScalars};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt as UnixFileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub use meta::MAX_CHUNKS;

/// Number of slots in the version ring.
pub const RING_SLOTS: u64 = 65535;
/// Bytes of one version record: `(version: u64, root_offset: u64)`.
pub const RING_RECORD_BYTES: u64 = 16;
/// Ring region size, padded to a page boundary.
pub const RING_REGION_BYTES: u64 =
    (RING_SLOTS * RING_RECORD_BYTES).div_ceil(DISK_PAGE_SIZE as u64) * DISK_PAGE_SIZE as u64;
/// Device offset of the ring region on device 0.
pub const RING_START: u64 = 2 * DISK_PAGE_SIZE as u64;
/// Device offset of the first chunk on device 0.
pub const DATA_START: u64 = RING_START + RING_REGION_BYTES;

const NIL: u32 = u32::MAX;
const MIN_CHUNK_SIZE: u64 = 128 * 1024;

/// A 64-bit node location: chunk id in the low 20 bits, byte offset within
/// the chunk in the middle 42 bits, and the number of 4 KiB pages a reader
/// must fetch (1..=3) in the top 2 bits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileOffset(u64);

const CHUNK_BITS: u32 = 20;
const OFFSET_BITS: u32 = 42;

impl FileOffset {
    /// Sentinel for "no node" (the empty trie root).
    pub const NONE: FileOffset = FileOffset(u64::MAX);

    pub fn new(chunk: u32, offset: u64, pages: u8) -> Self {
        debug_assert!(chunk < (1 << CHUNK_BITS));
        debug_assert!(offset < (1 << OFFSET_BITS));
        debug_assert!((1..=3).contains(&pages));
        Self((pages as u64) << (CHUNK_BITS + OFFSET_BITS) | offset << CHUNK_BITS | chunk as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub fn chunk(self) -> u32 {
        (self.0 & ((1 << CHUNK_BITS) - 1)) as u32
    }

    /// Byte offset within the chunk (the chunk header page included).
    pub fn offset(self) -> u64 {
        self.0 >> CHUNK_BITS & ((1 << OFFSET_BITS) - 1)
    }

    /// How many disk pages to read to fetch the whole node.
    pub fn pages(self) -> usize {
        (self.0 >> (CHUNK_BITS + OFFSET_BITS)) as usize
    }
}

impl std::fmt::Debug for FileOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "FileOffset::NONE")
        } else {
            write!(f, "{}:{}/{}p", self.chunk(), self.offset(), self.pages())
        }
    }
}

/// Which list a chunk belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkList {
    Free = 0,
    /// Hot appends from the commit path.
    Fast = 1,
    /// Compactor output.
    Slow = 2,
    /// Chunks pinned by a root that must not be reclaimed.
    PinnedRoot = 3,
}

impl ChunkList {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::Fast),
            2 => Some(Self::Slow),
            3 => Some(Self::PinnedRoot),
            _ => None,
        }
    }
}

/// In-memory state of one chunk.
#[derive(Clone, Debug)]
pub struct ChunkState {
    pub list: ChunkList,
    /// Bumped on every allocation; discriminates cache entries across
    /// chunk reuse.
    pub generation: u8,
    /// List the chunk came from when it was pinned; `Free` otherwise.
    pub pinned_from: ChunkList,
    /// Allocation sequence; orders chunks within a list, oldest first.
    pub seq: u32,
    /// Lowest commit version of a node written to this chunk.
    pub min_version: u64,
    /// Highest commit version of a node written to this chunk.
    pub max_version: u64,
}

/// One backing file or block device.
#[derive(Debug)]
pub struct Device {
    /// Buffered fd; device 0 uses it for metadata and ring I/O.
    pub(crate) meta_file: File,
    /// O_DIRECT fd (falls back to buffered where unsupported) used for all
    /// chunk data I/O, registered with the ring.
    pub(crate) data_file: File,
    pub(crate) direct: bool,
    pub(crate) first_chunk: u32,
    pub(crate) chunk_count: u32,
    /// Device offset of chunk `first_chunk`.
    pub(crate) data_base: u64,
}

impl Device {
    pub fn data_fd(&self) -> i32 {
        self.data_file.as_raw_fd()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// I/O error on the backing device.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Both metadata copies failed validation.
    #[error("both pool metadata copies are corrupt")]
    CorruptMetadata,

    /// Pool does not exist and `create` was not requested.
    #[error("pool does not exist")]
    DbDoesNotExist,

    /// Pool exists but opening an existing pool was not requested.
    #[error("pool already exists")]
    DbAlreadyExists,

    /// Another writable handle holds the pool lock.
    #[error("pool is locked by another writer")]
    LockHeld,

    /// Free list is empty.  The caller may run compaction and retry.
    #[error("out of chunks")]
    OutOfChunks,

    /// Rejected configuration.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// The chunked storage pool.  One writable handle per pool; any number of
/// read-only handles, each seeing the last durable metadata snapshot.
#[derive(Debug)]
pub struct StoragePool {
    paths: Vec<PathBuf>,
    devices: Vec<Device>,
    scalars: MetaScalars,
    chunks: Vec<ChunkState>,
    /// Copy (0 or 1) holding `scalars.generation`; flushes go to the other.
    active_copy: u8,
    writable: bool,
}

fn device_len(file: &File) -> io::Result<u64> {
    // Block devices report len 0 through metadata; lseek works for both.
    let end = unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_END) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(end as u64)
}

fn open_device_files(
    path: &Path,
    writable: bool,
    create: bool,
    device_size: u64,
) -> io::Result<(File, File, bool)> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(writable).create(writable && create);
    let meta_file = opts.open(path)?;
    if writable && device_len(&meta_file)? == 0 {
        // Freshly created regular file; size it.
        meta_file.set_len(device_size)?;
    }
    let mut direct_opts = OpenOptions::new();
    direct_opts.read(true).write(writable).custom_flags(libc::O_DIRECT);
    match direct_opts.open(path) {
        Ok(data_file) => Ok((meta_file, data_file, true)),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            tracing::warn!(
                target: "store::pool",
                path = %path.display(),
                "filesystem rejects O_DIRECT, falling back to buffered I/O"
            );
            let data_file = OpenOptions::new().read(true).write(writable).open(path)?;
            Ok((meta_file, data_file, false))
        }
        Err(err) => Err(err),
    }
}

impl StoragePool {
    /// Opens or creates the pool described by `config`.
    ///
    /// Reads both metadata copies and selects the one with the higher
    /// generation and a valid CRC; when neither validates, initializes a
    /// new pool if `config.create` allows it.
    pub fn open(config: &StoreConfig, writable: bool) -> Result<Self, PoolError> {
        if config.paths.is_empty() {
            return Err(PoolError::InvalidConfig("no backing paths".to_string()));
        }
        let chunk_size = config.chunk_size.as_u64();
        if chunk_size < MIN_CHUNK_SIZE || chunk_size % (64 * 1024) != 0 || chunk_size > u32::MAX as u64
        {
            return Err(PoolError::InvalidConfig(format!(
                "chunk_size {chunk_size} must be a multiple of 64 KiB between {MIN_CHUNK_SIZE} and 4 GiB"
            )));
        }
        let exists = config.paths[0].exists();
        if !exists && !(writable && config.create) {
            return Err(PoolError::DbDoesNotExist);
        }

        let mut devices = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            let (meta_file, data_file, direct) = open_device_files(
                path,
                writable,
                config.create,
                config.device_size.as_u64(),
            )?;
            devices.push(Device {
                meta_file,
                data_file,
                direct,
                first_chunk: 0,
                chunk_count: 0,
                data_base: 0,
            });
        }
        if writable && devices[0].meta_file.try_lock_exclusive().is_err() {
            return Err(PoolError::LockHeld);
        }

        let mut page_a = vec![0u8; DISK_PAGE_SIZE];
        let mut page_b = vec![0u8; DISK_PAGE_SIZE];
        let have_meta = exists
            && devices[0].meta_file.read_exact_at(&mut page_a, 0).is_ok()
            && devices[0].meta_file.read_exact_at(&mut page_b, DISK_PAGE_SIZE as u64).is_ok();
        let decoded = if have_meta {
            match (meta::decode_meta(&page_a), meta::decode_meta(&page_b)) {
                (Some(a), Some(b)) => {
                    Some(if a.0.generation >= b.0.generation { (a, 0) } else { (b, 1) })
                }
                (Some(a), None) => Some((a, 0)),
                (None, Some(b)) => Some((b, 1)),
                (None, None) => None,
            }
        } else {
            None
        };

        match decoded {
            Some(((scalars, chunks), active_copy)) => {
                if !config.append {
                    return Err(PoolError::DbAlreadyExists);
                }
                let mut pool = Self {
                    paths: config.paths.clone(),
                    devices,
                    scalars,
                    chunks,
                    active_copy,
                    writable,
                };
                pool.assign_device_ranges()?;
                pool.load_chunk_version_ranges()?;
                // The configured history length applies from this open on;
                // the floor never moves backwards so pruned versions stay
                // pruned.
                if writable {
                    pool.scalars.history_length = config.history_length;
                    let latest = pool.scalars.latest_version;
                    if latest > 0 {
                        let by_history =
                            latest.saturating_sub(config.history_length.saturating_sub(1));
                        if by_history > pool.scalars.min_valid_version {
                            pool.scalars.min_valid_version = by_history;
                        }
                    }
                }
                tracing::info!(
                    target: "store::pool",
                    path = %pool.paths[0].display(),
                    chunks = pool.chunks.len(),
                    latest_version = pool.scalars.latest_version,
                    direct = pool.devices[0].direct,
                    "opened storage pool"
                );
                Ok(pool)
            }
            None if exists && have_meta && !config.create => Err(PoolError::CorruptMetadata),
            None if !writable || !config.create => Err(PoolError::DbDoesNotExist),
            None => Self::create(config, devices),
        }
    }

    /// Initializes a fresh pool over the opened devices.
    fn create(config: &StoreConfig, mut devices: Vec<Device>) -> Result<Self, PoolError> {
        let chunk_size = config.chunk_size.as_u64();
        let mut total: u64 = 0;
        for (idx, device) in devices.iter_mut().enumerate() {
            let len = device_len(&device.meta_file)?;
            let base = if idx == 0 { DATA_START } else { 0 };
            if len < base + chunk_size {
                return Err(PoolError::InvalidConfig(format!(
                    "device {idx} too small for a single chunk"
                )));
            }
            device.first_chunk = total as u32;
            device.chunk_count = ((len - base) / chunk_size) as u32;
            device.data_base = base;
            total += device.chunk_count as u64;
        }
        if total as usize > MAX_CHUNKS {
            tracing::warn!(
                target: "store::pool",
                total,
                max = MAX_CHUNKS,
                "device larger than the chunk table allows, clamping; raise chunk_size to use it all"
            );
            let mut remaining = MAX_CHUNKS as u64;
            for device in &mut devices {
                let take = remaining.min(device.chunk_count as u64) as u32;
                device.chunk_count = take;
                remaining -= take as u64;
            }
            total = MAX_CHUNKS as u64;
        }

        let chunks: Vec<ChunkState> = (0..total as u32)
            .map(|i| ChunkState {
                list: ChunkList::Free,
                generation: 0,
                pinned_from: ChunkList::Free,
                seq: i,
                min_version: u64::MAX,
                max_version: 0,
            })
            .collect();
        let scalars = MetaScalars {
            generation: 1,
            chunk_size,
            chunk_count: total as u32,
            seq_counter: total,
            latest_version: 0,
            min_valid_version: 0,
            history_length: config.history_length,
            fast_frontier: (NIL, 0),
            slow_frontier: (NIL, 0),
        };
        let mut pool = Self {
            paths: config.paths.clone(),
            devices,
            scalars,
            chunks,
            active_copy: 0,
            writable: true,
        };

        // Zero the ring region so stale slots never decode as records.
        let zeroes = vec![0u8; RING_REGION_BYTES as usize];
        pool.devices[0].meta_file.write_all_at(&zeroes, RING_START)?;
        for chunk in 0..pool.chunks.len() as u32 {
            pool.write_chunk_header(chunk)?;
        }
        pool.sync_data()?;
        // Copy A gets the initial state; copy B stays invalid until the
        // first flush.
        let mut page = vec![0u8; DISK_PAGE_SIZE];
        meta::encode_meta(&pool.scalars, &pool.chunks, &mut page);
        pool.devices[0].meta_file.write_all_at(&page, 0)?;
        pool.devices[0].meta_file.sync_data()?;
        tracing::info!(
            target: "store::pool",
            path = %pool.paths[0].display(),
            chunks = pool.chunks.len(),
            chunk_size,
            "created storage pool"
        );
        Ok(pool)
    }

    fn assign_device_ranges(&mut self) -> Result<(), PoolError> {
        let chunk_size = self.scalars.chunk_size;
        let mut next = 0u32;
        let mut remaining = self.scalars.chunk_count;
        for (idx, device) in self.devices.iter_mut().enumerate() {
            let len = device_len(&device.meta_file)?;
            let base = if idx == 0 { DATA_START } else { 0 };
            let fit = ((len.saturating_sub(base)) / chunk_size) as u32;
            let take = fit.min(remaining);
            device.first_chunk = next;
            device.chunk_count = take;
            device.data_base = base;
            next += take;
            remaining -= take;
        }
        if remaining > 0 {
            return Err(PoolError::InvalidConfig(format!(
                "devices hold {} chunks but metadata records {}",
                next, self.scalars.chunk_count
            )));
        }
        Ok(())
    }

    /// Restores per-chunk node version ranges from the chunk headers.
    fn load_chunk_version_ranges(&mut self) -> io::Result<()> {
        for chunk in 0..self.chunks.len() as u32 {
            let state = &self.chunks[chunk as usize];
            if state.list == ChunkList::Free {
                continue;
            }
            let mut buf = AlignedBuf::zeroed(DISK_PAGE_SIZE);
            let (device, offset) = self.locate(chunk, 0);
            self.devices[device].data_file.read_exact_at(buf.as_mut_slice(), offset)?;
            match meta::decode_chunk_header(buf.as_slice()) {
                Some(header) => {
                    let state = &mut self.chunks[chunk as usize];
                    state.min_version = header.min_version;
                    state.max_version = header.max_version;
                }
                None => {
                    tracing::warn!(target: "store::pool", chunk, "unreadable chunk header, assuming full version range");
                    let state = &mut self.chunks[chunk as usize];
                    state.min_version = 0;
                    state.max_version = u64::MAX;
                }
            }
        }
        Ok(())
    }

    pub fn chunk_size(&self) -> u64 {
        self.scalars.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.scalars.chunk_count
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn meta_file(&self) -> &File {
        &self.devices[0].meta_file
    }

    pub fn chunk_state(&self, chunk: u32) -> &ChunkState {
        &self.chunks[chunk as usize]
    }

    pub fn generation_of(&self, chunk: u32) -> u8 {
        self.chunks[chunk as usize].generation
    }

    pub fn free_chunks(&self) -> usize {
        self.list_len(ChunkList::Free)
    }

    pub fn list_len(&self, list: ChunkList) -> usize {
        self.chunks.iter().filter(|c| c.list == list).count()
    }

    /// Chunk ids of `list`, oldest allocation first.
    pub fn chunks_in(&self, list: ChunkList) -> Vec<u32> {
        let mut ids: Vec<u32> = (0..self.chunks.len() as u32)
            .filter(|&c| self.chunks[c as usize].list == list)
            .collect();
        ids.sort_by_key(|&c| self.chunks[c as usize].seq);
        ids
    }

    pub fn oldest_in(&self, list: ChunkList) -> Option<u32> {
        self.chunks_in(list).first().copied()
    }

    /// Removes the oldest free chunk and links it into `list`.
    pub fn allocate(&mut self, list: ChunkList) -> Result<u32, PoolError> {
        assert!(self.writable);
        assert_ne!(list, ChunkList::Free);
        let chunk = self.oldest_in(ChunkList::Free).ok_or(PoolError::OutOfChunks)?;
        let seq = self.bump_seq();
        let state = &mut self.chunks[chunk as usize];
        state.list = list;
        state.generation = state.generation.wrapping_add(1);
        state.pinned_from = ChunkList::Free;
        state.seq = seq;
        state.min_version = u64::MAX;
        state.max_version = 0;
        self.write_chunk_header(chunk)?;
        tracing::debug!(target: "store::pool", chunk, ?list, "allocated chunk");
        crate::metrics::FREE_CHUNKS.set(self.free_chunks() as i64);
        Ok(chunk)
    }

    /// Unlinks `chunk` from its list and prepends it to the free list.
    pub fn release(&mut self, chunk: u32) -> Result<(), PoolError> {
        assert!(self.writable);
        let seq = self.bump_seq();
        let state = &mut self.chunks[chunk as usize];
        debug_assert_ne!(state.list, ChunkList::Free);
        state.list = ChunkList::Free;
        state.pinned_from = ChunkList::Free;
        state.seq = seq;
        state.min_version = u64::MAX;
        state.max_version = 0;
        self.write_chunk_header(chunk)?;
        tracing::debug!(target: "store::pool", chunk, "released chunk");
        crate::metrics::FREE_CHUNKS.set(self.free_chunks() as i64);
        Ok(())
    }

    /// The chunk currently on the pinned-root list, if any.  At most one
    /// chunk is ever pinned.
    pub fn pinned_root_chunk(&self) -> Option<u32> {
        let pinned = self.chunks_in(ChunkList::PinnedRoot);
        debug_assert!(pinned.len() <= 1);
        pinned.first().copied()
    }

    /// Moves a fully-written fast or slow chunk onto the pinned-root
    /// list, taking it out of compaction candidacy.  No-op for chunks in
    /// any other state.
    pub fn pin_root_chunk(&mut self, chunk: u32) -> Result<(), PoolError> {
        assert!(self.writable);
        {
            let state = &mut self.chunks[chunk as usize];
            if !matches!(state.list, ChunkList::Fast | ChunkList::Slow) {
                return Ok(());
            }
            state.pinned_from = state.list;
            state.list = ChunkList::PinnedRoot;
        }
        self.write_chunk_header(chunk)?;
        tracing::debug!(target: "store::pool", chunk, "pinned root chunk");
        Ok(())
    }

    /// Returns a pinned chunk to the list it came from, keeping its
    /// allocation sequence so it ages in place.
    pub fn unpin_root_chunk(&mut self, chunk: u32) -> Result<(), PoolError> {
        assert!(self.writable);
        {
            let state = &mut self.chunks[chunk as usize];
            if state.list != ChunkList::PinnedRoot {
                return Ok(());
            }
            state.list = match state.pinned_from {
                ChunkList::Fast => ChunkList::Fast,
                _ => ChunkList::Slow,
            };
            state.pinned_from = ChunkList::Free;
        }
        self.write_chunk_header(chunk)?;
        tracing::debug!(target: "store::pool", chunk, "unpinned root chunk");
        Ok(())
    }

    /// Re-targets the pinned-root list at the chunk backing `root` (the
    /// oldest live root).  Chunks in `exclude` (the writer frontiers) are
    /// never pinned; their appends protect themselves.  Durability of the
    /// membership change rides the caller's metadata flush.
    pub(crate) fn refresh_root_pin(
        &mut self,
        root: Option<FileOffset>,
        exclude: &[u32],
    ) -> Result<(), PoolError> {
        let target = root
            .filter(|root| !root.is_none())
            .map(|root| root.chunk())
            .filter(|chunk| !exclude.contains(chunk));
        let pinned = self.pinned_root_chunk();
        if pinned == target {
            return Ok(());
        }
        if let Some(chunk) = pinned {
            self.unpin_root_chunk(chunk)?;
        }
        if let Some(chunk) = target {
            self.pin_root_chunk(chunk)?;
        }
        Ok(())
    }

    fn bump_seq(&mut self) -> u32 {
        let seq = self.scalars.seq_counter as u32;
        self.scalars.seq_counter += 1;
        seq
    }

    /// Accounts a node of `version` written into `chunk`.
    pub fn note_node_written(&mut self, chunk: u32, version: u64) {
        let state = &mut self.chunks[chunk as usize];
        state.min_version = state.min_version.min(version);
        state.max_version = state.max_version.max(version);
    }

    /// Rewrites the header page of `chunk` from in-memory state.
    pub(crate) fn write_chunk_header(&self, chunk: u32) -> Result<(), PoolError> {
        let state = &self.chunks[chunk as usize];
        let ids = self.chunks_in(state.list);
        let pos = ids.iter().position(|&c| c == chunk).unwrap();
        let header = ChunkHeader {
            list: state.list,
            generation: state.generation,
            seq: state.seq,
            prev: if pos > 0 { ids[pos - 1] } else { NIL },
            next: ids.get(pos + 1).copied().unwrap_or(NIL),
            min_version: if state.min_version == u64::MAX { 0 } else { state.min_version },
            max_version: state.max_version,
        };
        let mut buf = AlignedBuf::zeroed(DISK_PAGE_SIZE);
        meta::encode_chunk_header(&header, buf.as_mut_slice());
        let (device, offset) = self.locate(chunk, 0);
        self.devices[device].data_file.write_all_at(buf.as_slice(), offset)?;
        Ok(())
    }

    /// Resolves `(chunk, byte offset within chunk)` to a device index and
    /// device byte offset.
    pub fn locate(&self, chunk: u32, offset: u64) -> (usize, u64) {
        debug_assert!(offset < self.scalars.chunk_size);
        for (idx, device) in self.devices.iter().enumerate() {
            if chunk >= device.first_chunk && chunk < device.first_chunk + device.chunk_count {
                let local = (chunk - device.first_chunk) as u64;
                return (idx, device.data_base + local * self.scalars.chunk_size + offset);
            }
        }
        panic!("chunk {chunk} out of range");
    }

    pub fn latest_version(&self) -> u64 {
        self.scalars.latest_version
    }

    pub fn min_valid_version(&self) -> u64 {
        self.scalars.min_valid_version
    }

    pub fn history_length(&self) -> u64 {
        self.scalars.history_length
    }

    pub fn fast_frontier(&self) -> (u32, u32) {
        self.scalars.fast_frontier
    }

    pub fn slow_frontier(&self) -> (u32, u32) {
        self.scalars.slow_frontier
    }

    pub(crate) fn set_versions(&mut self, latest: u64, min_valid: u64) {
        self.scalars.latest_version = latest;
        self.scalars.min_valid_version = min_valid;
    }

    /// Atomically records the durable write frontier of both writers along
    /// with the version window, then flushes the passive metadata copy.
    pub fn advance_heads(
        &mut self,
        fast: (u32, u32),
        slow: (u32, u32),
        latest: u64,
        min_valid: u64,
    ) -> Result<(), PoolError> {
        self.scalars.fast_frontier = fast;
        self.scalars.slow_frontier = slow;
        self.set_versions(latest, min_valid);
        self.flush_meta()
    }

    /// Writes the currently-passive metadata copy with a bumped generation
    /// and syncs it.  Readers pick whichever copy has the higher generation
    /// and a matching CRC, so a crash mid-flush leaves the other copy
    /// authoritative.
    pub fn flush_meta(&mut self) -> Result<(), PoolError> {
        assert!(self.writable);
        self.scalars.generation += 1;
        let target = 1 - self.active_copy;
        let mut page = vec![0u8; DISK_PAGE_SIZE];
        meta::encode_meta(&self.scalars, &self.chunks, &mut page);
        self.devices[0]
            .meta_file
            .write_all_at(&page, target as u64 * DISK_PAGE_SIZE as u64)?;
        self.devices[0].meta_file.sync_data()?;
        self.active_copy = target;
        Ok(())
    }

    /// fdatasync every data fd; the barrier between node writes and the
    /// metadata flush.
    pub fn sync_data(&self) -> io::Result<()> {
        for device in &self.devices {
            device.data_file.sync_data()?;
        }
        Ok(())
    }

    /// Re-reads the metadata copies; used by read-only handles to track a
    /// live writer.
    pub fn refresh(&mut self) -> Result<(), PoolError> {
        assert!(!self.writable);
        let mut page_a = vec![0u8; DISK_PAGE_SIZE];
        let mut page_b = vec![0u8; DISK_PAGE_SIZE];
        self.devices[0].meta_file.read_exact_at(&mut page_a, 0)?;
        self.devices[0].meta_file.read_exact_at(&mut page_b, DISK_PAGE_SIZE as u64)?;
        let (decoded, active_copy) = match (meta::decode_meta(&page_a), meta::decode_meta(&page_b))
        {
            (Some(a), Some(b)) => {
                if a.0.generation >= b.0.generation {
                    (a, 0)
                } else {
                    (b, 1)
                }
            }
            (Some(a), None) => (a, 0),
            (None, Some(b)) => (b, 1),
            (None, None) => return Err(PoolError::CorruptMetadata),
        };
        (self.scalars, self.chunks) = decoded;
        self.active_copy = active_copy;
        Ok(())
    }

    /// Opens a second, read-only handle on the same paths.  It sees the
    /// latest durable metadata snapshot and never mutates the pool.
    pub fn clone_readonly(&self) -> Result<StoragePool, PoolError> {
        let config = StoreConfig {
            paths: self.paths.clone(),
            create: false,
            append: true,
            chunk_size: bytesize::ByteSize(self.scalars.chunk_size),
            ..StoreConfig::default()
        };
        StoragePool::open(&config, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn test_pool(dir: &tempfile::TempDir) -> StoragePool {
        let config = StoreConfig::test_config(dir.path().join("pool"));
        StoragePool::open(&config, true).unwrap()
    }

    #[test]
    fn file_offset_packing() {
        let offset = FileOffset::new(7, 123456, 3);
        assert_eq!(offset.chunk(), 7);
        assert_eq!(offset.offset(), 123456);
        assert_eq!(offset.pages(), 3);
        assert!(!offset.is_none());
        assert!(FileOffset::NONE.is_none());
        assert_eq!(FileOffset::from_raw(offset.raw()), offset);
    }

    #[test]
    fn create_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("pool"));
        let chunk_count = {
            let pool = StoragePool::open(&config, true).unwrap();
            assert!(pool.chunk_count() > 4);
            assert_eq!(pool.free_chunks(), pool.chunk_count() as usize);
            pool.chunk_count()
        };
        let pool = StoragePool::open(&config, true).unwrap();
        assert_eq!(pool.chunk_count(), chunk_count);
        assert_eq!(pool.latest_version(), 0);
    }

    #[test]
    fn missing_pool_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::test_config(dir.path().join("pool"));
        config.create = false;
        assert_matches!(StoragePool::open(&config, true), Err(PoolError::DbDoesNotExist));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("pool"));
        let _pool = StoragePool::open(&config, true).unwrap();
        assert_matches!(StoragePool::open(&config, true), Err(PoolError::LockHeld));
        // Read-only handles are always allowed.
        StoragePool::open(&config, false).unwrap();
    }

    #[test]
    fn allocate_release_conserves_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(&dir);
        let total = pool.chunk_count() as usize;
        let a = pool.allocate(ChunkList::Fast).unwrap();
        let b = pool.allocate(ChunkList::Slow).unwrap();
        assert_ne!(a, b);
        let count = |pool: &StoragePool| {
            pool.list_len(ChunkList::Free)
                + pool.list_len(ChunkList::Fast)
                + pool.list_len(ChunkList::Slow)
                + pool.list_len(ChunkList::PinnedRoot)
        };
        assert_eq!(count(&pool), total);
        assert_eq!(pool.list_len(ChunkList::Fast), 1);
        pool.release(a).unwrap();
        assert_eq!(count(&pool), total);
        assert_eq!(pool.list_len(ChunkList::Fast), 0);
    }

    #[test]
    fn allocation_order_is_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(&dir);
        let a = pool.allocate(ChunkList::Fast).unwrap();
        let b = pool.allocate(ChunkList::Fast).unwrap();
        let c = pool.allocate(ChunkList::Fast).unwrap();
        assert_eq!(pool.chunks_in(ChunkList::Fast), vec![a, b, c]);
        assert_eq!(pool.oldest_in(ChunkList::Fast), Some(a));
        // A released chunk goes to the back of the free queue.
        pool.release(b).unwrap();
        let refilled = pool.allocate(ChunkList::Fast).unwrap();
        assert_ne!(refilled, b);
    }

    #[test]
    fn generation_bumps_on_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(&dir);
        let a = pool.allocate(ChunkList::Fast).unwrap();
        let gen1 = pool.generation_of(a);
        pool.release(a).unwrap();
        // Drain the free list until `a` comes around again.
        loop {
            let c = pool.allocate(ChunkList::Fast).unwrap();
            if c == a {
                break;
            }
        }
        assert_ne!(pool.generation_of(a), gen1);
    }

    #[test]
    fn pin_returns_chunk_to_its_origin_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(&dir);
        let fast = pool.allocate(ChunkList::Fast).unwrap();
        let slow = pool.allocate(ChunkList::Slow).unwrap();

        pool.pin_root_chunk(fast).unwrap();
        assert_eq!(pool.pinned_root_chunk(), Some(fast));
        assert_eq!(pool.chunk_state(fast).list, ChunkList::PinnedRoot);
        assert_eq!(pool.list_len(ChunkList::Fast), 0);
        pool.unpin_root_chunk(fast).unwrap();
        assert_eq!(pool.chunk_state(fast).list, ChunkList::Fast);

        pool.pin_root_chunk(slow).unwrap();
        pool.unpin_root_chunk(slow).unwrap();
        assert_eq!(pool.chunk_state(slow).list, ChunkList::Slow);

        // Pinning a free chunk is a no-op.
        let free = pool.oldest_in(ChunkList::Free).unwrap();
        pool.pin_root_chunk(free).unwrap();
        assert_eq!(pool.pinned_root_chunk(), None);
    }

    #[test]
    fn pinned_membership_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("pool"));
        let fast = {
            let mut pool = StoragePool::open(&config, true).unwrap();
            let fast = pool.allocate(ChunkList::Fast).unwrap();
            pool.pin_root_chunk(fast).unwrap();
            pool.flush_meta().unwrap();
            fast
        };
        let mut pool = StoragePool::open(&config, true).unwrap();
        assert_eq!(pool.pinned_root_chunk(), Some(fast));
        pool.unpin_root_chunk(fast).unwrap();
        assert_eq!(pool.chunk_state(fast).list, ChunkList::Fast);
    }

    #[test]
    fn refresh_root_pin_tracks_target_and_excludes_frontiers() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(&dir);
        let a = pool.allocate(ChunkList::Fast).unwrap();
        let b = pool.allocate(ChunkList::Fast).unwrap();

        pool.refresh_root_pin(Some(FileOffset::new(a, 4096, 1)), &[b]).unwrap();
        assert_eq!(pool.pinned_root_chunk(), Some(a));
        // Retargeting unpins the old chunk first.
        pool.refresh_root_pin(Some(FileOffset::new(b, 4096, 1)), &[]).unwrap();
        assert_eq!(pool.pinned_root_chunk(), Some(b));
        assert_eq!(pool.chunk_state(a).list, ChunkList::Fast);
        // A frontier chunk is never pinned; an empty root unpins.
        pool.refresh_root_pin(Some(FileOffset::new(a, 4096, 1)), &[a]).unwrap();
        assert_eq!(pool.pinned_root_chunk(), None);
        pool.refresh_root_pin(Some(FileOffset::NONE), &[]).unwrap();
        assert_eq!(pool.pinned_root_chunk(), None);
    }

    #[test]
    fn out_of_chunks_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = test_pool(&dir);
        while pool.free_chunks() > 0 {
            pool.allocate(ChunkList::Fast).unwrap();
        }
        assert_matches!(pool.allocate(ChunkList::Fast), Err(PoolError::OutOfChunks));
    }

    #[test]
    fn meta_flush_survives_reopen_and_alternates_copies() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("pool"));
        let (a, generation) = {
            let mut pool = StoragePool::open(&config, true).unwrap();
            let a = pool.allocate(ChunkList::Fast).unwrap();
            pool.advance_heads((a, 4096), (NIL, 0), 5, 1).unwrap();
            pool.advance_heads((a, 8192), (NIL, 0), 6, 1).unwrap();
            (a, pool.scalars.generation)
        };
        let pool = StoragePool::open(&config, true).unwrap();
        assert_eq!(pool.scalars.generation, generation);
        assert_eq!(pool.latest_version(), 6);
        assert_eq!(pool.fast_frontier(), (a, 8192));
        assert_eq!(pool.chunk_state(a).list, ChunkList::Fast);
    }

    #[test]
    fn corrupting_one_meta_copy_falls_back_to_other() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("pool"));
        {
            let mut pool = StoragePool::open(&config, true).unwrap();
            pool.allocate(ChunkList::Fast).unwrap();
            pool.flush_meta().unwrap();
        }
        // Smash the copy with the highest generation (the last flushed one,
        // copy B).
        let file = OpenOptions::new().write(true).open(dir.path().join("pool")).unwrap();
        file.write_all_at(&[0xff; DISK_PAGE_SIZE], DISK_PAGE_SIZE as u64).unwrap();
        let pool = StoragePool::open(&config, true).unwrap();
        // Copy A predates the allocate+flush, so the chunk shows free again.
        assert_eq!(pool.free_chunks(), pool.chunk_count() as usize);
    }

    #[test]
    fn readonly_refresh_tracks_writer() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::test_config(dir.path().join("pool"));
        let mut writer = StoragePool::open(&config, true).unwrap();
        let mut reader = writer.clone_readonly().unwrap();
        assert_eq!(reader.latest_version(), 0);
        writer.advance_heads((NIL, 0), (NIL, 0), 9, 3).unwrap();
        reader.refresh().unwrap();
        assert_eq!(reader.latest_version(), 9);
        assert_eq!(reader.min_valid_version(), 3);
    }
}
