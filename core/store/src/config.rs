use bytesize::ByteSize;
use std::path::PathBuf;

/// Configuration for opening a storage pool.
///
/// Field names follow the on-disk database options; everything has a
/// default so a config file only needs to name the backing paths.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Ordered list of backing paths (regular files or block devices).
    ///
    /// The first path carries the pool metadata and the version ring.
    pub paths: Vec<PathBuf>,

    /// Open an existing pool, preserving its data.  Fails with
    /// [`OpenError::DbDoesNotExist`](crate::db::OpenError) if absent.
    pub append: bool,

    /// Create the pool if absent.  When both `create` and `append` are
    /// set, an existing pool is opened and a missing one is initialized.
    pub create: bool,

    /// Run the background compactor when the free list runs low or a
    /// chunk expires out of the history window.
    pub compaction: bool,

    /// On open, rewind to the latest finalized version recorded in the
    /// ring instead of the latest version.
    pub rewind_to_latest_finalized: bool,

    /// Number of registered 16 KiB read buffers.
    pub rd_buffers: usize,

    /// Number of registered 64 KiB write buffers.
    pub wr_buffers: usize,

    /// io_uring submission queue depth.
    pub uring_entries: u32,

    /// Optional CPU to pin the kernel submission-queue polling thread to.
    /// `None` disables SQPOLL.
    pub sq_thread_cpu: Option<u32>,

    /// Number of versions retained and readable behind the latest one.
    pub history_length: u64,

    /// Size of one chunk.  Must be a multiple of 64 KiB and at least
    /// 128 KiB.  Immutable once the pool is created.
    pub chunk_size: ByteSize,

    /// Size regular backing files are created with.  Ignored for block
    /// devices and for existing files.
    pub device_size: ByteSize,

    /// Byte budget of the in-memory node cache.
    pub node_cache_size: ByteSize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            append: true,
            create: false,
            compaction: true,
            rewind_to_latest_finalized: false,
            rd_buffers: 8192,
            wr_buffers: 32,
            uring_entries: 128,
            sq_thread_cpu: None,
            history_length: 65535,
            chunk_size: ByteSize::mib(2),
            device_size: ByteSize::mib(256),
            node_cache_size: ByteSize::mib(64),
        }
    }
}

impl StoreConfig {
    /// Small configuration for tests: one tempfile-backed device, few
    /// buffers, tiny cache.
    pub fn test_config(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
            create: true,
            rd_buffers: 32,
            wr_buffers: 8,
            uring_entries: 32,
            history_length: 100,
            device_size: ByteSize::mib(64),
            node_cache_size: ByteSize::kib(256),
            ..Self::default()
        }
    }
}
