//! Page-aligned append writers.
//!
//! Two independent streams share this implementation: the fast writer
//! takes hot nodes from the commit path, the slow writer takes compactor
//! output, so compaction never interleaves with commit I/O.  Nodes pack
//! tightly into rotating 64 KiB registered buffers; a node is padded to
//! the next page boundary whenever leaving it in place would make the
//! recorded page count insufficient from the rounded-down read offset.

use crate::io::{AsyncIO, WriteBuf};
use crate::mem::DISK_PAGE_SIZE;
use crate::pool::{ChunkList, FileOffset, PoolError, StoragePool};
use crate::trie::node::{Node, MAX_DISK_NODE_SIZE};

const PAGE: u64 = DISK_PAGE_SIZE as u64;

fn round_up_page(value: u64) -> u64 {
    value.div_ceil(PAGE) * PAGE
}

pub struct NodeWriter {
    list: ChunkList,
    io: AsyncIO,
    buf: Option<WriteBuf>,
    chunk: Option<u32>,
    /// Next append position within the chunk (header page included).
    offset: u64,
    /// Chunk offset where the current buffer's first byte lands.
    buf_base: u64,
}

impl NodeWriter {
    /// Resumes the stream at the pool's recorded durable frontier.
    pub fn new(list: ChunkList, io: AsyncIO, frontier: (u32, u32)) -> Self {
        assert!(matches!(list, ChunkList::Fast | ChunkList::Slow));
        let chunk = (frontier.0 != u32::MAX).then_some(frontier.0);
        Self { list, io, buf: None, chunk, offset: frontier.1 as u64, buf_base: 0 }
    }

    /// The stream's current frontier: where the next node will land.
    pub fn frontier(&self) -> (u32, u32) {
        (self.chunk.unwrap_or(u32::MAX), self.offset as u32)
    }

    pub fn current_chunk(&self) -> Option<u32> {
        self.chunk
    }

    fn metrics_label(&self) -> &'static str {
        match self.list {
            ChunkList::Fast => "fast",
            _ => "slow",
        }
    }

    /// Appends `node`, assigning its file offset.  The top two bits of the
    /// returned offset carry `ceil(disk_size / 4096)`.
    pub fn write_node(&mut self, pool: &mut StoragePool, node: &Node) -> Result<FileOffset, PoolError> {
        let size = node.disk_size() as u64;
        assert!(size as usize <= MAX_DISK_NODE_SIZE, "node exceeds the 3-page read contract");
        let pages = size.div_ceil(PAGE);
        loop {
            let Some(chunk) = self.chunk else {
                self.open_chunk(pool)?;
                continue;
            };
            // Pad to the next page boundary when the recorded page count
            // would not cover the node from the rounded-down read offset.
            let in_page = self.offset % PAGE;
            let pad = if in_page + size > pages * PAGE { PAGE - in_page } else { 0 };
            if self.offset + pad + size > pool.chunk_size() {
                self.close_chunk(pool);
                self.open_chunk(pool)?;
                continue;
            }
            if self.buf.is_none() {
                self.buf_base = self.offset;
                self.buf = Some(self.io.acquire_write_buf());
            }
            let buf = self.buf.as_mut().unwrap();
            if (buf.remaining() as u64) < pad + size {
                self.submit_buffer(pool);
                continue;
            }
            buf.push_zeroes(pad as usize);
            let at = buf.len;
            node.encode_into(&mut buf.as_mut_slice()[at..at + size as usize]);
            buf.len = at + size as usize;
            let node_offset = self.offset + pad;
            self.offset = node_offset + size;
            pool.note_node_written(chunk, node.version());
            crate::metrics::NODES_WRITTEN.with_label_values(&[self.metrics_label()]).inc();
            crate::metrics::BYTES_WRITTEN
                .with_label_values(&[self.metrics_label()])
                .inc_by(pad + size);
            return Ok(FileOffset::new(chunk, node_offset, pages as u8));
        }
    }

    /// Submits whatever the stream has buffered, padded to a page
    /// boundary, and returns the new durable frontier.  The sub-page tail
    /// is dead space; the next node starts page-aligned.
    pub fn flush(&mut self, pool: &mut StoragePool) -> (u32, u32) {
        if self.buf.is_some() {
            self.submit_buffer(pool);
        }
        self.frontier()
    }

    /// Flushes the buffer to the device at `buf_base`, rounded up to a
    /// whole number of pages, and advances the stream past the padding.
    fn submit_buffer(&mut self, pool: &StoragePool) {
        let Some(mut buf) = self.buf.take() else { return };
        if buf.len == 0 {
            self.io.release_write_buf(buf);
            return;
        }
        let chunk = self.chunk.expect("buffered bytes without a chunk");
        let submit_len = round_up_page(buf.len as u64);
        buf.push_zeroes((submit_len - buf.len as u64) as usize);
        debug_assert_eq!(self.buf_base % PAGE, 0);
        debug_assert!(self.buf_base + submit_len <= pool.chunk_size());
        let (device, device_offset) = pool.locate(chunk, self.buf_base);
        self.io.submit_write(device as u32, device_offset, buf, submit_len as usize);
        self.offset = self.buf_base + submit_len;
        self.buf_base = self.offset;
    }

    fn open_chunk(&mut self, pool: &mut StoragePool) -> Result<(), PoolError> {
        let chunk = pool.allocate(self.list)?;
        self.chunk = Some(chunk);
        // Skip the chunk header page.
        self.offset = PAGE;
        self.buf_base = self.offset;
        Ok(())
    }

    fn close_chunk(&mut self, pool: &mut StoragePool) {
        self.submit_buffer(pool);
        tracing::debug!(
            target: "store",
            chunk = self.chunk,
            list = self.metrics_label(),
            "chunk full, switching"
        );
        self.chunk = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::io::READ_BUFFER_SIZE;
    use crate::trie::nibbles::Nibbles;
    use std::os::fd::AsRawFd;

    fn setup(dir: &tempfile::TempDir) -> (StoragePool, AsyncIO) {
        let config = StoreConfig::test_config(dir.path().join("pool"));
        let pool = StoragePool::open(&config, true).unwrap();
        let fds: Vec<i32> = pool.devices().iter().map(|d| d.data_fd()).collect();
        let io = AsyncIO::new(32, None, 16, 4, &fds).unwrap();
        (pool, io)
    }

    fn leaf(value: &[u8], version: u64) -> Node {
        Node::new(
            0,
            Nibbles::from_nibbles(&[1, 2, 3]),
            Some(value.to_vec().into_boxed_slice()),
            Vec::new(),
            version,
        )
    }

    fn read_back(pool: &StoragePool, io: &AsyncIO, offset: FileOffset) -> Node {
        let aligned = offset.offset() / PAGE * PAGE;
        let len = (offset.pages() * DISK_PAGE_SIZE).min(READ_BUFFER_SIZE);
        let (device, device_offset) = pool.locate(offset.chunk(), aligned);
        let buf = io.block_on(io.read(device as u32, device_offset, len)).unwrap();
        let (node, _) = Node::decode(&buf[(offset.offset() - aligned) as usize..]).unwrap();
        node
    }

    #[test]
    fn nodes_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pool, io) = setup(&dir);
        let mut writer = NodeWriter::new(ChunkList::Fast, io.clone(), pool.fast_frontier());
        let offsets: Vec<FileOffset> = (0u8..50)
            .map(|i| writer.write_node(&mut pool, &leaf(&[i; 40], 1)).unwrap())
            .collect();
        writer.flush(&mut pool);
        io.wait_until_done();
        assert!(io.take_write_error().is_none());
        for (i, offset) in offsets.iter().enumerate() {
            let node = read_back(&pool, &io, *offset);
            assert_eq!(node.value().unwrap(), &[i as u8; 40]);
        }
    }

    #[test]
    fn offsets_never_underrun_recorded_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pool, io) = setup(&dir);
        let mut writer = NodeWriter::new(ChunkList::Fast, io.clone(), pool.fast_frontier());
        // Mixed sizes force page straddles and padding decisions.
        for i in 0..400u64 {
            let value = vec![0xabu8; 100 + (i as usize * 37) % 3000];
            let node = leaf(&value, 1);
            let size = node.disk_size() as u64;
            let offset = writer.write_node(&mut pool, &node).unwrap();
            let in_page = offset.offset() % PAGE;
            assert!(
                in_page + size <= offset.pages() as u64 * PAGE,
                "node at {offset:?} size {size} not covered by recorded pages"
            );
        }
        writer.flush(&mut pool);
        io.wait_until_done();
        assert!(io.take_write_error().is_none());
    }

    #[test]
    fn stream_spills_into_new_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pool, io) = setup(&dir);
        let mut writer = NodeWriter::new(ChunkList::Fast, io.clone(), pool.fast_frontier());
        let mut chunks = std::collections::BTreeSet::new();
        // Write well over one chunk's worth.
        let value = vec![0x5au8; 3000];
        let total = 2 * pool.chunk_size() / 3100;
        for _ in 0..total {
            let offset = writer.write_node(&mut pool, &leaf(&value, 1)).unwrap();
            chunks.insert(offset.chunk());
        }
        writer.flush(&mut pool);
        io.wait_until_done();
        assert!(chunks.len() >= 2);
        assert_eq!(pool.list_len(ChunkList::Fast), chunks.len());
        assert_eq!(pool.chunks_in(ChunkList::Fast), chunks.iter().copied().collect::<Vec<_>>());
    }

    #[test]
    fn flush_resume_continues_page_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pool, io) = setup(&dir);
        let first = {
            let mut writer = NodeWriter::new(ChunkList::Fast, io.clone(), pool.fast_frontier());
            let offset = writer.write_node(&mut pool, &leaf(b"first", 1)).unwrap();
            let frontier = writer.flush(&mut pool);
            io.wait_until_done();
            pool.advance_heads(frontier, (u32::MAX, 0), 1, 0).unwrap();
            offset
        };
        // A new writer resumes from the durable frontier.
        let mut writer = NodeWriter::new(ChunkList::Fast, io.clone(), pool.fast_frontier());
        let second = writer.write_node(&mut pool, &leaf(b"second", 2)).unwrap();
        writer.flush(&mut pool);
        io.wait_until_done();
        assert_eq!(second.chunk(), first.chunk());
        assert!(second.offset() > first.offset());
        assert_eq!(second.offset() % PAGE, 0);
        assert_eq!(read_back(&pool, &io, first).value().unwrap(), b"first");
        assert_eq!(read_back(&pool, &io, second).value().unwrap(), b"second");
    }

    #[test]
    fn version_range_tracked_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pool, io) = setup(&dir);
        let mut writer = NodeWriter::new(ChunkList::Fast, io.clone(), pool.fast_frontier());
        let offset = writer.write_node(&mut pool, &leaf(b"a", 5)).unwrap();
        writer.write_node(&mut pool, &leaf(b"b", 9)).unwrap();
        writer.flush(&mut pool);
        io.wait_until_done();
        let state = pool.chunk_state(offset.chunk());
        assert_eq!((state.min_version, state.max_version), (5, 9));
    }
}
