//! On-disk codecs for the pool metadata copies and per-chunk headers.
//!
//! Two redundant 4 KiB metadata copies live at the start of device 0.  A
//! writer alternates between them: the copy with the higher generation and
//! a matching CRC is authoritative.  Each chunk additionally starts with a
//! header page replicating its list state for scrubbing; the metadata
//! copies remain the source of truth.

use crate::mem::DISK_PAGE_SIZE;
use crate::pool::{ChunkList, ChunkState};

pub(crate) const META_MAGIC: u64 = 0x3154_5052_4d50_4254; // "TBPMRPT1"
pub(crate) const CHUNK_MAGIC: u32 = 0x4843_5254; // "TRCH"
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Fixed scalar prefix of a metadata copy, before the chunk table.
const META_HEADER_BYTES: usize = 88;
const META_CRC_BYTES: usize = 4;
const CHUNK_ENTRY_BYTES: usize = 8;

/// Upper bound on chunks representable in one 4 KiB metadata copy.
pub const MAX_CHUNKS: usize = (DISK_PAGE_SIZE - META_HEADER_BYTES - META_CRC_BYTES) / CHUNK_ENTRY_BYTES;

/// Scalar state persisted in each metadata copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MetaScalars {
    pub generation: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
    pub seq_counter: u64,
    pub latest_version: u64,
    pub min_valid_version: u64,
    pub history_length: u64,
    /// Durable append frontier of the fast writer: (chunk, offset).
    pub fast_frontier: (u32, u32),
    /// Durable append frontier of the slow writer: (chunk, offset).
    pub slow_frontier: (u32, u32),
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }
    fn u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }
    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }
    fn u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }
    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }
    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }
    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }
}

/// Serializes one metadata copy into a 4 KiB page.
pub(crate) fn encode_meta(scalars: &MetaScalars, chunks: &[ChunkState], page: &mut [u8]) {
    assert_eq!(page.len(), DISK_PAGE_SIZE);
    assert!(chunks.len() <= MAX_CHUNKS);
    assert_eq!(chunks.len(), scalars.chunk_count as usize);
    page.fill(0);
    let mut w = Writer { buf: page, pos: 0 };
    w.u64(META_MAGIC);
    w.u32(FORMAT_VERSION);
    w.u32(DISK_PAGE_SIZE as u32);
    w.u64(scalars.chunk_size);
    w.u32(scalars.chunk_count);
    w.u32(0);
    w.u64(scalars.generation);
    w.u64(scalars.seq_counter);
    w.u64(scalars.latest_version);
    w.u64(scalars.min_valid_version);
    w.u64(scalars.history_length);
    w.u32(scalars.fast_frontier.0);
    w.u32(scalars.fast_frontier.1);
    w.u32(scalars.slow_frontier.0);
    w.u32(scalars.slow_frontier.1);
    debug_assert_eq!(w.pos, META_HEADER_BYTES);
    for chunk in chunks {
        w.u8(chunk.list as u8);
        w.u8(chunk.generation);
        w.u8(chunk.pinned_from as u8);
        w.u8(0);
        w.u32(chunk.seq);
    }
    let crc_at = DISK_PAGE_SIZE - META_CRC_BYTES;
    let crc = crc32fast::hash(&w.buf[..crc_at]);
    w.buf[crc_at..].copy_from_slice(&crc.to_le_bytes());
}

/// Decodes one metadata copy.  Returns `None` when the magic, CRC, or page
/// size check fails; arbitration between the two copies is the caller's
/// business.
pub(crate) fn decode_meta(page: &[u8]) -> Option<(MetaScalars, Vec<ChunkState>)> {
    if page.len() != DISK_PAGE_SIZE {
        return None;
    }
    let crc_at = DISK_PAGE_SIZE - META_CRC_BYTES;
    let want = u32::from_le_bytes(page[crc_at..].try_into().unwrap());
    if crc32fast::hash(&page[..crc_at]) != want {
        return None;
    }
    let mut r = Reader { buf: page, pos: 0 };
    if r.u64() != META_MAGIC || r.u32() != FORMAT_VERSION || r.u32() != DISK_PAGE_SIZE as u32 {
        return None;
    }
    let chunk_size = r.u64();
    let chunk_count = r.u32();
    let _pad = r.u32();
    let scalars = MetaScalars {
        generation: r.u64(),
        seq_counter: r.u64(),
        latest_version: r.u64(),
        min_valid_version: r.u64(),
        history_length: r.u64(),
        fast_frontier: (r.u32(), r.u32()),
        slow_frontier: (r.u32(), r.u32()),
        chunk_size,
        chunk_count,
    };
    if chunk_count as usize > MAX_CHUNKS {
        return None;
    }
    debug_assert_eq!(r.pos, META_HEADER_BYTES);
    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for _ in 0..chunk_count {
        let list = ChunkList::from_u8(r.u8())?;
        let generation = r.u8();
        let pinned_from = ChunkList::from_u8(r.u8())?;
        let _pad = r.u8();
        let seq = r.u32();
        chunks.push(ChunkState {
            list,
            generation,
            pinned_from,
            seq,
            min_version: 0,
            max_version: 0,
        });
    }
    Some((scalars, chunks))
}

/// Per-chunk header page, written on allocation and refreshed with the
/// version range of nodes appended to the chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkHeader {
    pub list: ChunkList,
    pub generation: u8,
    pub seq: u32,
    pub prev: u32,
    pub next: u32,
    pub min_version: u64,
    pub max_version: u64,
}

pub(crate) fn encode_chunk_header(header: &ChunkHeader, page: &mut [u8]) {
    assert_eq!(page.len(), DISK_PAGE_SIZE);
    page.fill(0);
    let mut w = Writer { buf: page, pos: 0 };
    w.u32(CHUNK_MAGIC);
    w.u8(header.list as u8);
    w.u8(header.generation);
    w.u16(0);
    w.u32(header.seq);
    w.u32(header.prev);
    w.u32(header.next);
    w.u64(header.min_version);
    w.u64(header.max_version);
    let crc = crc32fast::hash(&w.buf[..36]);
    w.buf[36..40].copy_from_slice(&crc.to_le_bytes());
}

pub(crate) fn decode_chunk_header(page: &[u8]) -> Option<ChunkHeader> {
    if page.len() < 40 {
        return None;
    }
    let want = u32::from_le_bytes(page[36..40].try_into().unwrap());
    if crc32fast::hash(&page[..36]) != want {
        return None;
    }
    let mut r = Reader { buf: page, pos: 0 };
    if r.u32() != CHUNK_MAGIC {
        return None;
    }
    let list = ChunkList::from_u8(r.u8())?;
    let generation = r.u8();
    let _pad = r.u16();
    Some(ChunkHeader {
        list,
        generation,
        seq: r.u32(),
        prev: r.u32(),
        next: r.u32(),
        min_version: r.u64(),
        max_version: r.u64(),
    })
}
