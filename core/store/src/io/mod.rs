//! Single-threaded cooperative reactor over io_uring.
//!
//! One instance per kernel thread; the type is deliberately `!Send`.  Reads
//! and writes go through buffers registered with the kernel up front
//! (`ReadFixed`/`WriteFixed`), so nothing is pinned per operation.  Reads
//! are futures resolved by [`AsyncIO::block_on`]; writes are
//! fire-and-forget with completion accounting, and their errors surface at
//! the next flush point.  Exhausting either buffer pool means the caller
//! failed to pace its work and panics.

use crate::mem::{BufferPool, DISK_PAGE_SIZE};
use io_uring::{opcode, types, IoUring};
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Read buffers hold up to the 3-page worst case node read, rounded to a
/// power of two.
pub const READ_BUFFER_SIZE: usize = 4 * DISK_PAGE_SIZE;
/// Write buffers match the append granularity of the node writers.
pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

const SQPOLL_IDLE_MS: u32 = 2000;

enum Op {
    Vacant,
    Read { buf: u16, dev: u32, offset: u64, len: u32, retried: bool, abandoned: bool, done: Option<i32> },
    Write { buf: u16, dev: u32, offset: u64, len: u32, retried: bool },
}

struct Inner {
    // Declared first: dropping the ring closes the fd and releases the
    // kernel's buffer registrations before the pools unmap.
    ring: IoUring,
    read_pool: BufferPool,
    write_pool: BufferPool,
    ops: Vec<Op>,
    free_ops: Vec<usize>,
    inflight: usize,
    /// Read futures currently parked because the read pool ran dry.
    buffer_waiters: usize,
    write_error: Option<io::Error>,
}

/// Cloneable handle to the reactor owned by this thread.
#[derive(Clone)]
pub struct AsyncIO {
    inner: Rc<RefCell<Inner>>,
}

impl AsyncIO {
    /// Builds the ring, registers `files` (indexed by device number) and
    /// the read/write buffer pools.
    pub fn new(
        entries: u32,
        sq_thread_cpu: Option<u32>,
        rd_buffers: usize,
        wr_buffers: usize,
        files: &[i32],
    ) -> io::Result<Self> {
        let mut builder = IoUring::builder();
        if let Some(cpu) = sq_thread_cpu {
            builder.setup_sqpoll(SQPOLL_IDLE_MS);
            builder.setup_sqpoll_cpu(cpu);
        }
        let ring = builder.build(entries)?;
        let read_pool = BufferPool::new(rd_buffers, READ_BUFFER_SIZE)?;
        let write_pool = BufferPool::new(wr_buffers, WRITE_BUFFER_SIZE)?;
        ring.submitter().register_files(files)?;
        let mut iovecs = read_pool.iovecs();
        iovecs.extend(write_pool.iovecs());
        unsafe { ring.submitter().register_buffers(&iovecs)? };
        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                ring,
                read_pool,
                write_pool,
                ops: Vec::new(),
                free_ops: Vec::new(),
                inflight: 0,
                buffer_waiters: 0,
                write_error: None,
            })),
        })
    }

    /// Reads `len` bytes at `offset` on device `dev`.  Both must be 4 KiB
    /// aligned and `len` must fit a read buffer.
    pub fn read(&self, dev: u32, offset: u64, len: usize) -> ReadFuture {
        assert_eq!(offset % DISK_PAGE_SIZE as u64, 0);
        assert_eq!(len % DISK_PAGE_SIZE, 0);
        assert!(len > 0 && len <= READ_BUFFER_SIZE);
        crate::metrics::READS_ISSUED.inc();
        ReadFuture { io: self.clone(), op: None, waiting: false, dev, offset, len: len as u32 }
    }

    /// Takes a 64 KiB write buffer out of the pool for the caller to fill,
    /// draining completions of earlier writes when the pool has run dry.
    /// Running dry with nothing in flight is a pacing bug and fatal.
    pub fn acquire_write_buf(&self) -> WriteBuf {
        loop {
            let mut inner = self.inner.borrow_mut();
            if inner.write_pool.free_count() > 0 {
                let buf = inner.write_pool.acquire();
                return WriteBuf { buf, ptr: inner.write_pool.buffer_ptr(buf), len: 0 };
            }
            assert!(inner.inflight > 0, "write buffer pool exhausted with no I/O in flight");
            inner.wait_dispatch();
        }
    }

    /// Returns an unused write buffer to the pool.
    pub fn release_write_buf(&self, buf: WriteBuf) {
        self.inner.borrow_mut().write_pool.release(buf.buf);
    }

    /// Submits the first `len` bytes of `buf` at `offset` on device `dev`
    /// and reaps any completions that are already ready.  The buffer
    /// returns to the pool when the write completes; failures surface via
    /// [`AsyncIO::take_write_error`].
    pub fn submit_write(&self, dev: u32, offset: u64, buf: WriteBuf, len: usize) {
        assert_eq!(offset % DISK_PAGE_SIZE as u64, 0);
        assert_eq!(len % DISK_PAGE_SIZE, 0);
        assert!(len > 0 && len <= WRITE_BUFFER_SIZE);
        let mut inner = self.inner.borrow_mut();
        let op = inner.alloc_op(Op::Write {
            buf: buf.buf,
            dev,
            offset,
            len: len as u32,
            retried: false,
        });
        inner.submit_op(op);
        inner.dispatch_ready();
    }

    /// Drains at most `max_events` ready completions without blocking.
    pub fn poll_nonblocking(&self, max_events: usize) -> usize {
        let mut inner = self.inner.borrow_mut();
        let _ = inner.ring.submit();
        inner.dispatch_up_to(max_events)
    }

    /// Runs the loop until every in-flight operation has resolved.
    pub fn wait_until_done(&self) {
        loop {
            let mut inner = self.inner.borrow_mut();
            if inner.inflight == 0 {
                return;
            }
            inner.wait_dispatch();
        }
    }

    /// Drives `fut` to completion, dispatching I/O completions whenever it
    /// is pending.  Panics if the future suspends with nothing in flight
    /// and nobody waiting on a read buffer.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        let mut fut = std::pin::pin!(fut);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut idle_spins = 0u32;
        loop {
            if let Poll::Ready(value) = fut.as_mut().poll(&mut cx) {
                return value;
            }
            let mut inner = self.inner.borrow_mut();
            if inner.inflight > 0 {
                idle_spins = 0;
                inner.wait_dispatch();
            } else if inner.buffer_waiters > 0 {
                // Buffers freed by this poll round unblock the waiters on
                // the next one; a bounded number of rounds must make
                // progress.
                idle_spins += 1;
                assert!(idle_spins < 10_000, "read buffer waiters are not making progress");
            } else {
                panic!("task suspended with no I/O in flight");
            }
        }
    }

    /// First write error observed since the last call, if any.
    pub fn take_write_error(&self) -> Option<io::Error> {
        self.inner.borrow_mut().write_error.take()
    }

    pub fn inflight(&self) -> usize {
        self.inner.borrow().inflight
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        while self.inflight > 0 {
            self.wait_dispatch();
        }
    }
}

impl Inner {
    fn alloc_op(&mut self, op: Op) -> usize {
        match self.free_ops.pop() {
            Some(id) => {
                self.ops[id] = op;
                id
            }
            None => {
                self.ops.push(op);
                self.ops.len() - 1
            }
        }
    }

    fn free_op(&mut self, id: usize) {
        self.ops[id] = Op::Vacant;
        self.free_ops.push(id);
    }

    /// Registered-buffer index of a read or write pool buffer.
    fn registered_read_index(&self, buf: u16) -> u16 {
        buf
    }

    fn registered_write_index(&self, buf: u16) -> u16 {
        self.read_pool.count() as u16 + buf
    }

    fn submit_op(&mut self, id: usize) {
        let entry = match &self.ops[id] {
            Op::Read { buf, dev, offset, len, .. } => opcode::ReadFixed::new(
                types::Fixed(*dev),
                self.read_pool.buffer_ptr(*buf),
                *len,
                self.registered_read_index(*buf),
            )
            .offset(*offset)
            .build()
            .user_data(id as u64),
            Op::Write { buf, dev, offset, len, .. } => opcode::WriteFixed::new(
                types::Fixed(*dev),
                self.write_pool.buffer_ptr(*buf).cast_const(),
                *len,
                self.registered_write_index(*buf),
            )
            .offset(*offset)
            .build()
            .user_data(id as u64),
            Op::Vacant => unreachable!("submitting vacant op"),
        };
        loop {
            let pushed = unsafe { self.ring.submission().push(&entry) };
            if pushed.is_ok() {
                break;
            }
            // Queue full: flush it to the kernel and retry.
            self.ring.submit().expect("io_uring submit");
        }
        self.ring.submit().expect("io_uring submit");
        self.inflight += 1;
    }

    fn wait_dispatch(&mut self) {
        self.ring.submit_and_wait(1).expect("io_uring submit_and_wait");
        self.dispatch_ready();
    }

    fn dispatch_ready(&mut self) -> usize {
        self.dispatch_up_to(usize::MAX)
    }

    fn dispatch_up_to(&mut self, max_events: usize) -> usize {
        let mut handled = 0;
        while handled < max_events {
            let entry = self.ring.completion().next();
            let Some(entry) = entry else { break };
            self.complete(entry.user_data() as usize, entry.result());
            handled += 1;
        }
        handled
    }

    fn complete(&mut self, id: usize, result: i32) {
        self.inflight -= 1;
        enum Action {
            Resubmit,
            ReadDone,
            ReadAbandoned(u16),
            WriteDone { buf: u16, len: u32, offset: u64, dev: u32 },
        }
        let action = match &mut self.ops[id] {
            Op::Read { retried, abandoned, done, buf, .. } => {
                if result == -libc::EAGAIN && !*retried {
                    *retried = true;
                    Action::Resubmit
                } else if *abandoned {
                    Action::ReadAbandoned(*buf)
                } else {
                    *done = Some(result);
                    Action::ReadDone
                }
            }
            Op::Write { retried, buf, len, offset, dev } => {
                if result == -libc::EAGAIN && !*retried {
                    *retried = true;
                    Action::Resubmit
                } else {
                    Action::WriteDone { buf: *buf, len: *len, offset: *offset, dev: *dev }
                }
            }
            Op::Vacant => unreachable!("completion for vacant op"),
        };
        match action {
            Action::Resubmit => self.submit_op(id),
            Action::ReadDone => {}
            Action::ReadAbandoned(buf) => {
                self.read_pool.release(buf);
                self.free_op(id);
            }
            Action::WriteDone { buf, len, offset, dev } => {
                if result < 0 {
                    let err = io::Error::from_raw_os_error(-result);
                    tracing::error!(target: "store", %err, dev, offset, len, "write failed");
                    self.write_error.get_or_insert(err);
                } else if result as u32 != len {
                    tracing::error!(target: "store", dev, offset, len, wrote = result, "short write");
                    self.write_error.get_or_insert(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write to storage pool",
                    ));
                }
                self.write_pool.release(buf);
                self.free_op(id);
            }
        }
    }
}

/// A 64 KiB registered write buffer checked out of the pool.
pub struct WriteBuf {
    buf: u16,
    ptr: *mut u8,
    /// Bytes filled so far; managed by the writer.
    pub len: usize,
}

impl WriteBuf {
    pub fn capacity(&self) -> usize {
        WRITE_BUFFER_SIZE
    }

    pub fn remaining(&self) -> usize {
        WRITE_BUFFER_SIZE - self.len
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, WRITE_BUFFER_SIZE) }
    }

    /// Appends `data`, which must fit.
    pub fn push(&mut self, data: &[u8]) {
        let at = self.len;
        self.as_mut_slice()[at..at + data.len()].copy_from_slice(data);
        self.len = at + data.len();
    }

    /// Appends `count` zero bytes (padding).
    pub fn push_zeroes(&mut self, count: usize) {
        let at = self.len;
        self.as_mut_slice()[at..at + count].fill(0);
        self.len = at + count;
    }
}

/// Resolves to the bytes read; releases its buffer back to the pool on
/// drop.
pub struct ReadFuture {
    io: AsyncIO,
    op: Option<usize>,
    waiting: bool,
    dev: u32,
    offset: u64,
    len: u32,
}

impl Future for ReadFuture {
    type Output = io::Result<ReadBuffer>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let io = this.io.clone();
        let mut inner = io.inner.borrow_mut();
        let op = match this.op {
            Some(op) => op,
            None => {
                if inner.read_pool.free_count() == 0 {
                    // Park until a completed read hands its buffer back;
                    // issuing the read would otherwise exhaust the pool.
                    if !this.waiting {
                        this.waiting = true;
                        inner.buffer_waiters += 1;
                    }
                    return Poll::Pending;
                }
                if this.waiting {
                    this.waiting = false;
                    inner.buffer_waiters -= 1;
                }
                let buf = inner.read_pool.acquire();
                let op = inner.alloc_op(Op::Read {
                    buf,
                    dev: this.dev,
                    offset: this.offset,
                    len: this.len,
                    retried: false,
                    abandoned: false,
                    done: None,
                });
                inner.submit_op(op);
                this.op = Some(op);
                op
            }
        };
        let (done, buf) = match &inner.ops[op] {
            Op::Read { done, buf, .. } => (*done, *buf),
            _ => unreachable!("read op slot changed type"),
        };
        match done {
            None => Poll::Pending,
            Some(result) => {
                let ptr = inner.read_pool.buffer_ptr(buf);
                inner.free_op(op);
                this.op = None;
                if result < 0 {
                    inner.read_pool.release(buf);
                    return Poll::Ready(Err(io::Error::from_raw_os_error(-result)));
                }
                if result as u32 != this.len {
                    inner.read_pool.release(buf);
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read from storage pool",
                    )));
                }
                Poll::Ready(Ok(ReadBuffer {
                    io: this.io.clone(),
                    buf,
                    ptr,
                    len: this.len as usize,
                }))
            }
        }
    }
}

impl Drop for ReadFuture {
    fn drop(&mut self) {
        if self.waiting {
            self.io.inner.borrow_mut().buffer_waiters -= 1;
        }
        if let Some(op) = self.op {
            let mut inner = self.io.inner.borrow_mut();
            let release = match &mut inner.ops[op] {
                Op::Read { done: Some(_), buf, .. } => Some(*buf),
                Op::Read { abandoned, .. } => {
                    *abandoned = true;
                    None
                }
                _ => unreachable!("read op slot changed type"),
            };
            if let Some(buf) = release {
                inner.read_pool.release(buf);
                inner.free_op(op);
            }
        }
    }
}

/// Borrowed view of a completed read; hands its registered buffer back on
/// drop.
pub struct ReadBuffer {
    io: AsyncIO,
    buf: u16,
    ptr: *mut u8,
    len: usize,
}

impl std::ops::Deref for ReadBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ReadBuffer {
    fn drop(&mut self) {
        self.io.inner.borrow_mut().read_pool.release(self.buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn test_io(file: &std::fs::File) -> AsyncIO {
        AsyncIO::new(8, None, 4, 2, &[file.as_raw_fd()]).unwrap()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(1 << 20).unwrap();
        let io = test_io(&file);

        let mut buf = io.acquire_write_buf();
        for i in 0..2 * DISK_PAGE_SIZE {
            buf.push(&[(i % 251) as u8]);
        }
        io.submit_write(0, 4096, buf, 2 * DISK_PAGE_SIZE);
        io.wait_until_done();
        assert!(io.take_write_error().is_none());

        let got = io.block_on(io.read(0, 4096, 2 * DISK_PAGE_SIZE)).unwrap();
        assert_eq!(got.len(), 2 * DISK_PAGE_SIZE);
        assert!(got.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    #[test]
    fn parallel_reads_resolve_in_one_block_on() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(1 << 20).unwrap();
        let io = test_io(&file);

        for page in 0..3u8 {
            let mut buf = io.acquire_write_buf();
            buf.push_zeroes(DISK_PAGE_SIZE);
            buf.as_mut_slice()[0] = page + 1;
            io.submit_write(0, page as u64 * 4096, buf, DISK_PAGE_SIZE);
        }
        io.wait_until_done();

        let reads = (0..3u8).map(|page| io.read(0, page as u64 * 4096, DISK_PAGE_SIZE));
        let results = io.block_on(futures::future::join_all(reads));
        for (page, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap()[0], page as u8 + 1);
        }
    }

    #[test]
    fn read_buffers_return_to_pool() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(1 << 20).unwrap();
        let io = test_io(&file);
        for _ in 0..16 {
            // More iterations than buffers: fails unless buffers recycle.
            let got = io.block_on(io.read(0, 0, DISK_PAGE_SIZE)).unwrap();
            assert_eq!(got.len(), DISK_PAGE_SIZE);
        }
    }

    #[test]
    fn write_error_is_reported() {
        // Writing through a read-only fd fails at completion time.
        let ro = std::fs::File::open("/dev/null").unwrap();
        let io = AsyncIO::new(8, None, 2, 2, &[ro.as_raw_fd()]).unwrap();
        let mut buf = io.acquire_write_buf();
        buf.push_zeroes(DISK_PAGE_SIZE);
        io.submit_write(0, 0, buf, DISK_PAGE_SIZE);
        io.wait_until_done();
        assert!(io.take_write_error().is_some());
    }
}
