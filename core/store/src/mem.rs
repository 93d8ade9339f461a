use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::ptr::NonNull;

/// Disk page size.  The on-disk format is defined in terms of 4 KiB pages
/// and the code statically rejects anything else.
pub const DISK_PAGE_SIZE: usize = 4096;

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

fn round_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// A 2 MiB-huge-page backed anonymous mapping.
///
/// When the kernel has no huge pages to hand out (typical for CI), falls
/// back to reserving a double-sized anonymous mapping, carving out a
/// huge-page-aligned window and committing that, with `MADV_HUGEPAGE` as a
/// hint.  The memory is mlocked best-effort and unmapped on drop.
pub struct HugeMem {
    data: NonNull<u8>,
    size: usize,
    locked: bool,
}

// The mapping is plain anonymous memory; nothing thread-affine about it.
unsafe impl Send for HugeMem {}
unsafe impl Sync for HugeMem {}

impl HugeMem {
    pub fn new(size: usize) -> io::Result<Self> {
        assert!(size > 0);
        let size = round_up(size, HUGE_PAGE_SIZE);
        let data = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            );
            if ptr != libc::MAP_FAILED {
                ptr.cast::<u8>()
            } else {
                Self::map_aligned_fallback(size)?
            }
        };
        let locked = unsafe { libc::mlock(data.cast(), size) } == 0;
        if !locked {
            tracing::debug!(target: "store", size, "mlock failed, running with swappable buffers");
        }
        Ok(Self { data: NonNull::new(data).expect("mmap returned null"), size, locked })
    }

    /// Reserve twice the requested amount with PROT_NONE, trim to a
    /// huge-page aligned window, then commit the window.
    unsafe fn map_aligned_fallback(size: usize) -> io::Result<*mut u8> {
        let reserve = round_up(size * 2, HUGE_PAGE_SIZE);
        let reservation = libc::mmap(
            std::ptr::null_mut(),
            reserve,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if reservation == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = reservation.cast::<u8>();
        let aligned = round_up(base as usize, HUGE_PAGE_SIZE) as *mut u8;
        let front = aligned as usize - base as usize;
        if front > 0 {
            libc::munmap(base.cast(), front);
        }
        let back = reserve - front - size;
        if back > 0 {
            libc::munmap(aligned.add(size).cast(), back);
        }
        let committed = libc::mmap(
            aligned.cast(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );
        if committed == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            libc::munmap(aligned.cast(), size);
            return Err(err);
        }
        libc::madvise(committed, size, libc::MADV_HUGEPAGE);
        Ok(committed.cast())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for HugeMem {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                libc::munlock(self.data.as_ptr().cast(), self.size);
            }
            libc::munmap(self.data.as_ptr().cast(), self.size);
        }
    }
}

/// Hands out fixed-size buffer indices carved from a [`HugeMem`].
///
/// Acquire/release is a stack.  Running dry on the hot path means the
/// caller failed to pace its work, which is a programming error, so
/// [`BufferPool::acquire`] panics rather than returning an option.
pub struct BufferPool {
    mem: HugeMem,
    buffer_size: usize,
    count: usize,
    free: Vec<u16>,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> io::Result<Self> {
        assert!(count > 0 && count <= u16::MAX as usize);
        assert_eq!(buffer_size % DISK_PAGE_SIZE, 0);
        let mem = HugeMem::new(count * buffer_size)?;
        let free = (0..count as u16).rev().collect();
        Ok(Self { mem, buffer_size, count, free })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pointer to buffer `index`.  Always 4 KiB aligned.
    pub fn buffer_ptr(&self, index: u16) -> *mut u8 {
        assert!((index as usize) < self.count);
        unsafe { self.mem.as_ptr().add(index as usize * self.buffer_size) }
    }

    pub fn acquire(&mut self) -> u16 {
        self.free.pop().unwrap_or_else(|| {
            panic!("buffer pool exhausted ({} buffers in flight)", self.count)
        })
    }

    pub fn release(&mut self, index: u16) {
        debug_assert!((index as usize) < self.count);
        debug_assert!(!self.free.contains(&index));
        self.free.push(index);
    }

    /// iovec array for io_uring buffer registration.
    pub fn iovecs(&self) -> Vec<libc::iovec> {
        (0..self.count as u16)
            .map(|i| libc::iovec {
                iov_base: self.buffer_ptr(i).cast(),
                iov_len: self.buffer_size,
            })
            .collect()
    }
}

/// A 4 KiB-aligned heap buffer for blocking O_DIRECT reads and writes
/// (metadata pages, chunk headers) outside the reactor.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Self {
        let len = round_up(len, DISK_PAGE_SIZE);
        let layout = Layout::from_size_align(len, DISK_PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        Self { ptr: NonNull::new(ptr).expect("allocation failed"), len }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, DISK_PAGE_SIZE).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_mem_rounds_up_and_is_writable() {
        let mem = HugeMem::new(1).unwrap();
        assert_eq!(mem.len(), HUGE_PAGE_SIZE);
        unsafe {
            mem.as_ptr().write(0xab);
            mem.as_ptr().add(mem.len() - 1).write(0xcd);
            assert_eq!(mem.as_ptr().read(), 0xab);
        }
    }

    #[test]
    fn buffer_pool_acquire_release() {
        let mut pool = BufferPool::new(4, DISK_PAGE_SIZE).unwrap();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(pool.buffer_ptr(a), pool.buffer_ptr(b));
        assert_eq!(pool.free_count(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn buffer_pointers_are_page_aligned() {
        let pool = BufferPool::new(3, 4 * DISK_PAGE_SIZE).unwrap();
        for i in 0..3 {
            assert_eq!(pool.buffer_ptr(i) as usize % DISK_PAGE_SIZE, 0);
        }
    }

    #[test]
    #[should_panic(expected = "buffer pool exhausted")]
    fn buffer_pool_exhaustion_is_fatal() {
        let mut pool = BufferPool::new(2, DISK_PAGE_SIZE).unwrap();
        let _a = pool.acquire();
        let _b = pool.acquire();
        let _c = pool.acquire();
    }

    #[test]
    fn aligned_buf_alignment() {
        let buf = AlignedBuf::zeroed(100);
        assert_eq!(buf.as_slice().len(), DISK_PAGE_SIZE);
        assert_eq!(buf.as_slice().as_ptr() as usize % DISK_PAGE_SIZE, 0);
    }
}
