//! The bump-pointer pool that free-list refills are cut from.

use super::*;
use core::ptr;

/// Bookkeeping written at the start of every chunk obtained from the inner
/// allocator, so that the chunks can be returned when the allocator is
/// dropped.
#[repr(C)]
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    /// The size of the whole chunk, header included.
    size: usize,
}

/// Space reserved for the `ChunkHeader`, keeping the pool granule-aligned.
const CHUNK_HEADER_SIZE: usize = round_up(core::mem::size_of::<ChunkHeader>());

const CHUNK_ALIGN: usize = if core::mem::align_of::<ChunkHeader>() > GRANULE {
    core::mem::align_of::<ChunkHeader>()
} else {
    GRANULE
};

/// A contiguous range of unallocated bytes, `[start_free, end_free)`.
///
/// Both cursors are null when the pool is empty, which is its initial state
/// and also the state after the pool has been exhausted.
pub(super) struct Pool {
    start_free: *mut u8,
    end_free: *mut u8,

    /// The total number of pool bytes ever obtained from the inner allocator.
    heap_size: usize,

    /// Every chunk ever obtained from the inner allocator, newest first.
    chunks: Option<NonNull<ChunkHeader>>,
}

impl Pool {
    pub(super) const fn new() -> Self {
        Pool {
            start_free: ptr::null_mut(),
            end_free: ptr::null_mut(),
            heap_size: 0,
            chunks: None,
        }
    }

    /// The number of bytes left in the pool.
    #[inline]
    pub(super) fn remaining(&self) -> usize {
        self.end_free as usize - self.start_free as usize
    }

    #[inline]
    pub(super) fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Cut `bytes` bytes off the front of the pool.
    ///
    /// The caller must have checked that at least `bytes` bytes remain.
    #[inline]
    pub(super) fn bump(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert_ne!(bytes, 0);
        debug_assert!(bytes <= self.remaining());
        let start = self.start_free;
        // Safety: `start..start + bytes` is within the pool, which is within
        // a single chunk.
        self.start_free = unsafe { start.add(bytes) };
        // Safety: a pool with a nonzero remainder has non-null cursors.
        unsafe { NonNull::new_unchecked(start) }
    }

    /// Take whatever is left in the pool, leaving it empty.
    pub(super) fn take_leftover(&mut self) -> Option<(NonNull<u8>, usize)> {
        let len = self.remaining();
        let start = NonNull::new(self.start_free)?;
        self.start_free = self.end_free;
        if len == 0 {
            None
        } else {
            Some((start, len))
        }
    }

    /// Make `[start, start + len)` the pool, forgetting the current one.
    ///
    /// ### Safety
    ///
    /// The range must be unused memory inside one of this pool's chunks.
    pub(super) unsafe fn install(&mut self, start: NonNull<u8>, len: usize) {
        debug_assert_eq!(self.remaining(), 0, "installing over a non-empty pool");
        self.start_free = start.as_ptr();
        self.end_free = start.as_ptr().add(len);
    }

    /// Mark the pool as exhausted.
    pub(super) fn exhaust(&mut self) {
        self.start_free = ptr::null_mut();
        self.end_free = ptr::null_mut();
    }

    /// Get a fresh chunk of at least `bytes` usable bytes from `inner` and
    /// make it the pool.
    ///
    /// The current pool must already be empty. On failure the pool is left
    /// untouched.
    pub(super) fn grow<A>(&mut self, inner: &A, bytes: usize) -> Result<(), AllocError>
    where
        A: Allocator,
    {
        let size = bytes.checked_add(CHUNK_HEADER_SIZE).ok_or(AllocError)?;
        let layout = Layout::from_size_align(size, CHUNK_ALIGN).map_err(|_| AllocError)?;
        let chunk = inner.allocate(layout)?.cast::<u8>();

        let header = chunk.cast::<ChunkHeader>();
        // Safety: the chunk is freshly allocated, large enough for the header,
        // and aligned for it.
        unsafe {
            header.as_ptr().write(ChunkHeader {
                next: self.chunks,
                size,
            });
        }
        self.chunks = Some(header);
        self.heap_size += bytes;

        // Safety: everything after the header is unused and inside the chunk.
        unsafe { self.install(chunk.add(CHUNK_HEADER_SIZE), bytes) };
        Ok(())
    }

    /// Return every chunk to `inner` and reset the pool.
    ///
    /// ### Safety
    ///
    /// Every chunk must have been allocated by `inner`, and nothing may use
    /// memory from any of them afterwards. That includes all blocks on the
    /// free lists.
    pub(super) unsafe fn release_chunks<A>(&mut self, inner: &A)
    where
        A: Allocator,
    {
        let mut released = 0;
        while let Some(header) = self.chunks {
            let ChunkHeader { next, size } = header.as_ptr().read();
            self.chunks = next;
            // Safety: this is exactly the layout `grow` allocated with.
            let layout = Layout::from_size_align_unchecked(size, CHUNK_ALIGN);
            inner.deallocate(header.cast(), layout);
            released += 1;
        }
        self.exhaust();
        log::debug!("returned {released} pool chunks to the inner allocator");
    }
}
