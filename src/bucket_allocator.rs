//! The bucket allocator.
//!
//! Small requests (up to [`MAX_SMALL_BYTES`] bytes) are rounded up to a
//! multiple of [`GRANULE`] and served from a fixed array of intrusive free
//! lists, one per rounded size ("size class"). Popping from and pushing onto a
//! free list is O(1), and blocks are reused in LIFO order.
//!
//! When a size class's free list is empty, it is refilled with a batch of
//! [`REFILL_BATCH`] blocks cut from a bump-pointer pool. When the pool cannot
//! supply even a single block, it grows:
//!
//! * Whatever is left in the old pool is pushed onto the free list matching
//!   its size, so no bytes are lost.
//!
//! * A new chunk of `2 * batch bytes + heap_size / 16` (rounded to the
//!   granule) is requested from the inner allocator. The second term makes
//!   growth accelerate as the allocator uses more memory overall.
//!
//! * If the inner allocator fails, the pool instead borrows a single free
//!   block from the same or the next larger non-empty size class. Only when
//!   there is no such block does the allocation fail.
//!
//! Pool memory is never handed back to the inner allocator while the
//! allocator is alive. Requests larger than [`MAX_SMALL_BYTES`] bypass all of
//! this and go straight to the inner allocator.
//!
//! There is no per-block header: deallocation must be given the same byte
//! count that allocation was, otherwise the block lands in the wrong free
//! list. The `size_check` cargo feature catches such mistakes at the cost of
//! a bookkeeping node per live small block.

use super::*;
use free_list::FreeList;
use mutex::Mutex;
use pool::Pool;

mod free_list;
mod mutex;
mod pool;
mod size_class;

pub use mutex::{Lock, SingleThreadedLock};
pub use size_class::{
    class_index, class_size, round_up, GRANULE, MAX_SMALL_BYTES, NUM_SIZE_CLASSES, REFILL_BATCH,
};

#[cfg(feature = "size_check")]
use size_check::{LiveBlock, LiveSet};

/// A size-segregated allocator layered on top of an inner allocator `A`.
///
/// All mutable state lives inside the instance; nothing is global. The state
/// is guarded by the `L` lock, which is usually a [`SingleThreadedLock`]. See
/// the [`Lock`] trait for using the allocator from multiple threads.
///
/// Besides the byte-oriented [`allocate_bytes`](Self::allocate_bytes) family,
/// `BucketAllocator` implements [`Allocator`], so it can back
/// allocator-aware collections directly.
pub struct BucketAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// The underlying allocator, used for large requests and pool growth.
    inner: A,

    /// The free lists and the pool.
    state: Mutex<State, L>,
}

struct State {
    /// One free list per size class.
    free_lists: [FreeList; NUM_SIZE_CLASSES],

    /// Where free-list refills come from.
    pool: Pool,

    /// The size class of every live small block we know about.
    #[cfg(feature = "size_check")]
    live_set: LiveSet,
}

// Safety: the state exclusively owns the pool chunks and all free blocks; the
// raw pointers into them are never shared outside of the state.
unsafe impl Send for State {}

/// A snapshot of a [`BucketAllocator`]'s internal state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// The total number of pool bytes ever obtained from the inner allocator.
    pub heap_size: usize,

    /// The number of unallocated bytes left in the pool.
    pub pool_bytes: usize,

    /// The number of blocks on each size class's free list.
    pub free_blocks: [usize; NUM_SIZE_CLASSES],
}

impl<A, L> BucketAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create a new `BucketAllocator` that wraps the given `inner` allocator.
    ///
    /// Nothing is allocated until the first request.
    #[inline]
    pub const fn new(inner: A, lock: L) -> Self {
        BucketAllocator {
            inner,
            state: Mutex::new(State::new(), lock),
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Get an exclusive reference to the inner allocator.
    #[inline]
    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.inner
    }

    /// The total number of pool bytes ever obtained from the inner allocator.
    ///
    /// This never decreases.
    pub fn heap_size(&self) -> usize {
        self.state.lock().pool.heap_size()
    }

    /// Take a snapshot of the free lists and the pool.
    ///
    /// This walks every free list, so it is not O(1).
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut free_blocks = [0; NUM_SIZE_CLASSES];
        for (count, free_list) in free_blocks.iter_mut().zip(&state.free_lists) {
            *count = free_list.len();
        }
        PoolStats {
            heap_size: state.pool.heap_size(),
            pool_bytes: state.pool.remaining(),
            free_blocks,
        }
    }

    /// Allocate `bytes` bytes aligned to [`GRANULE`].
    ///
    /// The memory is not initialized; recycled blocks keep whatever their
    /// previous owner left in them. A zero-byte request is served as a
    /// one-granule request.
    ///
    /// The block must eventually be given back with
    /// [`deallocate_bytes`](Self::deallocate_bytes) using the same `bytes`.
    pub fn allocate_bytes(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        match class_index(bytes) {
            Some(index) => self.allocate_small(index),
            None => {
                let layout = Layout::from_size_align(bytes, GRANULE).map_err(|_| AllocError)?;
                Ok(self.inner.allocate(layout)?.cast())
            }
        }
    }

    /// Deallocate a block obtained from
    /// [`allocate_bytes`](Self::allocate_bytes) or
    /// [`reallocate_bytes`](Self::reallocate_bytes).
    ///
    /// ### Safety
    ///
    /// * `ptr` must be currently allocated by this allocator through the byte
    ///   interface.
    ///
    /// * `bytes` must be the byte count the block was allocated with, or at
    ///   least one that rounds to the same size class. Passing anything else
    ///   corrupts a different size class's free list (or, for large blocks,
    ///   violates the inner allocator's contract).
    pub unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, bytes: usize) {
        match class_index(bytes) {
            Some(index) => self.deallocate_small(ptr, index),
            None => {
                #[cfg(feature = "size_check")]
                self.check_not_small(ptr, bytes);
                let layout = Layout::from_size_align_unchecked(bytes, GRANULE);
                self.inner.deallocate(ptr, layout);
            }
        }
    }

    /// Deallocate `ptr` as a block of `old_bytes` bytes, then allocate a
    /// block of `new_bytes` bytes.
    ///
    /// **The contents of the old block are not copied.** Even when both sizes
    /// fall into the same size class and the very same block comes back, its
    /// first word will have been overwritten. Callers that need their data
    /// must copy it out first, or use [`Allocator::grow`] and
    /// [`Allocator::shrink`], which preserve contents.
    ///
    /// ### Safety
    ///
    /// Same as [`deallocate_bytes`](Self::deallocate_bytes) for `ptr` and
    /// `old_bytes`. The old block is deallocated even if the new allocation
    /// fails.
    pub unsafe fn reallocate_bytes(
        &self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.deallocate_bytes(ptr, old_bytes);
        self.allocate_bytes(new_bytes)
    }

    fn allocate_small(&self, index: usize) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        let block = match state.free_lists[index].pop() {
            Some(block) => block,
            None => state.refill(&self.inner, class_size(index))?,
        };

        debug_assert_eq!(block.as_ptr() as usize % GRANULE, 0);

        #[cfg(feature = "size_check")]
        self.track(&mut state, block, index);

        Ok(block)
    }

    unsafe fn deallocate_small(&self, ptr: NonNull<u8>, index: usize) {
        debug_assert_eq!(
            ptr.as_ptr() as usize % GRANULE,
            0,
            "{ptr:p} is not a block from a bucket allocator"
        );

        let mut state = self.state.lock();

        #[cfg(feature = "size_check")]
        self.untrack(&mut state, ptr, index);

        state.free_lists[index].push(ptr);
    }

    /// The size class that serves `layout` through the `Allocator` trait, if
    /// any. Zero-sized and over-aligned layouts go to the inner allocator.
    fn small_class(layout: Layout) -> Option<usize> {
        if layout.size() == 0 || layout.align() > GRANULE {
            return None;
        }
        class_index(layout.size())
    }
}

#[cfg(feature = "size_check")]
impl<A, L> BucketAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn track(&self, state: &mut State, block: NonNull<u8>, index: usize) {
        let node = match self.inner.allocate(Layout::new::<LiveBlock<'_>>()) {
            Ok(node) => node.cast::<LiveBlock<'static>>(),
            Err(_) => {
                log::warn!("cannot allocate a size-check node; {block:p} is not tracked");
                return;
            }
        };
        // Safety: `node` is freshly allocated, properly aligned, and valid for
        // conversion to a reference until we deallocate it.
        unsafe {
            node.as_ptr().write(LiveBlock::new(block, index));
            state.live_set.insert(node.as_ref());
        }
    }

    unsafe fn untrack(&self, state: &mut State, ptr: NonNull<u8>, index: usize) {
        let Some(node) = state.live_set.remove(&ptr) else {
            return;
        };
        let tracked = node.class();
        self.inner
            .deallocate(NonNull::from(node).cast(), Layout::new::<LiveBlock<'_>>());
        assert_eq!(
            tracked,
            index,
            "{ptr:p} was allocated as a {}-byte block but deallocated as a {}-byte block",
            class_size(tracked),
            class_size(index),
        );
    }

    fn check_not_small(&self, ptr: NonNull<u8>, bytes: usize) {
        let mut state = self.state.lock();
        if let Some(node) = state.live_set.find(&ptr) {
            panic!(
                "{ptr:p} was allocated as a {}-byte block but deallocated as a {bytes}-byte block",
                class_size(node.class()),
            );
        }
    }
}

impl State {
    const fn new() -> Self {
        State {
            free_lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
            pool: Pool::new(),
            #[cfg(feature = "size_check")]
            live_set: LiveSet::new(),
        }
    }

    /// Get a block of `size` bytes from the pool, stocking that size class's
    /// free list with any extra blocks cut alongside it.
    fn refill<A>(&mut self, inner: &A, size: usize) -> Result<NonNull<u8>, AllocError>
    where
        A: Allocator,
    {
        let mut count = REFILL_BATCH;
        let chunk = self.chunk_alloc(inner, size, &mut count)?;
        log::trace!("refilling the {size}-byte class with {count} blocks");

        if count == 1 {
            return Ok(chunk);
        }

        // The first block goes to the caller, the rest onto the free list.
        // Push them back to front so that the list is in address order.
        let free_list = &mut self.free_lists[size / GRANULE - 1];
        for i in (1..count).rev() {
            // Safety: the whole `count * size` range was just cut from the
            // pool, so every block in it is unused and granule-aligned.
            unsafe { free_list.push(chunk.add(i * size)) };
        }
        Ok(chunk)
    }

    /// Cut `*count` blocks of `size` bytes from the pool, replenishing the
    /// pool first if it cannot supply even one.
    ///
    /// On success `*count` holds the number of blocks actually cut, which is
    /// between one and the requested count.
    fn chunk_alloc<A>(
        &mut self,
        inner: &A,
        size: usize,
        count: &mut usize,
    ) -> Result<NonNull<u8>, AllocError>
    where
        A: Allocator,
    {
        if let Some(chunk) = self.cut(size, count) {
            return Ok(chunk);
        }

        self.replenish(inner, size, *count)?;

        // A replenished pool holds at least one `size`-byte block, so this
        // retry always succeeds.
        let chunk = self.cut(size, count);
        debug_assert!(chunk.is_some());
        chunk.ok_or(AllocError)
    }

    /// Cut as many as `*count` blocks of `size` bytes from the pool as it
    /// can supply, if it can supply at least one.
    fn cut(&mut self, size: usize, count: &mut usize) -> Option<NonNull<u8>> {
        let total = size * *count;
        let left = self.pool.remaining();
        if left >= total {
            Some(self.pool.bump(total))
        } else if left >= size {
            *count = left / size;
            Some(self.pool.bump(size * *count))
        } else {
            None
        }
    }

    /// Make the pool hold at least one block of `size` bytes, either by
    /// growing it with a new chunk from `inner` or by borrowing a free block
    /// of the same or a larger size class.
    fn replenish<A>(&mut self, inner: &A, size: usize, count: usize) -> Result<(), AllocError>
    where
        A: Allocator,
    {
        let bytes_to_get =
            (2 * size * count).saturating_add(round_up(self.pool.heap_size() >> 4));

        // Don't waste the tail of the old pool: it is smaller than `size`, but
        // still a whole number of granules, so it fits some smaller class.
        if let Some((leftover, len)) = self.pool.take_leftover() {
            debug_assert_eq!(len % GRANULE, 0);
            if let Some(index) = class_index(len) {
                log::debug!("moving {len} leftover pool bytes to the free list");
                // Safety: the leftover was unused pool memory, it is
                // granule-aligned, and it is exactly the class's size.
                unsafe { self.free_lists[index].push(leftover) };
            }
        }

        match self.pool.grow(inner, bytes_to_get) {
            Ok(()) => {
                log::debug!(
                    "grew the pool by {bytes_to_get} bytes (heap size is now {})",
                    self.pool.heap_size()
                );
                Ok(())
            }
            Err(_) => self.borrow_donor(size),
        }
    }

    /// Turn a single free block of at least `size` bytes into the pool.
    fn borrow_donor(&mut self, size: usize) -> Result<(), AllocError> {
        let first = size / GRANULE - 1;
        for index in first..NUM_SIZE_CLASSES {
            if let Some(block) = self.free_lists[index].pop() {
                log::warn!(
                    "inner allocator failed; borrowing a {}-byte free block as the pool",
                    class_size(index)
                );
                // Safety: the block was free, so its memory is unused, and
                // it lives inside one of our chunks.
                unsafe { self.pool.install(block, class_size(index)) };
                return Ok(());
            }
        }

        log::warn!("out of memory: no free block of {size} bytes or more to borrow");
        self.pool.exhaust();
        Err(AllocError)
    }
}

impl<A, L> Drop for BucketAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();

        #[cfg(feature = "size_check")]
        while let Some(node) = state.live_set.pop_root() {
            // Safety: the node was allocated by `track` with this layout and
            // is no longer in the live set.
            unsafe {
                self.inner
                    .deallocate(NonNull::from(node).cast(), Layout::new::<LiveBlock<'_>>());
            }
        }

        // Every free block lives in one of the chunks being released.
        state.free_lists = [const { FreeList::new() }; NUM_SIZE_CLASSES];

        // Safety: all chunks came from `self.inner`, and nothing may use our
        // memory once we are dropped.
        unsafe { state.pool.release_chunks(&self.inner) };
    }
}

unsafe impl<A, L> Allocator for BucketAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        match Self::small_class(layout) {
            Some(index) => {
                let block = self.allocate_small(index)?;
                Ok(NonNull::slice_from_raw_parts(block, class_size(index)))
            }
            None => self.inner.allocate(layout),
        }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match Self::small_class(layout) {
            Some(index) => self.deallocate_small(ptr, index),
            None => {
                #[cfg(feature = "size_check")]
                self.check_not_small(ptr, layout.size());
                self.inner.deallocate(ptr, layout);
            }
        }
    }
}

#[cfg(feature = "size_check")]
mod size_check {
    use super::*;
    use core::cmp::Ordering;
    use intrusive_splay_tree::{Node, SplayTree, TreeOrd};

    /// The size class of a live small block.
    ///
    /// Note: the `'a` lifetime is only meaningful inside this module; outside
    /// of it, it is always `'static` and the nodes' lifetimes are managed
    /// manually.
    #[derive(Debug)]
    pub(super) struct LiveBlock<'a> {
        ptr: NonNull<u8>,
        class: usize,
        node: Node<'a>,
    }

    impl<'a> LiveBlock<'a> {
        pub(super) fn new(ptr: NonNull<u8>, class: usize) -> Self {
            LiveBlock {
                ptr,
                class,
                node: Node::default(),
            }
        }

        pub(super) fn class(&self) -> usize {
            self.class
        }
    }

    pub(super) struct ByAddress;
    pub(super) type LiveSet = SplayTree<'static, ByAddress>;

    impl<'a> TreeOrd<'a, ByAddress> for LiveBlock<'a> {
        fn tree_cmp(&self, other: &'a LiveBlock<'a>) -> Ordering {
            Ord::cmp(&self.ptr, &other.ptr)
        }
    }

    impl<'a> TreeOrd<'a, ByAddress> for NonNull<u8> {
        fn tree_cmp(&self, block: &'a LiveBlock<'a>) -> Ordering {
            Ord::cmp(self, &block.ptr)
        }
    }

    intrusive_splay_tree::impl_intrusive_node! {
        impl<'a> IntrusiveNode<'a> for ByAddress
        where
            type Elem = LiveBlock<'a>,
            node = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use std::vec::Vec;

    /// A backing allocator that counts its calls, can be told to fail, and
    /// remembers how many bytes are still outstanding.
    #[derive(Default)]
    struct Backing {
        allocations: Cell<usize>,
        outstanding: Cell<usize>,
        failing: Cell<bool>,
    }

    unsafe impl Allocator for Backing {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            if self.failing.get() {
                return Err(AllocError);
            }
            assert_ne!(layout.size(), 0, "tests never allocate zero bytes");
            let ptr = unsafe { std::alloc::alloc(layout) };
            let ptr = NonNull::new(ptr).ok_or(AllocError)?;
            if !is_size_check_node(layout) {
                self.allocations.set(self.allocations.get() + 1);
            }
            self.outstanding.set(self.outstanding.get() + layout.size());
            Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.outstanding.set(self.outstanding.get() - layout.size());
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    /// Size-check bookkeeping is not counted as a call for more memory.
    fn is_size_check_node(layout: Layout) -> bool {
        #[cfg(feature = "size_check")]
        return layout == Layout::new::<LiveBlock<'_>>();
        #[cfg(not(feature = "size_check"))]
        return {
            let _ = layout;
            false
        };
    }

    fn bucket_allocator(backing: &Backing) -> BucketAllocator<&Backing, SingleThreadedLock> {
        let _ = env_logger::try_init();
        BucketAllocator::new(backing, SingleThreadedLock::new())
    }

    #[test]
    fn cold_start() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        let first = allocator.allocate_bytes(8).unwrap();
        assert_eq!(backing.allocations.get(), 1);

        let stats = allocator.stats();
        assert_eq!(stats.heap_size, 2 * 8 * REFILL_BATCH);
        assert_eq!(stats.free_blocks[0], REFILL_BATCH - 1);
        assert_eq!(stats.pool_bytes, 8 * REFILL_BATCH);

        // Served from the refilled free list, in address order.
        let second = allocator.allocate_bytes(8).unwrap();
        assert_eq!(backing.allocations.get(), 1);
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 8);
        assert_eq!(allocator.stats().free_blocks[0], REFILL_BATCH - 2);
    }

    #[test]
    fn lifo_reuse() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        for bytes in 0..=MAX_SMALL_BYTES {
            let a = allocator.allocate_bytes(bytes).unwrap();
            unsafe { allocator.deallocate_bytes(a, bytes) };
            let b = allocator.allocate_bytes(bytes).unwrap();
            assert_eq!(a, b, "{bytes}-byte block not reused");
            unsafe { allocator.deallocate_bytes(b, bytes) };
        }
    }

    #[test]
    fn distinct_aligned_blocks() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        for bytes in [1, 8, 13, 24, 64, 100, 128] {
            let size = round_up(bytes);
            let mut blocks: Vec<usize> = (0..50)
                .map(|_| allocator.allocate_bytes(bytes).unwrap().as_ptr() as usize)
                .collect();
            assert!(blocks.iter().all(|b| b % GRANULE == 0));

            blocks.sort_unstable();
            for pair in blocks.windows(2) {
                assert!(pair[0] + size <= pair[1], "{bytes}-byte blocks overlap");
            }
        }
    }

    #[test]
    fn free_list_satisfies_second_round() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        let blocks: Vec<_> = (0..45).map(|_| allocator.allocate_bytes(40).unwrap()).collect();
        for block in &blocks {
            unsafe { allocator.deallocate_bytes(*block, 40) };
        }

        let calls = backing.allocations.get();
        let heap_size = allocator.heap_size();
        for _ in 0..45 {
            allocator.allocate_bytes(40).unwrap();
        }
        assert_eq!(backing.allocations.get(), calls);
        assert_eq!(allocator.heap_size(), heap_size);
    }

    #[test]
    fn large_requests_bypass_the_pool() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        let before = allocator.stats();
        let large = allocator.allocate_bytes(256).unwrap();
        assert_eq!(backing.allocations.get(), 1);
        assert_eq!(backing.outstanding.get(), 256);
        assert_eq!(allocator.stats(), before);

        unsafe { allocator.deallocate_bytes(large, 256) };
        assert_eq!(backing.outstanding.get(), 0);
        assert_eq!(allocator.stats(), before);
    }

    #[test]
    fn partial_batch() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);
        let mut state = allocator.state.lock();

        // 3.5 blocks' worth of 16-byte blocks.
        state.pool.grow(&&backing, 56).unwrap();

        let mut count = REFILL_BATCH;
        let chunk = state.chunk_alloc(&&backing, 16, &mut count).unwrap();
        assert_eq!(count, 3);
        assert_eq!(state.pool.remaining(), 8);
        assert_eq!(backing.allocations.get(), 1);

        // The remainder is scavenged into the 8-byte class on the next growth.
        let mut count = REFILL_BATCH;
        let next = state.chunk_alloc(&&backing, 16, &mut count).unwrap();
        assert_eq!(count, REFILL_BATCH);
        assert_ne!(chunk, next);
        assert_eq!(state.free_lists[0].len(), 1);
        assert_eq!(
            state.free_lists[0].pop().map(|b| b.as_ptr() as usize),
            Some(chunk.as_ptr() as usize + 48)
        );
    }

    #[test]
    fn single_block_refill_and_growth_formula() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        allocator.allocate_bytes(8).unwrap();
        assert_eq!(allocator.heap_size(), 320);
        assert_eq!(allocator.stats().pool_bytes, 160);

        // Only one 128-byte block fits in the remaining 160 bytes, so it is
        // returned without stocking the free list.
        allocator.allocate_bytes(128).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.free_blocks[15], 0);
        assert_eq!(stats.pool_bytes, 32);
        assert_eq!(backing.allocations.get(), 1);

        // Now the pool must grow: 2 * 128 * 20 + round_up(320 / 16).
        allocator.allocate_bytes(128).unwrap();
        let stats = allocator.stats();
        assert_eq!(backing.allocations.get(), 2);
        assert_eq!(stats.heap_size, 320 + 5120 + 24);
        assert_eq!(stats.free_blocks[15], REFILL_BATCH - 1);
        // The 32-byte leftover went to the 32-byte class.
        assert_eq!(stats.free_blocks[3], 1);
    }

    #[test]
    fn heap_size_never_decreases() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        let mut heap_size = 0;
        let mut live = Vec::new();
        for i in 0..2000_usize {
            let bytes = (i * 37) % 200;
            if i % 3 == 2 {
                if let Some((ptr, bytes)) = live.pop() {
                    unsafe { allocator.deallocate_bytes(ptr, bytes) };
                }
            } else {
                live.push((allocator.allocate_bytes(bytes).unwrap(), bytes));
            }
            let now = allocator.heap_size();
            assert!(now >= heap_size);
            heap_size = now;
        }
        for (ptr, bytes) in live {
            unsafe { allocator.deallocate_bytes(ptr, bytes) };
        }
    }

    #[test]
    fn borrows_donor_block_when_inner_fails() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        // Leave exactly one free 48-byte block and an empty pool.
        {
            let mut state = allocator.state.lock();
            state.pool.grow(&&backing, 48).unwrap();
            let block = state.pool.bump(48);
            unsafe { state.free_lists[5].push(block) };
        }
        backing.failing.set(true);

        let block = allocator.allocate_bytes(16).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.free_blocks[5], 0);
        assert_eq!(stats.free_blocks[1], 2);
        assert_eq!(stats.pool_bytes, 0);
        assert_eq!(backing.allocations.get(), 1);

        unsafe { allocator.deallocate_bytes(block, 16) };
    }

    #[test]
    fn donor_search_skips_smaller_classes() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        // Stock the 8-byte class, then drain the pool.
        allocator.allocate_bytes(8).unwrap();
        {
            let mut state = allocator.state.lock();
            let left = state.pool.remaining();
            state.pool.bump(left);
        }
        backing.failing.set(true);

        assert_eq!(allocator.allocate_bytes(64), Err(AllocError));
        assert_eq!(allocator.stats().free_blocks[0], REFILL_BATCH - 1);
    }

    #[test]
    fn exhaustion_leaves_state_consistent() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        let a = allocator.allocate_bytes(24).unwrap();
        {
            let mut state = allocator.state.lock();
            let left = state.pool.remaining();
            state.pool.bump(left);
        }
        backing.failing.set(true);

        // The 24-byte class still has inventory.
        let blocks: Vec<_> = (1..REFILL_BATCH)
            .map(|_| allocator.allocate_bytes(24).unwrap())
            .collect();

        // 112 bytes: the pool is empty, there are no donors at or above 112
        // bytes, and the inner allocator fails.
        assert_eq!(allocator.allocate_bytes(112), Err(AllocError));
        assert_eq!(allocator.stats().pool_bytes, 0);

        // Large requests report the inner allocator's failure as-is.
        assert_eq!(allocator.allocate_bytes(4096), Err(AllocError));

        // Freed blocks are still usable afterwards.
        unsafe { allocator.deallocate_bytes(a, 24) };
        assert_eq!(allocator.allocate_bytes(24), Ok(a));

        backing.failing.set(false);
        let b = allocator.allocate_bytes(112).unwrap();
        unsafe { allocator.deallocate_bytes(b, 112) };
        for block in blocks {
            unsafe { allocator.deallocate_bytes(block, 24) };
        }
    }

    #[test]
    fn reallocate_does_not_preserve_contents() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        let old = allocator.allocate_bytes(16).unwrap();
        unsafe { old.as_ptr().write_bytes(0xAB, 16) };

        let new = unsafe { allocator.reallocate_bytes(old, 16, 16) }.unwrap();
        assert_eq!(new, old);
        let first_word = unsafe { new.cast::<usize>().as_ptr().read() };
        assert_ne!(first_word, usize::from_ne_bytes([0xAB; core::mem::size_of::<usize>()]));

        // Different class: a different block.
        let bigger = unsafe { allocator.reallocate_bytes(new, 16, 100) }.unwrap();
        assert_ne!(bigger, new);
        unsafe { allocator.deallocate_bytes(bigger, 100) };
    }

    #[test]
    fn allocator_trait() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);

        let small = Layout::from_size_align(20, 4).unwrap();
        let block = allocator.allocate(small).unwrap();
        assert_eq!(block.len(), 24);
        assert_eq!(allocator.stats().free_blocks[2], REFILL_BATCH - 1);

        // `grow` copies the contents.
        unsafe { block.cast::<u8>().as_ptr().write_bytes(7, 20) };
        let bigger = Layout::from_size_align(60, 4).unwrap();
        let grown = unsafe { allocator.grow(block.cast(), small, bigger) }.unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(grown.cast::<u8>().as_ptr(), 20) };
        assert!(bytes.iter().all(|b| *b == 7));
        assert_eq!(allocator.stats().free_blocks[2], REFILL_BATCH);

        // Over-aligned and large layouts go to the inner allocator.
        let outstanding = backing.outstanding.get();
        let aligned = Layout::from_size_align(16, 64).unwrap();
        let block = allocator.allocate(aligned).unwrap();
        assert_eq!(block.cast::<u8>().as_ptr() as usize % 64, 0);
        assert_eq!(backing.outstanding.get(), outstanding + 16);
        unsafe { allocator.deallocate(block.cast(), aligned) };
        assert_eq!(backing.outstanding.get(), outstanding);

        unsafe { allocator.deallocate(grown.cast(), bigger) };
    }

    #[test]
    #[should_panic(expected = "re-entrant allocation")]
    fn reentrant_allocation_panics() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);
        let _state = allocator.state.lock();
        let _ = allocator.allocate_bytes(8);
    }

    #[test]
    fn drop_returns_every_chunk() {
        let backing = Backing::default();
        {
            let allocator = bucket_allocator(&backing);
            for bytes in (1..=MAX_SMALL_BYTES).step_by(5) {
                for _ in 0..30 {
                    allocator.allocate_bytes(bytes).unwrap();
                }
            }
            assert!(backing.allocations.get() > 1);
        }
        assert_eq!(backing.outstanding.get(), 0);
    }

    #[cfg(feature = "size_check")]
    #[test]
    #[should_panic(expected = "deallocated as a 32-byte block")]
    fn size_check_catches_mismatched_class() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);
        let block = allocator.allocate_bytes(16).unwrap();
        unsafe { allocator.deallocate_bytes(block, 32) };
    }

    #[cfg(feature = "size_check")]
    #[test]
    #[should_panic(expected = "deallocated as a 300-byte block")]
    fn size_check_catches_small_block_freed_as_large() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);
        let block = allocator.allocate_bytes(16).unwrap();
        unsafe { allocator.deallocate_bytes(block, 300) };
    }

    #[cfg(feature = "size_check")]
    #[test]
    #[should_panic(expected = "deallocated as a 200-byte block")]
    fn size_check_catches_small_layout_freed_as_large() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);
        let small = Layout::from_size_align(40, 8).unwrap();
        let block = allocator.allocate(small).unwrap();
        let large = Layout::from_size_align(200, 8).unwrap();
        unsafe { allocator.deallocate(block.cast(), large) };
    }

    #[cfg(feature = "size_check")]
    #[test]
    fn size_check_accepts_same_class() {
        let backing = Backing::default();
        let allocator = bucket_allocator(&backing);
        let block = allocator.allocate_bytes(10).unwrap();
        unsafe { allocator.deallocate_bytes(block, 16) };
        assert_eq!(allocator.allocate_bytes(9), Ok(block));
    }
}
