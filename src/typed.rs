use super::*;
use core::{marker::PhantomData, mem};

/// A per-element view of a [`BucketAllocator`] for containers of `T`.
///
/// Allocating `n` elements requests `n * size_of::<T>()` bytes. Requests for
/// zero elements, or for zero-sized `T`, never reach the allocator and yield
/// a dangling, well-aligned pointer.
///
/// Element types aligned to more than [`GRANULE`] are passed through to the
/// inner allocator, since small blocks are only granule-aligned.
pub struct TypedAllocator<'a, T, A, L>
where
    A: Allocator,
    L: Lock,
{
    allocator: &'a BucketAllocator<A, L>,
    _elem: PhantomData<fn() -> T>,
}

impl<T, A, L> Clone for TypedAllocator<'_, T, A, L>
where
    A: Allocator,
    L: Lock,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A, L> Copy for TypedAllocator<'_, T, A, L>
where
    A: Allocator,
    L: Lock,
{
}

impl<'a, T, A, L> TypedAllocator<'a, T, A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create a typed view of the given allocator.
    #[inline]
    pub fn new(allocator: &'a BucketAllocator<A, L>) -> Self {
        TypedAllocator {
            allocator,
            _elem: PhantomData,
        }
    }

    /// The underlying bucket allocator.
    #[inline]
    pub fn allocator(&self) -> &'a BucketAllocator<A, L> {
        self.allocator
    }

    /// Allocate uninitialized space for `n` values of type `T`.
    ///
    /// Fails if `n * size_of::<T>()` overflows or the allocator is out of
    /// memory.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let layout = match Self::layout(n)? {
            Some(layout) => layout,
            None => return Ok(NonNull::dangling()),
        };
        Ok(self.allocator.allocate(layout)?.cast())
    }

    /// Allocate uninitialized space for a single `T`.
    #[inline]
    pub fn allocate_one(&self) -> Result<NonNull<T>, AllocError> {
        self.allocate(1)
    }

    /// Deallocate space for `n` values previously obtained from
    /// [`allocate`](Self::allocate).
    ///
    /// Nothing is dropped; the values must already have been moved out or
    /// dropped in place.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by `allocate(n)` on a view of the same
    /// allocator, with the same `n`, and must not have been deallocated yet.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        // The layout was computable when `ptr` was allocated, so it still is.
        if let Ok(Some(layout)) = Self::layout(n) {
            self.allocator.deallocate(ptr.cast(), layout);
        }
    }

    /// Deallocate space for a single `T` obtained from
    /// [`allocate_one`](Self::allocate_one).
    ///
    /// ### Safety
    ///
    /// Same as [`deallocate`](Self::deallocate) with `n == 1`.
    #[inline]
    pub unsafe fn deallocate_one(&self, ptr: NonNull<T>) {
        self.deallocate(ptr, 1);
    }

    /// The layout for `n` elements, or `None` if that is zero bytes.
    fn layout(n: usize) -> Result<Option<Layout>, AllocError> {
        if n == 0 || mem::size_of::<T>() == 0 {
            return Ok(None);
        }
        Layout::array::<T>(n).map(Some).map_err(|_| AllocError)
    }
}
