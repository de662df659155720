//! Exclusive access to the allocator's free lists and pool.
//!
//! The allocator API hands out allocations through `&self`, so the mutable
//! allocator state needs interior mutability. Rather than hard-coding a
//! `RefCell` (or a spin lock, or an OS mutex) the state is guarded by any type
//! implementing [`Lock`].

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

/// A trait for guarding the allocator's state against concurrent or
/// re-entrant access.
///
/// The allocator itself performs no synchronization. [`SingleThreadedLock`]
/// is provided for the common single-threaded case; sharing a
/// `BucketAllocator` between threads requires supplying a `Lock` that really
/// excludes other threads.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then an allocator using it will be
///   `Sync`, so `lock` must provide actual mutual exclusion between
///   threads.
///
/// * Even in single-threaded contexts, `lock` must never succeed while the
///   lock is already held (for example when the inner allocator calls back
///   into the bucket allocator). Panicking, aborting, or spinning forever are
///   all acceptable.
pub unsafe trait Lock {
    /// Lock this mutex.
    fn lock(&self);

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A [`Lock`] for allocators that never leave their thread.
///
/// This is the moral equivalent of a `RefCell` borrow flag: locking it
/// while it is already locked panics. It is not `Sync`, so neither is an
/// allocator using it.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(
            !self.locked.get(),
            "bucket allocator state is already locked; re-entrant allocation?"
        );
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new, unlocked `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: moving the container moves both the value and the lock; nothing
// else refers to the value while we have ownership.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract. `T: Send` is
// required because a guard obtained on another thread hands out `&mut T`.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        Mutex {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    /// Access the value through a unique reference, which needs no locking.
    pub(super) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the lock is held for as long as this guard lives.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the lock is held for as long as this guard lives.
        unsafe { &mut *self.mutex.value.get() }
    }
}
