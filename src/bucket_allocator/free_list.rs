//! Intrusive, singly linked free lists.
//!
//! A free block's first word is reinterpreted as a link to the next free
//! block of the same size class. Nothing else about the block is read or
//! written while it sits on a free list, and nothing is remembered about it
//! once it is popped off again.

use core::ptr::NonNull;

/// The overlay written into a block while it is free.
#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// A LIFO stack of free blocks that all have the same size.
pub(super) struct FreeList {
    head: Option<NonNull<FreeBlock>>,
}

impl FreeList {
    pub(super) const fn new() -> Self {
        FreeList { head: None }
    }

    /// Push a block onto the front of this list.
    ///
    /// ### Safety
    ///
    /// * `block` must be valid for writes of a pointer, aligned to a pointer,
    ///   and not currently in use by anything else.
    ///
    /// * `block` must be exactly the size of this list's class, and must stay
    ///   valid for as long as it is on this list.
    #[inline]
    pub(super) unsafe fn push(&mut self, block: NonNull<u8>) {
        let block = block.cast::<FreeBlock>();
        block.as_ptr().write(FreeBlock { next: self.head });
        self.head = Some(block);
    }

    /// Pop the most recently pushed block, if any.
    #[inline]
    pub(super) fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        // Safety: every block on the list was valid when pushed and must stay
        // valid while on the list, per `push`'s contract.
        self.head = unsafe { block.as_ptr().read().next };
        Some(block.cast())
    }

    /// Count the blocks on this list. Walks the whole list.
    pub(super) fn len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.head;
        while let Some(block) = cursor {
            len += 1;
            // Safety: see `pop`.
            cursor = unsafe { block.as_ptr().read().next };
        }
        len
    }
}
