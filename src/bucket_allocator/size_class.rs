//! Size class arithmetic.
//!
//! Small requests are rounded up to a multiple of [`GRANULE`] and every
//! distinct rounded size gets its own free list: class `i` holds blocks of
//! exactly `(i + 1) * GRANULE` bytes.

/// The rounding granule, and the alignment of every small block.
pub const GRANULE: usize = 8;

/// The largest request served from the size classes. Anything larger goes
/// straight to the inner allocator.
pub const MAX_SMALL_BYTES: usize = 128;

/// The number of size classes (and free lists).
pub const NUM_SIZE_CLASSES: usize = MAX_SMALL_BYTES / GRANULE;

/// How many blocks a refill tries to cut from the pool at once.
pub const REFILL_BATCH: usize = 20;

const _: () = {
    assert!(GRANULE.is_power_of_two());
    assert!(MAX_SMALL_BYTES % GRANULE == 0);
    // A free block must be able to hold its free-list link.
    assert!(GRANULE >= core::mem::size_of::<usize>());
};

/// Round `bytes` up to the next multiple of [`GRANULE`].
///
/// Zero stays zero. Saturates instead of overflowing for sizes within a
/// granule of `usize::MAX`.
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    match bytes.checked_add(GRANULE - 1) {
        Some(b) => b & !(GRANULE - 1),
        None => usize::MAX & !(GRANULE - 1),
    }
}

/// The size class that serves a request of `bytes` bytes, or `None` if the
/// request is too large for the size classes.
///
/// A zero-byte request is served from the smallest class.
#[inline]
pub const fn class_index(bytes: usize) -> Option<usize> {
    if bytes > MAX_SMALL_BYTES {
        return None;
    }
    if bytes == 0 {
        return Some(0);
    }
    Some((bytes + GRANULE - 1) / GRANULE - 1)
}

/// The block size of the given size class.
///
/// # Panics
///
/// Panics if `index >= NUM_SIZE_CLASSES`.
#[inline]
pub const fn class_size(index: usize) -> usize {
    assert!(index < NUM_SIZE_CLASSES);
    (index + 1) * GRANULE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_classes_of_eight_bytes() {
        assert_eq!(NUM_SIZE_CLASSES, 16);
        assert_eq!(class_size(0), 8);
        assert_eq!(class_size(NUM_SIZE_CLASSES - 1), 128);
    }

    #[test]
    fn class_boundaries() {
        assert_eq!(class_index(0), Some(0));
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(8), Some(0));
        assert_eq!(class_index(9), Some(1));
        assert_eq!(class_index(16), Some(1));
        assert_eq!(class_index(17), Some(2));
        assert_eq!(class_index(121), Some(15));
        assert_eq!(class_index(128), Some(15));
        assert_eq!(class_index(129), None);
        assert_eq!(class_index(256), None);
    }

    #[test]
    fn class_size_covers_request() {
        for bytes in 1..=MAX_SMALL_BYTES {
            let index = class_index(bytes).unwrap();
            let size = class_size(index);
            assert!(size >= bytes);
            assert!(size - bytes < GRANULE);
            assert_eq!(size, round_up(bytes));
        }
    }

    #[test]
    fn round_up_saturates() {
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(4097), 4104);
        assert_eq!(round_up(usize::MAX), usize::MAX & !7);
    }
}
