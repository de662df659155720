#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod bucket_allocator;
pub use bucket_allocator::{
    class_index, class_size, round_up, BucketAllocator, Lock, PoolStats, SingleThreadedLock,
    GRANULE, MAX_SMALL_BYTES, NUM_SIZE_CLASSES, REFILL_BATCH,
};

mod typed;
pub use typed::TypedAllocator;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
