//! Shared fuzzing and testing infrastructure for `bucket_alloc`.

#![feature(allocator_api)]

use bucket_alloc::{
    class_index, round_up, AllocError, Allocator, BucketAllocator, SingleThreadedLock, GRANULE,
    MAX_SMALL_BYTES,
};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{alloc::Layout, cell::Cell, collections::BTreeMap, ptr::NonNull};

/// The byte count of a test allocation.
//
// Note: a newtype rather than a bare `usize` so that we can give it a mutator
// that favors the small-object size classes.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s that mostly produces small-object sizes, with the
/// occasional large one.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 1024 }
    }
}

impl SizeMutator {
    fn choose(&self, ctx: &mut mutatis::Context, at_most: usize) -> usize {
        let at_most = std::cmp::min(at_most, self.max_size);
        if ctx.rng().gen_bool() {
            ctx.rng()
                .gen_index(std::cmp::min(at_most, MAX_SMALL_BYTES) + 1)
                .unwrap()
        } else {
            ctx.rng().gen_index(at_most + 1).unwrap()
        }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let at_most = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = self.choose(ctx, at_most);
            Ok(())
        })?;

        // Move to a neighboring size class.
        if !c.shrink() {
            c.mutation(|ctx| {
                let neighbor = if ctx.rng().gen_bool() {
                    size.0.saturating_sub(GRANULE)
                } else {
                    size.0.saturating_add(GRANULE)
                };
                size.0 = std::cmp::min(neighbor, self.max_size);
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Size> {
        Ok(Size(self.choose(ctx, self.max_size)))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Dealloc { id: u32 },
    Realloc { id: u32, size: Size },
    FailInner { fail: bool },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::FailInner {
                    fail: ctx.rng().gen_bool(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Point an operation at an id that some earlier `Alloc` uses.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Dealloc { id } | Op::Realloc { id, .. } => {
                        *id = new_id;
                    }
                    Op::FailInner { .. } => {}
                }
            }
            Ok(())
        })?;

        // Free an existing allocation and immediately allocate the same size
        // again, which should hand back the same block.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let Op::Alloc { size, .. } = ops.ops[op_index] else {
                        unreachable!()
                    };
                    let new_id = ctx.rng().gen_u32();
                    let at = op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(at, Op::Dealloc { id });
                    ops.ops.insert(at + 1, Op::Alloc { id: new_id, size });
                }
                Ok(())
            })?;
        }

        // Starve the pool: make the inner allocator fail for a while.
        if !c.shrink() {
            c.mutation(|ctx| {
                let start = ctx.rng().gen_index(ops.ops.len() + 1).unwrap();
                let end = start + ctx.rng().gen_index(ops.ops.len() - start + 1).unwrap();
                ops.ops.insert(end, Op::FailInner { fail: false });
                ops.ops.insert(start, Op::FailInner { fail: true });
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Decode test operations from raw fuzzer input.
    pub fn decode(data: &[u8]) -> Option<Self> {
        bincode::decode_from_slice(data, bincode_config())
            .ok()
            .map(|(ops, _)| ops)
    }

    /// Encode these test operations into `data`, returning the encoded
    /// length, or `None` if they do not fit.
    pub fn encode_into(&self, data: &mut [u8]) -> Option<usize> {
        bincode::encode_into_slice(self, data, bincode_config()).ok()
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        let inner = FailingAllocator::default();
        let allocator = BucketAllocator::new(&inner, SingleThreadedLock::new());
        self.run_with_allocator(&allocator, &inner, allocation_limit)
    }

    /// Run these test operations with the given allocator, whose inner
    /// allocator is controlled by `inner`, and allocation limit.
    pub fn run_with_allocator<A>(
        &self,
        allocator: &BucketAllocator<A, SingleThreadedLock>,
        inner: &FailingAllocator,
        allocation_limit: usize,
    ) -> Result<(), String>
    where
        A: Allocator,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);

        // The block most recently freed, if nothing has happened since.
        let mut just_freed: Option<(usize, NonNull<u8>)> = None;
        let mut heap_size = allocator.heap_size();

        let dealloc = |id: u32, alloc: LiveAlloc| -> Result<(), String> {
            log::debug!("deallocating id{id} -> {alloc:?}");
            alloc.check_pattern()?;
            unsafe { allocator.deallocate_bytes(alloc.ptr, alloc.size) };
            Ok(())
        };

        let new_alloc = |live: &mut LiveMap,
                         just_freed: Option<(usize, NonNull<u8>)>,
                         id: u32,
                         ptr: NonNull<u8>,
                         size: usize|
         -> Result<(), String> {
            let alloc = LiveAlloc::new(id, ptr, size);
            log::debug!("new allocation: id{id} -> {alloc:?}");

            ensure!(
                ptr.as_ptr() as usize % GRANULE == 0,
                "{ptr:p} is not aligned to the {GRANULE}-byte granule",
            );

            if let (Some((freed_class, freed)), Some(class)) = (just_freed, class_index(size)) {
                if freed_class == class {
                    ensure!(
                        ptr == freed,
                        "expected the just-freed block {freed:p} back, got {ptr:p}",
                    );
                }
            }

            for other in live.map.values() {
                ensure!(
                    alloc.end() <= other.start() || other.end() <= alloc.start(),
                    "{alloc:?} overlaps live allocation {other:?}",
                );
            }

            alloc.fill();
            live.insert(id, alloc);
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");
            let freed = just_freed.take();

            match op {
                Op::Alloc { id, size } => {
                    if live.beyond_allocation_limit(size.0) {
                        continue;
                    }
                    let mut expected = freed;
                    if let Some(old) = live.remove(*id) {
                        if let Some(class) = class_index(old.size) {
                            expected = Some((class, old.ptr));
                        }
                        dealloc(*id, old)?;
                    }
                    if let Ok(ptr) = allocator.allocate_bytes(size.0) {
                        new_alloc(&mut live, expected, *id, ptr, size.0)?;
                    }
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        let small = class_index(alloc.size).map(|class| (class, alloc.ptr));
                        dealloc(*id, alloc)?;
                        just_freed = small;
                    }
                }

                Op::Realloc { id, size } => {
                    if let Some(old) = live.remove(*id) {
                        if live.beyond_allocation_limit(size.0) {
                            live.insert(*id, old);
                            continue;
                        }
                        old.check_pattern()?;
                        let small = class_index(old.size).map(|class| (class, old.ptr));
                        // The old block is gone whether or not this succeeds.
                        let result =
                            unsafe { allocator.reallocate_bytes(old.ptr, old.size, size.0) };
                        if let Ok(ptr) = result {
                            new_alloc(&mut live, small, *id, ptr, size.0)?;
                        }
                    }
                }

                Op::FailInner { fail } => inner.set_failing(*fail),
            }

            let now = allocator.heap_size();
            ensure!(now >= heap_size, "heap size shrank from {heap_size} to {now}");
            heap_size = now;
        }

        // Finally, deallocate any remaining live allocations.
        for (id, alloc) in std::mem::take(&mut live.map) {
            dealloc(id, alloc)?;
        }

        Ok(())
    }
}

/// An inner allocator that can be told to fail every request, forcing the
/// bucket allocator down its scavenging paths.
#[derive(Debug, Default)]
pub struct FailingAllocator {
    failing: Cell<bool>,
}

impl FailingAllocator {
    /// Make all subsequent allocations fail, or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }
}

unsafe impl Allocator for FailingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if self.failing.get() {
            return Err(AllocError);
        }
        std::alloc::System.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::System.deallocate(ptr, layout);
    }
}

/// A currently-live allocation, filled with a byte pattern derived from its
/// id so that a block shared with another allocation or a free list shows up
/// as a corrupted pattern.
struct LiveAlloc {
    id: u32,
    ptr: NonNull<u8>,
    /// The requested size.
    size: usize,
}

impl LiveAlloc {
    fn new(id: u32, ptr: NonNull<u8>, size: usize) -> Self {
        LiveAlloc { id, ptr, size }
    }

    fn pattern(&self) -> u8 {
        (self.id % 255) as u8 + 1
    }

    fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last byte the allocator handed out for this block.
    fn end(&self) -> usize {
        let len = if self.size <= MAX_SMALL_BYTES {
            round_up(self.size.max(1))
        } else {
            self.size
        };
        self.start() + len
    }

    fn fill(&self) {
        unsafe { self.ptr.as_ptr().write_bytes(self.pattern(), self.size) };
    }

    fn check_pattern(&self) -> Result<(), String> {
        let pattern = self.pattern();
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        ensure!(
            bytes.iter().all(|b| *b == pattern),
            "contents of id{} at {:p} were clobbered while it was live",
            self.id,
            self.ptr,
        );
        Ok(())
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveAlloc")
            .field("id", &self.id)
            .field("ptr", &format!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The sum of the requested sizes of all live allocations.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    ///
    /// Decoded sizes can be anything, so this must not overflow.
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes
            .checked_add(size)
            .map_or(true, |total| total > self.allocation_limit)
    }

    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.size;
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }
}
