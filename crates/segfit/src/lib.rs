//! First-fit memory allocation over a caller-provided segment.
//!
//! This crate manages a single contiguous byte buffer handed to it by the
//! caller and serves allocate/free/resize requests out of it without touching
//! any system allocator. It is aimed at embedded and instructional use, where
//! the allocator itself owns all bookkeeping of free and used space.
//!
//! # Strategies
//!
//! Two allocators share the same contract (the [`SegmentAlloc`] trait) and
//! the same block layout; they differ only in how free space is tracked:
//!
//! - [`ImplicitAllocator`](implicit::ImplicitAllocator) walks the header
//!   chain linearly from the segment start and takes the first free block
//!   that fits. Freeing a block is a single flag flip, so insertion is O(1)
//!   and search is O(n) in the number of blocks, free or used.
//! - [`ExplicitAllocator`](explicit::ExplicitAllocator) threads a doubly
//!   linked list through the payload bytes of free blocks and searches only
//!   that list, most-recently-freed first. Search visits free blocks only;
//!   the price is list maintenance on every free/used transition.
//!
//! # Block layout
//!
//! Every block is a one-word header followed by its payload. The header
//! stores `size | free_bit`: payload sizes are always multiples of
//! [`ALIGNMENT`], so bit 0 is unused by the size and carries the free flag
//! (`1` = free). The byte after a block's payload is the next block's
//! header, or the segment end.
//!
//! ```text
//! ┌────────┬───────────────┬────────┬──────────┬────────┬─────────────┐
//! │ header │ payload       │ header │ payload  │ header │ payload     │
//! │ 48|0   │ (used)        │ 16|1   │ (free)   │ 24|0   │ (used)      │
//! └────────┴───────────────┴────────┴──────────┴────────┴─────────────┘
//! ^ segment base                                            segment end ^
//! ```
//!
//! A free block's payload additionally hosts the explicit strategy's list
//! node: two words holding the `next`/`prev` links as offsets from the
//! segment base. [`MIN_PAYLOAD`] guarantees every block can hold one.
//!
//! # Usage
//!
//! ```rust
//! use core::ptr::NonNull;
//!
//! use segfit::implicit::ImplicitAllocator;
//!
//! // A u64 buffer keeps the segment word-aligned.
//! let mut heap = vec![0_u64; 128];
//! let base = NonNull::new(heap.as_mut_ptr().cast::<u8>()).unwrap();
//!
//! let mut alloc = unsafe { ImplicitAllocator::new(base, heap.len() * 8) };
//! let ptr = alloc.allocate(64).unwrap();
//! // ... use the 64 bytes at `ptr` ...
//! unsafe {
//!     alloc.free(ptr.as_ptr());
//! }
//! ```
//!
//! # Thread safety
//!
//! Allocators are single-threaded values: every operation takes `&mut self`,
//! so the single-writer discipline is enforced by the borrow checker rather
//! than assumed. Wrap an allocator in a mutex if it must be shared.
//!
//! # Caller obligations
//!
//! Freeing or resizing a pointer that was not returned by the same allocator
//! instance, or freeing a pointer twice, is undefined behavior. Blocks carry
//! no tag that would let the allocator detect misuse; the `# Safety`
//! sections on [`SegmentAlloc::free`] and [`SegmentAlloc::resize`] state the
//! full contract.

#![cfg_attr(not(test), no_std)]

use core::ptr::NonNull;

use crate::error::AllocError;

pub mod error;
pub mod explicit;
pub mod implicit;
mod segment;

/// Size of a block header, one machine word.
pub const HEADER_SIZE: usize = size_of::<usize>();

/// Alignment unit for payload addresses and sizes.
pub const ALIGNMENT: usize = HEADER_SIZE;

/// Smallest payload a block may have, enough for a free-list node.
pub const MIN_PAYLOAD: usize = 2 * HEADER_SIZE;

/// Largest request size a single `allocate` call accepts.
pub const MAX_REQUEST: usize = 1 << 30;

/// Common contract of the two allocation strategies.
///
/// Both [`ImplicitAllocator`](implicit::ImplicitAllocator) and
/// [`ExplicitAllocator`](explicit::ExplicitAllocator) implement this trait,
/// which lets the same property suite run against either strategy.
pub trait SegmentAlloc: Sized {
    /// Creates an allocator owning the `len` bytes at `base`.
    ///
    /// The whole segment becomes a single free block spanning everything
    /// after the initial header.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not aligned to [`ALIGNMENT`], or if `len` is not
    /// a multiple of [`ALIGNMENT`] or too small to hold one minimal block.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base` points to a writable region of at least `len` bytes
    /// - the region outlives the allocator and nothing else reads or writes
    ///   it while the allocator is alive
    unsafe fn new(base: NonNull<u8>, len: usize) -> Self;

    /// Allocates a block with at least `size` bytes of payload.
    ///
    /// The request is rounded up to a multiple of [`ALIGNMENT`], with
    /// [`MIN_PAYLOAD`] as a floor. Fails with
    /// [`AllocError::InvalidRequest`] when `size` is zero or exceeds
    /// [`MAX_REQUEST`], and with [`AllocError::Exhausted`] when no free
    /// block fits.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Frees a previously allocated block. A null `ptr` is a no-op.
    ///
    /// Adjacent free neighbors are merged, so freeing two neighboring
    /// blocks in either order leaves a single free block.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by `allocate` or `resize`
    /// on this allocator and must not have been freed since.
    unsafe fn free(&mut self, ptr: *mut u8);

    /// Resizes a block, preferring in-place shrink or growth.
    ///
    /// With a null `ptr` this delegates to [`allocate`](Self::allocate);
    /// with `new_size == 0` it frees the block and reports
    /// [`AllocError::InvalidRequest`] since no block remains. Otherwise the
    /// block is shrunk by splitting or grown by absorbing free right
    /// neighbors, keeping the same address; only when in-place growth is
    /// impossible is the payload moved to a freshly allocated block.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for a non-null `ptr`.
    unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize)
    -> Result<NonNull<u8>, AllocError>;

    /// Checks heap consistency, reporting problems via `log::error!`.
    ///
    /// Diagnostic only: the result is never load-bearing and a failure does
    /// not halt the allocator. Returns `true` when all invariants hold.
    fn validate(&self) -> bool;

    /// Arms an automatic [`validate`](Self::validate) after every `every`-th
    /// mutating operation. `0` (the default) disables the check.
    fn set_validate_every(&mut self, every: usize);

    /// Reports byte and block totals for the segment.
    fn stats(&self) -> SegmentStats;
}

/// Byte and block totals gathered by walking the header chain.
///
/// At any quiescent point `free_bytes + used_bytes + header_bytes` equals
/// the segment size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    /// Payload bytes in free blocks.
    pub free_bytes: usize,
    /// Payload bytes in used blocks.
    pub used_bytes: usize,
    /// Bytes consumed by block headers.
    pub header_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Number of used blocks.
    pub used_blocks: usize,
    /// Offset one past the furthest byte ever claimed by an allocation.
    pub high_water: usize,
}
