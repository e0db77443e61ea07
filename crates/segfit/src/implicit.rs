//! Header-scan allocator: free space tracked by the headers alone.
//!
//! This strategy keeps no structure besides the block headers themselves.
//! Allocation walks the header chain from the segment start and takes the
//! first free block that fits; freeing a block flips its header flag and
//! merges it with free neighbors. Search cost is O(n) in the number of
//! blocks, free or used, but the bookkeeping on every transition is a
//! single word write.

use core::ptr::NonNull;

use log::{error, trace, warn};
use snafu::ensure;

use crate::{
    HEADER_SIZE, MAX_REQUEST, MIN_PAYLOAD, SegmentAlloc, SegmentStats,
    error::{AllocError, ExhaustedSnafu, InvalidRequestSnafu},
    segment::{self, Segment},
};

/// First-fit allocator that scans the header chain for free space.
#[derive(Debug)]
pub struct ImplicitAllocator {
    segment: Segment,
    validate_every: usize,
    ops_since_validate: usize,
}

impl ImplicitAllocator {
    /// Creates an allocator owning the `len` bytes at `base`.
    ///
    /// See [`SegmentAlloc::new`] for the contract.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable region of at least `len` bytes that
    /// outlives the allocator and is not accessed by anything else.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self {
            segment: unsafe { Segment::new(base, len) },
            validate_every: 0,
            ops_since_validate: 0,
        }
    }

    /// First free block with `size >= needed`, in address order.
    fn find_free(&self, needed: usize) -> Option<usize> {
        let mut off = 0;
        while off < self.segment.end() {
            if self.segment.is_free(off) && self.segment.block_size(off) >= needed {
                return Some(off);
            }
            off = self.segment.next_block(off);
        }
        None
    }

    /// Marks the block at `off` used, splitting off a free remainder when
    /// the leftover can host a standalone block.
    fn take(&mut self, off: usize, needed: usize) {
        let size = self.segment.block_size(off);
        if size - needed >= HEADER_SIZE + MIN_PAYLOAD {
            let rest = off + HEADER_SIZE + needed;
            self.segment.write_header(rest, size - needed - HEADER_SIZE, true);
            self.segment.write_header(off, needed, false);
        } else {
            // Remainder too small for its own header and payload; hand out
            // the whole block and accept the internal fragmentation.
            self.segment.mark_used(off);
        }
        self.segment.note_claimed(self.segment.next_block(off));
    }

    /// True when the block to the right of `off` exists and is free.
    fn can_coalesce(&self, off: usize) -> bool {
        let right = self.segment.next_block(off);
        right != self.segment.end() && self.segment.is_free(right)
    }

    /// Absorbs the free block to the right of `off`, flag untouched.
    fn coalesce(&mut self, off: usize) {
        let right = self.segment.next_block(off);
        self.segment
            .grow_block(off, HEADER_SIZE + self.segment.block_size(right));
    }

    /// Frees the block at `off`, merging free neighbors on both sides.
    fn release(&mut self, off: usize) {
        if self.can_coalesce(off) {
            self.coalesce(off);
        }
        self.segment.mark_free(off);
        // A free left neighbor absorbs this block, so adjacent blocks end
        // up merged no matter which of the two was freed first.
        if let Some(left) = self.segment.predecessor(off) {
            if self.segment.is_free(left) {
                self.segment
                    .grow_block(left, HEADER_SIZE + self.segment.block_size(off));
            }
        }
    }

    /// Shrinks the used block at `off` to `needed` bytes, freeing the
    /// remainder when it can stand alone.
    fn shrink(&mut self, off: usize, needed: usize) {
        let size = self.segment.block_size(off);
        if size - needed >= HEADER_SIZE + MIN_PAYLOAD {
            let rest = off + HEADER_SIZE + needed;
            self.segment.write_header(rest, size - needed - HEADER_SIZE, true);
            self.segment.write_header(off, needed, false);
        }
    }

    fn after_mutation(&mut self) {
        if self.validate_every == 0 {
            return;
        }
        self.ops_since_validate += 1;
        if self.ops_since_validate >= self.validate_every {
            self.ops_since_validate = 0;
            if !self.validate() {
                error!("implicit allocator failed a periodic validation");
            }
        }
    }

    /// Allocates a block with at least `size` bytes of payload.
    ///
    /// See [`SegmentAlloc::allocate`] for the contract.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        ensure!(
            size > 0 && size <= MAX_REQUEST,
            InvalidRequestSnafu { size }
        );
        let needed = segment::needed_size(size);
        let Some(off) = self.find_free(needed) else {
            warn!("segment exhausted: no free block holds {needed} bytes");
            return ExhaustedSnafu { needed }.fail();
        };
        self.take(off, needed);
        trace!(
            "allocate: needed={needed} block={off:#x} size={}",
            self.segment.block_size(off)
        );
        self.after_mutation();
        Ok(self.segment.payload(off))
    }

    /// Frees a previously allocated block. A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// See [`SegmentAlloc::free`].
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let off = self.segment.block_of(ptr);
        self.release(off);
        trace!("free: block={off:#x}");
        self.after_mutation();
    }

    /// Resizes a block, preferring in-place shrink or growth.
    ///
    /// # Safety
    ///
    /// See [`SegmentAlloc::resize`].
    pub unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(old) = NonNull::new(ptr) else {
            ensure!(new_size > 0, InvalidRequestSnafu { size: new_size });
            return self.allocate(new_size);
        };
        if new_size == 0 {
            unsafe {
                self.free(old.as_ptr());
            }
            return InvalidRequestSnafu { size: new_size }.fail();
        }
        ensure!(new_size <= MAX_REQUEST, InvalidRequestSnafu { size: new_size });

        let off = self.segment.block_of(old);
        let old_size = self.segment.block_size(off);
        let needed = segment::needed_size(new_size);

        if needed <= old_size {
            self.shrink(off, needed);
            self.after_mutation();
            return Ok(old);
        }

        // Grow in place by absorbing free right neighbors; move only when
        // that runs out of room.
        while self.segment.block_size(off) < needed {
            if self.can_coalesce(off) {
                self.coalesce(off);
            } else {
                let new_ptr = self.allocate(new_size)?;
                let new_off = self.segment.block_of(new_ptr);
                self.segment
                    .copy_payload(off, new_off, old_size.min(new_size));
                self.release(off);
                self.after_mutation();
                return Ok(new_ptr);
            }
        }
        self.shrink(off, needed);
        // Claim only the grown block, not a split-off free remainder.
        self.segment.note_claimed(self.segment.next_block(off));
        self.after_mutation();
        Ok(old)
    }

    /// Checks heap consistency; see [`SegmentAlloc::validate`].
    pub fn validate(&self) -> bool {
        self.segment.check_chain()
    }
}

impl SegmentAlloc for ImplicitAllocator {
    unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        unsafe { Self::new(base, len) }
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::allocate(self, size)
    }

    unsafe fn free(&mut self, ptr: *mut u8) {
        unsafe { Self::free(self, ptr) }
    }

    unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        unsafe { Self::resize(self, ptr, new_size) }
    }

    fn validate(&self) -> bool {
        Self::validate(self)
    }

    fn set_validate_every(&mut self, every: usize) {
        self.validate_every = every;
        self.ops_since_validate = 0;
    }

    fn stats(&self) -> SegmentStats {
        self.segment.stats()
    }
}
