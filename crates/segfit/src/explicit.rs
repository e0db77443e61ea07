//! Free-list allocator: free space tracked by a doubly linked list.
//!
//! This strategy threads a list through the payload bytes of free blocks,
//! so allocation searches only free blocks instead of the whole header
//! chain. Nodes exist only while a block is free; the two link words are
//! rewritten every time a block changes state. The links are stored as
//! header offsets from the segment base rather than raw pointers, which
//! keeps them meaningful in assertions and independent of where the
//! segment sits in memory.
//!
//! The list is ordered by recency of freeing, not by address, so the
//! first-fit search returns the most recently freed block that fits.
//! Coalescing still needs address-order neighbors, which come from header
//! arithmetic, not from the list.

use core::ptr::NonNull;

use log::{error, trace, warn};
use snafu::ensure;

use crate::{
    HEADER_SIZE, MAX_REQUEST, MIN_PAYLOAD, SegmentAlloc, SegmentStats,
    error::{AllocError, ExhaustedSnafu, InvalidRequestSnafu},
    segment::{self, Segment},
};

/// Sentinel offset meaning "no node".
///
/// `0` is a valid header offset, so the all-ones word stands in for the
/// absent link instead.
const NIL: usize = usize::MAX;

/// First-fit allocator over an explicit doubly linked free list.
#[derive(Debug)]
pub struct ExplicitAllocator {
    segment: Segment,
    /// Head of the free list, or [`NIL`] when the list is empty.
    head: usize,
    validate_every: usize,
    ops_since_validate: usize,
}

impl ExplicitAllocator {
    /// Creates an allocator owning the `len` bytes at `base`.
    ///
    /// See [`SegmentAlloc::new`] for the contract.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable region of at least `len` bytes that
    /// outlives the allocator and is not accessed by anything else.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        let segment = unsafe { Segment::new(base, len) };
        let mut alloc = Self {
            segment,
            head: NIL,
            validate_every: 0,
            ops_since_validate: 0,
        };
        // The initial free block is the sole list member.
        alloc.add_node(0);
        alloc
    }

    // The node of a free block overlays the first two payload words:
    // `next` at payload + 0, `prev` at payload + one word.

    fn node_next(&self, off: usize) -> usize {
        self.segment.read_word(off + HEADER_SIZE)
    }

    fn node_prev(&self, off: usize) -> usize {
        self.segment.read_word(off + 2 * HEADER_SIZE)
    }

    fn set_node_next(&mut self, off: usize, value: usize) {
        self.segment.write_word(off + HEADER_SIZE, value);
    }

    fn set_node_prev(&mut self, off: usize, value: usize) {
        self.segment.write_word(off + 2 * HEADER_SIZE, value);
    }

    /// Pushes the block at `off` onto the front of the free list.
    fn add_node(&mut self, off: usize) {
        if self.head == NIL {
            self.set_node_next(off, NIL);
        } else {
            self.set_node_next(off, self.head);
            self.set_node_prev(self.head, off);
        }
        self.set_node_prev(off, NIL);
        self.head = off;
    }

    /// Unlinks the block at `off`, leaving its own links cleared.
    fn remove_node(&mut self, off: usize) {
        let next = self.node_next(off);
        let prev = self.node_prev(off);
        match (prev, next) {
            // Sole element: the list becomes empty.
            (NIL, NIL) => self.head = NIL,
            // Head with a successor.
            (NIL, next) => {
                self.set_node_prev(next, NIL);
                self.head = next;
            }
            // Tail with a predecessor.
            (prev, NIL) => self.set_node_next(prev, NIL),
            // Interior element.
            (prev, next) => {
                self.set_node_next(prev, next);
                self.set_node_prev(next, prev);
            }
        }
        self.set_node_next(off, NIL);
        self.set_node_prev(off, NIL);
    }

    /// First list member with `size >= needed`, in insertion order.
    fn find_free(&self, needed: usize) -> Option<usize> {
        let mut off = self.head;
        while off != NIL {
            if self.segment.block_size(off) >= needed {
                return Some(off);
            }
            off = self.node_next(off);
        }
        None
    }

    /// Takes the block at `off` out of the free list, splitting off a free
    /// remainder when the leftover can host a standalone block.
    fn take(&mut self, off: usize, needed: usize) {
        let size = self.segment.block_size(off);
        self.remove_node(off);
        if size - needed >= HEADER_SIZE + MIN_PAYLOAD {
            let rest = off + HEADER_SIZE + needed;
            self.segment.write_header(rest, size - needed - HEADER_SIZE, true);
            self.segment.write_header(off, needed, false);
            self.add_node(rest);
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
        self.remove_node(right);
        self.segment
            .grow_block(off, HEADER_SIZE + self.segment.block_size(right));
    }

    /// Frees the block at `off`, merging free neighbors on both sides.
    fn release(&mut self, off: usize) {
        if self.can_coalesce(off) {
            self.coalesce(off);
        }
        self.segment.mark_free(off);
        // A free left neighbor is already on the list; absorbing this block
        // into it keeps adjacent blocks merged no matter which of the two
        // was freed first.
        if let Some(left) = self.segment.predecessor(off) {
            if self.segment.is_free(left) {
                self.segment
                    .grow_block(left, HEADER_SIZE + self.segment.block_size(off));
                return;
            }
        }
        self.add_node(off);
    }

    /// Shrinks the used block at `off` to `needed` bytes, freeing the
    /// remainder when it can stand alone.
    fn shrink(&mut self, off: usize, needed: usize) {
        let size = self.segment.block_size(off);
        if size - needed >= HEADER_SIZE + MIN_PAYLOAD {
            let rest = off + HEADER_SIZE + needed;
            self.segment.write_header(rest, size - needed - HEADER_SIZE, true);
            self.segment.write_header(off, needed, false);
            self.add_node(rest);
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
                error!("explicit allocator failed a periodic validation");
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

    /// Checks heap and free-list consistency; see [`SegmentAlloc::validate`].
    pub fn validate(&self) -> bool {
        if !self.segment.check_chain() {
            return false;
        }
        self.check_free_list()
    }

    /// Verifies that the free list is acyclic, mutually linked, and made of
    /// free blocks only. Logs the first violation; never panics.
    fn check_free_list(&self) -> bool {
        let max_blocks = self.segment.end() / (HEADER_SIZE + MIN_PAYLOAD) + 1;
        let mut steps = 0;
        let mut prev = NIL;
        let mut off = self.head;
        while off != NIL {
            if off + HEADER_SIZE + MIN_PAYLOAD > self.segment.end()
                || !off.is_multiple_of(HEADER_SIZE)
            {
                error!("free list links to bad offset {off:#x}");
                return false;
            }
            if !self.segment.is_free(off) {
                error!("free list member at {off:#x} is marked used");
                return false;
            }
            if self.node_prev(off) != prev {
                error!("free list back-link broken at {off:#x}");
                return false;
            }
            steps += 1;
            if steps > max_blocks {
                error!("free list contains a cycle");
                return false;
            }
            prev = off;
            off = self.node_next(off);
        }
        true
    }
}

impl SegmentAlloc for ExplicitAllocator {
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
