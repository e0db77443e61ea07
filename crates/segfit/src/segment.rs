//! Segment bookkeeping shared by both strategies.
//!
//! A [`Segment`] owns the raw byte buffer and is the only place that touches
//! it directly. Blocks are identified by the byte offset of their header
//! from the segment base; raw pointers appear only at the public boundary.
//! Offsets survive a segment being moved around in memory and make the
//! invariant assertions below cheap to state.

use core::ptr::{self, NonNull};

use log::error;

use crate::{ALIGNMENT, HEADER_SIZE, MIN_PAYLOAD, SegmentStats};

/// Stored in bit 0 of a header word; set while the block is free.
const FREE_BIT: usize = 1;

/// The managed memory region plus its block-header primitives.
///
/// Offsets handed to the methods below must name a live block header. That
/// holds by construction for offsets obtained from [`Segment::next_block`]
/// and friends; the assertions exist to catch bookkeeping bugs early, not
/// to validate caller input.
#[derive(Debug)]
pub(crate) struct Segment {
    base: NonNull<u8>,
    len: usize,
    high_water: usize,
}

impl Segment {
    /// Takes ownership of the `len` bytes at `base` and formats them as a
    /// single free block.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable region of at least `len` bytes that
    /// outlives the segment and is not accessed by anything else.
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        assert!(
            base.as_ptr().addr().is_multiple_of(ALIGNMENT),
            "segment base must be word-aligned"
        );
        assert!(
            len.is_multiple_of(ALIGNMENT),
            "segment length must be a multiple of the alignment unit"
        );
        assert!(
            len >= HEADER_SIZE + MIN_PAYLOAD,
            "segment too small for one block"
        );

        let mut segment = Self {
            base,
            len,
            high_water: 0,
        };
        segment.write_header(0, len - HEADER_SIZE, true);
        segment
    }

    /// Offset of the end sentinel, one past the last block.
    pub(crate) fn end(&self) -> usize {
        self.len
    }

    /// Offset one past the furthest byte ever claimed by an allocation.
    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }

    /// Records that bytes up to `end_off` have been claimed.
    pub(crate) fn note_claimed(&mut self, end_off: usize) {
        debug_assert!(end_off <= self.len);
        self.high_water = self.high_water.max(end_off);
    }

    fn header(&self, off: usize) -> *mut usize {
        assert!(off.is_multiple_of(ALIGNMENT), "misaligned header offset");
        assert!(off + HEADER_SIZE <= self.len, "header offset out of bounds");
        unsafe { self.base.as_ptr().add(off).cast::<usize>() }
    }

    /// Payload size of the block at `off`, free bit masked off.
    pub(crate) fn block_size(&self, off: usize) -> usize {
        unsafe { *self.header(off) & !FREE_BIT }
    }

    pub(crate) fn is_free(&self, off: usize) -> bool {
        unsafe { *self.header(off) & FREE_BIT == FREE_BIT }
    }

    /// Writes a fresh header at `off`.
    pub(crate) fn write_header(&mut self, off: usize, size: usize, free: bool) {
        assert!(
            size.is_multiple_of(ALIGNMENT) && size >= MIN_PAYLOAD,
            "bad block size {size}"
        );
        assert!(off + HEADER_SIZE + size <= self.len, "block overruns segment");
        unsafe {
            *self.header(off) = if free { size | FREE_BIT } else { size };
        }
    }

    pub(crate) fn mark_free(&mut self, off: usize) {
        unsafe {
            *self.header(off) |= FREE_BIT;
        }
    }

    pub(crate) fn mark_used(&mut self, off: usize) {
        unsafe {
            *self.header(off) &= !FREE_BIT;
        }
    }

    /// Extends the block at `off` by `extra` bytes, flag untouched.
    pub(crate) fn grow_block(&mut self, off: usize, extra: usize) {
        assert!(extra.is_multiple_of(ALIGNMENT));
        let new_size = self.block_size(off) + extra;
        assert!(off + HEADER_SIZE + new_size <= self.len, "block overruns segment");
        unsafe {
            *self.header(off) += extra;
        }
    }

    /// Offset of the block following `off`, or the end sentinel.
    pub(crate) fn next_block(&self, off: usize) -> usize {
        off + HEADER_SIZE + self.block_size(off)
    }

    /// Offset of the block preceding `off`, found by walking the chain.
    pub(crate) fn predecessor(&self, off: usize) -> Option<usize> {
        if off == 0 {
            return None;
        }
        let mut cur = 0;
        loop {
            let next = self.next_block(cur);
            if next == off {
                return Some(cur);
            }
            assert!(next < self.len, "block {off:#x} not on the header chain");
            cur = next;
        }
    }

    /// Payload address of the block at `off`.
    pub(crate) fn payload(&self, off: usize) -> NonNull<u8> {
        assert!(off + HEADER_SIZE + self.block_size(off) <= self.len);
        unsafe { self.base.add(off + HEADER_SIZE) }
    }

    /// Header offset of the block whose payload starts at `ptr`.
    pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr().addr();
        let base = self.base.as_ptr().addr();
        assert!(
            addr > base && addr < base + self.len,
            "pointer does not belong to this segment"
        );
        assert!(addr.is_multiple_of(ALIGNMENT), "misaligned payload pointer");
        addr - base - HEADER_SIZE
    }

    /// Reads one word at byte offset `off` (used for free-list nodes).
    pub(crate) fn read_word(&self, off: usize) -> usize {
        assert!(off.is_multiple_of(ALIGNMENT) && off + HEADER_SIZE <= self.len);
        unsafe { *self.base.as_ptr().add(off).cast::<usize>() }
    }

    /// Writes one word at byte offset `off` (used for free-list nodes).
    pub(crate) fn write_word(&mut self, off: usize, value: usize) {
        assert!(off.is_multiple_of(ALIGNMENT) && off + HEADER_SIZE <= self.len);
        unsafe {
            *self.base.as_ptr().add(off).cast::<usize>() = value;
        }
    }

    /// Copies `bytes` payload bytes from block `src` to block `dst`.
    pub(crate) fn copy_payload(&mut self, src: usize, dst: usize, bytes: usize) {
        assert!(src != dst);
        assert!(bytes <= self.block_size(src) && bytes <= self.block_size(dst));
        unsafe {
            // Distinct blocks never overlap.
            ptr::copy_nonoverlapping(
                self.payload(src).as_ptr(),
                self.payload(dst).as_ptr(),
                bytes,
            );
        }
    }

    /// Walks the header chain and tallies byte and block totals.
    pub(crate) fn stats(&self) -> SegmentStats {
        let mut stats = SegmentStats {
            free_bytes: 0,
            used_bytes: 0,
            header_bytes: 0,
            free_blocks: 0,
            used_blocks: 0,
            high_water: self.high_water,
        };
        let mut off = 0;
        while off < self.len {
            let size = self.block_size(off);
            stats.header_bytes += HEADER_SIZE;
            if self.is_free(off) {
                stats.free_bytes += size;
                stats.free_blocks += 1;
            } else {
                stats.used_bytes += size;
                stats.used_blocks += 1;
            }
            off = self.next_block(off);
        }
        stats
    }

    /// Checks the header-chain invariants, logging the first violation.
    ///
    /// Never panics and never mutates; corrupted headers are reported, not
    /// repaired.
    pub(crate) fn check_chain(&self) -> bool {
        let mut off = 0;
        let mut used_total = 0;
        while off < self.len {
            if off + HEADER_SIZE > self.len {
                error!("header at {off:#x} overruns the segment end");
                return false;
            }
            let size = self.block_size(off);
            if size < MIN_PAYLOAD || size > self.len || !size.is_multiple_of(ALIGNMENT) {
                error!("block at {off:#x} has bad size {size}");
                return false;
            }
            if !self.is_free(off) {
                used_total += size;
                if used_total > self.len {
                    error!("used bytes exceed the segment size");
                    return false;
                }
            }
            off += HEADER_SIZE + size;
        }
        if off != self.len {
            error!("header chain lands at {off:#x}, not the segment end");
            return false;
        }
        if self.high_water > self.len {
            error!("high-water mark {:#x} beyond segment end", self.high_water);
            return false;
        }
        true
    }
}

/// Rounds `n` up to the next multiple of `mult`, a power of two.
pub(crate) fn round_up(n: usize, mult: usize) -> usize {
    debug_assert!(mult.is_power_of_two());
    (n + mult - 1) & !(mult - 1)
}

/// Payload size carved out for a request of `requested` bytes.
///
/// Requests at or below the alignment unit take the minimum payload rather
/// than the alignment itself, so every block stays large enough to host a
/// free-list node once it is freed.
pub(crate) fn needed_size(requested: usize) -> usize {
    if requested <= ALIGNMENT {
        MIN_PAYLOAD
    } else {
        round_up(requested, ALIGNMENT)
    }
}
