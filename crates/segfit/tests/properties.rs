//! Property suite exercising both strategies through the shared contract.
//!
//! Every check is written against [`SegmentAlloc`] and instantiated once per
//! strategy, so the two allocators are held to identical behavior.

use core::ptr::NonNull;

use segfit::{
    ALIGNMENT, HEADER_SIZE, MAX_REQUEST, MIN_PAYLOAD, SegmentAlloc, error::AllocError,
    explicit::ExplicitAllocator, implicit::ImplicitAllocator,
};

/// Runs `test_fn` on a fresh allocator over a word-aligned heap of `len`
/// bytes.
fn with_heap<A, F>(len: usize, test_fn: F)
where
    A: SegmentAlloc,
    F: FnOnce(&mut A),
{
    assert!(len.is_multiple_of(8));
    let mut buf = vec![0_u64; len / 8];
    let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
    let mut alloc = unsafe { A::new(base, len) };
    test_fn(&mut alloc);
}

/// Payload capacity the allocator must reserve for a request.
fn rounded(requested: usize) -> usize {
    if requested <= ALIGNMENT {
        MIN_PAYLOAD
    } else {
        requested.next_multiple_of(ALIGNMENT)
    }
}

unsafe fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        unsafe {
            ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8));
        }
    }
}

unsafe fn assert_pattern(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        let got = unsafe { ptr.as_ptr().add(i).read() };
        assert_eq!(got, seed.wrapping_add(i as u8), "byte {i} clobbered");
    }
}

/// Free + used + header bytes always account for the whole segment.
fn assert_conservation<A: SegmentAlloc>(alloc: &A, len: usize) {
    let stats = alloc.stats();
    assert_eq!(
        stats.free_bytes + stats.used_bytes + stats.header_bytes,
        len,
        "segment bytes unaccounted for"
    );
    assert!(alloc.validate());
}

fn round_trip<A: SegmentAlloc>() {
    for size in [1, 2, 7, 8, 15, 16, 17, 64, 200, 1000] {
        with_heap::<A, _>(4096, |alloc| unsafe {
            let left = alloc.allocate(48).unwrap();
            let mid = alloc.allocate(size).unwrap();
            let right = alloc.allocate(48).unwrap();

            fill(left, 48, 0x10);
            fill(mid, size, 0x20);
            fill(right, 48, 0x30);

            alloc.free(mid.as_ptr());

            // Live neighbors survive the free untouched.
            assert_pattern(left, 48, 0x10);
            assert_pattern(right, 48, 0x30);
            assert_conservation(alloc, 4096);
        });
    }
}

fn no_overlap<A: SegmentAlloc>() {
    with_heap::<A, _>(4096, |alloc| unsafe {
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        let sizes = [16, 100, 1, 64, 333, 8, 48, 200];

        for (i, &size) in sizes.iter().enumerate() {
            let ptr = alloc.allocate(size).unwrap();
            live.push((ptr, rounded(size)));
            // Free every third allocation to churn the free space.
            if i % 3 == 2 {
                let (victim, _) = live.remove(i / 3);
                alloc.free(victim.as_ptr());
            }

            for (a, &(pa, la)) in live.iter().enumerate() {
                for &(pb, lb) in &live[a + 1..] {
                    let a_start = pa.as_ptr().addr();
                    let b_start = pb.as_ptr().addr();
                    let disjoint = a_start + la <= b_start || b_start + lb <= a_start;
                    assert!(disjoint, "live blocks overlap");
                }
            }
            assert_conservation(alloc, 4096);
        }
    });
}

fn coalescing_closes_gaps<A: SegmentAlloc>() {
    // Segment sized for exactly three 64-byte blocks, no remainder.
    let len = 3 * (HEADER_SIZE + 64);

    for left_first in [true, false] {
        with_heap::<A, _>(len, |alloc| unsafe {
            let a = alloc.allocate(64).unwrap();
            let b = alloc.allocate(64).unwrap();
            let guard = alloc.allocate(64).unwrap();

            if left_first {
                alloc.free(a.as_ptr());
                alloc.free(b.as_ptr());
            } else {
                alloc.free(b.as_ptr());
                alloc.free(a.as_ptr());
            }

            // Either order leaves one free block spanning both payloads
            // plus the reclaimed header.
            let stats = alloc.stats();
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, 64 + HEADER_SIZE + 64);

            // The span is allocatable in one piece, at `a`'s address.
            assert_eq!(alloc.allocate(64 + HEADER_SIZE + 64).unwrap(), a);
            assert_conservation(alloc, len);

            alloc.free(guard.as_ptr());
        });
    }
}

fn shrink_then_grow_keeps_the_prefix<A: SegmentAlloc>() {
    for small in [16, 40, 100] {
        with_heap::<A, _>(1024, |alloc| unsafe {
            let p = alloc.allocate(128).unwrap();
            fill(p, 128, 0x40);

            let q = alloc.resize(p.as_ptr(), small).unwrap();
            assert_eq!(q, p, "shrink must not move the block");

            let r = alloc.resize(q.as_ptr(), 128).unwrap();
            assert_eq!(r, p, "regrowth into the remainder must not move");
            assert_pattern(r, small, 0x40);
            assert_conservation(alloc, 1024);
        });
    }
}

fn grow_relocates_when_blocked<A: SegmentAlloc>() {
    with_heap::<A, _>(4096, |alloc| unsafe {
        let p = alloc.allocate(64).unwrap();
        let blocker = alloc.allocate(16).unwrap();
        fill(p, 64, 0x50);
        fill(blocker, 16, 0x60);

        let q = alloc.resize(p.as_ptr(), 256).unwrap();
        assert_ne!(q, p, "a used right neighbor forces relocation");
        assert_pattern(q, 64, 0x50);
        assert_pattern(blocker, 16, 0x60);

        // The old block is free again.
        assert_eq!(alloc.allocate(64).unwrap(), p);
        assert_conservation(alloc, 4096);
    });
}

fn resize_edge_cases<A: SegmentAlloc>() {
    with_heap::<A, _>(1024, |alloc| unsafe {
        // Null pointer, zero size: nothing to do.
        assert!(matches!(
            alloc.resize(core::ptr::null_mut(), 0),
            Err(AllocError::InvalidRequest { size: 0, .. })
        ));

        // Null pointer, positive size: plain allocation.
        let p = alloc.resize(core::ptr::null_mut(), 64).unwrap();
        assert_eq!(alloc.stats().used_blocks, 1);

        // Live pointer, zero size: the block is freed.
        assert!(matches!(
            alloc.resize(p.as_ptr(), 0),
            Err(AllocError::InvalidRequest { size: 0, .. })
        ));
        assert_eq!(alloc.stats().used_blocks, 0);
        assert_conservation(alloc, 1024);
    });
}

fn exhaustion_boundary<A: SegmentAlloc>() {
    // Room for exactly eight 24-byte blocks.
    let len = 8 * (HEADER_SIZE + 24);
    with_heap::<A, _>(len, |alloc| unsafe {
        let blocks: Vec<_> = (0..8).map(|_| alloc.allocate(24).unwrap()).collect();
        assert_eq!(alloc.stats().free_blocks, 0);

        assert!(matches!(
            alloc.allocate(24),
            Err(AllocError::Exhausted { needed: 24, .. })
        ));

        // Freeing one block makes a same-sized request succeed again.
        alloc.free(blocks[3].as_ptr());
        assert_eq!(alloc.allocate(24).unwrap(), blocks[3]);

        assert!(alloc.allocate(24).is_err());
        assert_conservation(alloc, len);
    });
}

fn invalid_requests<A: SegmentAlloc>() {
    with_heap::<A, _>(1024, |alloc| {
        assert!(matches!(
            alloc.allocate(0),
            Err(AllocError::InvalidRequest { size: 0, .. })
        ));
        assert!(matches!(
            alloc.allocate(MAX_REQUEST + 1),
            Err(AllocError::InvalidRequest { .. })
        ));
        // Errors leave the heap untouched.
        assert_eq!(alloc.stats().used_blocks, 0);
        assert_conservation(alloc, 1024);
    });
}

fn free_null_is_a_no_op<A: SegmentAlloc>() {
    with_heap::<A, _>(1024, |alloc| unsafe {
        alloc.free(core::ptr::null_mut());
        assert_conservation(alloc, 1024);
    });
}

/// The concrete walkthrough: 1024-byte segment, 8-byte headers, 16-byte
/// minimum payload.
fn first_fit_reuse_scenario<A: SegmentAlloc>() {
    with_heap::<A, _>(1024, |alloc| unsafe {
        let p = alloc.allocate(10).unwrap();
        assert_eq!(alloc.stats().used_bytes, MIN_PAYLOAD);

        // Larger than anything the segment could ever hold.
        assert!(alloc.allocate(4096).is_err());

        alloc.free(p.as_ptr());
        assert_eq!(alloc.allocate(16).unwrap(), p, "first fit reuses the block");
    });
}

fn churn_stays_consistent<A: SegmentAlloc>() {
    with_heap::<A, _>(8192, |alloc| unsafe {
        alloc.set_validate_every(1);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        for round in 0_u8..6 {
            for (i, size) in [24, 7, 120, 64, 1, 300].into_iter().enumerate() {
                let seed = round.wrapping_mul(31).wrapping_add(i as u8);
                let ptr = alloc.allocate(size).unwrap();
                fill(ptr, size, seed);
                live.push((ptr, size, seed));
            }
            // Free half, oldest first, and re-check the survivors.
            for (ptr, _, _) in live.drain(..3) {
                alloc.free(ptr.as_ptr());
            }
            for &(ptr, size, seed) in &live {
                assert_pattern(ptr, size, seed);
            }
            assert_conservation(alloc, 8192);
        }
    });
}

macro_rules! strategy_suite {
    ($name:ident, $ty:ty) => {
        mod $name {
            use super::*;

            #[test]
            fn round_trip() {
                super::round_trip::<$ty>();
            }

            #[test]
            fn no_overlap() {
                super::no_overlap::<$ty>();
            }

            #[test]
            fn coalescing_closes_gaps() {
                super::coalescing_closes_gaps::<$ty>();
            }

            #[test]
            fn shrink_then_grow_keeps_the_prefix() {
                super::shrink_then_grow_keeps_the_prefix::<$ty>();
            }

            #[test]
            fn grow_relocates_when_blocked() {
                super::grow_relocates_when_blocked::<$ty>();
            }

            #[test]
            fn resize_edge_cases() {
                super::resize_edge_cases::<$ty>();
            }

            #[test]
            fn exhaustion_boundary() {
                super::exhaustion_boundary::<$ty>();
            }

            #[test]
            fn invalid_requests() {
                super::invalid_requests::<$ty>();
            }

            #[test]
            fn free_null_is_a_no_op() {
                super::free_null_is_a_no_op::<$ty>();
            }

            #[test]
            fn first_fit_reuse_scenario() {
                super::first_fit_reuse_scenario::<$ty>();
            }

            #[test]
            fn churn_stays_consistent() {
                super::churn_stays_consistent::<$ty>();
            }
        }
    };
}

strategy_suite!(implicit, ImplicitAllocator);
strategy_suite!(explicit, ExplicitAllocator);
