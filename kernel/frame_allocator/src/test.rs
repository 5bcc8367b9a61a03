extern crate std;

use super::*;
use boot_allocator::MemoryMap;
use core::sync::atomic::{AtomicU64, Ordering};
use std::boxed::Box;
use std::vec;

/// "Physical" memory for tests: a leaked in-process buffer registered as
/// the linear mapping, carved into disjoint per-test ranges.
const ARENA_BYTES: usize = 4 * 1024 * 1024;
static NEXT_PHYS: AtomicU64 = AtomicU64::new(0);

fn arena_init() {
    static ARENA: spin::Once<()> = spin::Once::new();
    ARENA.call_once(|| {
        let buffer = vec![0u8; ARENA_BYTES + PAGE_SIZE].leak();
        let base = (buffer.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        linear_map::init(memory_structs::VirtualAddress::new_canonical(base));
    });
}

/// Takes `pages` fresh pages of fake physical memory and returns an
/// allocator over exactly that range.
fn allocator_over(pages: usize) -> &'static FrameAllocator {
    arena_init();
    let bytes = (pages * PAGE_SIZE) as u64;
    let begin = NEXT_PHYS.fetch_add(bytes, Ordering::SeqCst);
    assert!(begin + bytes <= ARENA_BYTES as u64, "test arena exhausted");

    let mut map = MemoryMap::new();
    map.add_range(begin, bytes, RegionKind::Free);
    Box::leak(Box::new(FrameAllocator::from_memory_map(&map)))
}

#[test]
fn allocates_distinct_zeroed_frames() {
    let allocator = allocator_over(8);

    let a = allocator.allocate();
    let b = allocator.allocate();
    assert_ne!(a.frame(), b.frame());

    // Frames come back zeroed, even after carrying data.
    unsafe {
        let p = linear_map::frame_as_ptr(a.frame());
        core::ptr::write_bytes(p, 0xAB, PAGE_SIZE);
    }
    let recycled = a.frame();
    drop(a);
    let c = allocator.allocate();
    // The hint means `c` is not necessarily the recycled frame; force a
    // wrap by exhausting the region.
    let mut held = vec![b, c];
    while allocator.free_count() > 0 {
        held.push(allocator.allocate());
    }
    let reused = held.iter().find(|f| f.frame() == recycled).expect("recycled frame not reused");
    let bytes = unsafe {
        core::slice::from_raw_parts(linear_map::frame_as_ptr(reused.frame()), PAGE_SIZE)
    };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn bitmap_invariant_holds_through_churn() {
    let allocator = allocator_over(70); // spans two bitmap words

    let mut held = vec![];
    for _ in 0..70 {
        held.push(allocator.allocate());
    }
    assert_eq!(allocator.free_count(), 0);
    for region in allocator.regions() {
        assert!(region.verify_bitmap_invariant());
    }

    // Free every third frame, then reallocate them.
    let mut kept = vec![];
    for (i, frame) in held.into_iter().enumerate() {
        if i % 3 == 0 {
            drop(frame);
        } else {
            kept.push(frame);
        }
    }
    for region in allocator.regions() {
        assert!(region.verify_bitmap_invariant());
    }
    while allocator.free_count() > 0 {
        kept.push(allocator.allocate());
    }
    for region in allocator.regions() {
        assert!(region.verify_bitmap_invariant());
    }
}

#[test]
fn hint_makes_allocation_sequential() {
    let allocator = allocator_over(8);

    let a = allocator.allocate();
    let b = allocator.allocate();
    let c = allocator.allocate();
    assert_eq!(b.frame() - a.frame(), 1);
    assert_eq!(c.frame() - b.frame(), 1);

    // Freeing an early frame doesn't move the hint backwards...
    let a_frame = a.frame();
    drop(a);
    let d = allocator.allocate();
    assert_eq!(d.frame() - c.frame(), 1);

    // ...but the scan wraps around once the tail is exhausted.
    let _rest: std::vec::Vec<_> = (0..4).map(|_| allocator.allocate()).collect();
    let wrapped = allocator.allocate();
    assert_eq!(wrapped.frame(), a_frame);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let allocator = allocator_over(4);
    let a = allocator.allocate();
    let frame = a.frame();
    drop(a);
    // Freeing again through the region directly simulates a stale handle.
    allocator.regions()[0].free(frame);
}

#[test]
#[should_panic(expected = "out of physical memory")]
fn exhaustion_is_fatal() {
    let allocator = allocator_over(2);
    let _a = allocator.allocate();
    let _b = allocator.allocate();
    let _c = allocator.allocate();
}

#[test]
fn region_construction_trims_and_clamps() {
    // Unaligned begin and length: both ends are trimmed inward.
    let mut map = MemoryMap::new();
    map.add_range(0x1200, 0x3000, RegionKind::Free);
    let allocator = FrameAllocator::from_memory_map(&map);
    assert_eq!(allocator.regions().len(), 1);
    assert_eq!(allocator.regions()[0].base_address().value(), 0x2000);
    assert_eq!(allocator.regions()[0].page_count(), 2);

    // Sub-page residue disappears.
    let mut map = MemoryMap::new();
    map.add_range(0x1100, 0xE00, RegionKind::Free);
    let allocator = FrameAllocator::from_memory_map(&map);
    assert!(allocator.regions().is_empty());

    // Non-free entries contribute nothing.
    let mut map = MemoryMap::new();
    map.add_range(0x0000, 0x10000, RegionKind::Reserved);
    map.add_range(0x10000, 0x10000, RegionKind::KernelImage);
    let allocator = FrameAllocator::from_memory_map(&map);
    assert!(allocator.regions().is_empty());

    // Entries beyond the ceiling are clamped away.
    let mut map = MemoryMap::new();
    map.add_range(MAX_PHYSICAL_ADDRESS, 0x10000, RegionKind::Free);
    let allocator = FrameAllocator::from_memory_map(&map);
    assert!(allocator.regions().is_empty());
}

#[test]
fn leak_transfers_ownership() {
    let allocator = allocator_over(2);
    let before = allocator.free_count();
    let frame = allocator.allocate().leak();
    assert_eq!(allocator.free_count(), before - 1);
    // The frame stays allocated; freeing it manually is the new owner's job.
    allocator.regions().iter().find(|r| r.contains(frame)).unwrap().free(frame);
    assert_eq!(allocator.free_count(), before);
}
