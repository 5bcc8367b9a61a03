extern crate std;

use super::*;

fn entry(begin: u64, length: u64, kind: RegionKind) -> MemoryMapEntry {
    MemoryMapEntry::new(begin, length, kind)
}

#[test]
fn ingestion_merges_same_kind_neighbors() {
    let mut map = MemoryMap::new();
    map.add_range(0x0000, 0x1000, RegionKind::Free);
    map.add_range(0x2000, 0x1000, RegionKind::Free);
    map.add_range(0x1000, 0x1000, RegionKind::Free);
    map.add_range(0x3000, 0x1000, RegionKind::Reserved);

    assert_eq!(map.entry_count(), 2);
    assert_eq!(*map.at(0), entry(0x0000, 0x3000, RegionKind::Free));
    assert_eq!(*map.at(1), entry(0x3000, 0x1000, RegionKind::Reserved));
}

#[test]
fn ingestion_keeps_order() {
    let mut map = MemoryMap::new();
    map.add_range(0x5000, 0x1000, RegionKind::Bad);
    map.add_range(0x1000, 0x1000, RegionKind::Free);
    map.add_range(0x3000, 0x1000, RegionKind::Reserved);

    let begins: std::vec::Vec<u64> = map.iter().map(|e| e.begin).collect();
    assert_eq!(begins, [0x1000, 0x3000, 0x5000]);
}

#[test]
fn shatter_reserves_lowest_suitable_gap() {
    let mut map = MemoryMap::new();
    map.add_range(0x0000, 0x2000, RegionKind::BootReserved);
    map.add_range(0x4000, 0x1000, RegionKind::Reserved);
    map.add_range(0x5000, 0x1000, RegionKind::Free);
    map.add_range(0x6000, 0x1000, RegionKind::Bad);

    let mut allocator = BootAllocator::new(map);
    let got = allocator.reserve_contiguous(1, 0x5000, 0xF000, ReservationTag::Generic);
    assert_eq!(got, 0x5000);

    let map = allocator.release();
    assert_eq!(map.entry_count(), 4);
    assert_eq!(*map.at(0), entry(0x0000, 0x2000, RegionKind::BootReserved));
    assert_eq!(*map.at(1), entry(0x4000, 0x1000, RegionKind::Reserved));
    assert_eq!(*map.at(2), entry(0x5000, 0x1000, RegionKind::BootReserved));
    assert_eq!(*map.at(3), entry(0x6000, 0x1000, RegionKind::Bad));
}

/// The full shatter/merge walk: five reservations against a map with
/// reserved and bad ranges interleaved, checking the exact final map.
#[test]
fn repeated_reservations_normalize_the_map() {
    let mut map = MemoryMap::new();
    map.add_range(0x0000, 0x1000, RegionKind::BootReserved);
    map.add_range(0x1000, 0x1000, RegionKind::Free); // merges backwards once reserved
    map.add_range(0x4000, 0x1000, RegionKind::Reserved);
    map.add_range(0x5000, 0x1000, RegionKind::Free); // fully consumed
    map.add_range(0x6000, 0x1000, RegionKind::Bad);
    map.add_range(0x7000, 0x1000, RegionKind::Reserved);
    map.add_range(0x8000, 0x2000, RegionKind::Free); // lower half consumed
    map.add_range(0xA000, 0x1000, RegionKind::Bad);
    map.add_range(0xB000, 0x1000, RegionKind::Reserved);
    map.add_range(0xC000, 0x2000, RegionKind::Free); // upper half consumed
    map.add_range(0xE000, 0x1000, RegionKind::Bad);
    map.add_range(0x10000, 0x3000, RegionKind::Free); // middle consumed

    let mut allocator = BootAllocator::new(map);

    assert_eq!(allocator.reserve_contiguous(1, 0x1000, 0x2000, ReservationTag::Generic), 0x1000);
    assert_eq!(allocator.reserve_contiguous(1, 0x1000, 0xF0000, ReservationTag::Generic), 0x5000);
    assert_eq!(allocator.reserve_contiguous(1, 0x1000, 0xF0000, ReservationTag::Generic), 0x8000);
    assert_eq!(allocator.reserve_contiguous(1, 0xD000, 0xF0000, ReservationTag::Generic), 0xD000);
    assert_eq!(allocator.reserve_contiguous(1, 0x11000, 0xF0000, ReservationTag::Generic), 0x11000);

    let map = allocator.release();
    assert_eq!(map.entry_count(), 15);
    assert_eq!(*map.at(0), entry(0x0000, 0x2000, RegionKind::BootReserved));
    assert_eq!(*map.at(1), entry(0x4000, 0x1000, RegionKind::Reserved));
    assert_eq!(*map.at(2), entry(0x5000, 0x1000, RegionKind::BootReserved));
    assert_eq!(*map.at(3), entry(0x6000, 0x1000, RegionKind::Bad));
    assert_eq!(*map.at(4), entry(0x7000, 0x1000, RegionKind::Reserved));
    assert_eq!(*map.at(5), entry(0x8000, 0x1000, RegionKind::BootReserved));
    assert_eq!(*map.at(6), entry(0x9000, 0x1000, RegionKind::Free));
    assert_eq!(*map.at(7), entry(0xA000, 0x1000, RegionKind::Bad));
    assert_eq!(*map.at(8), entry(0xB000, 0x1000, RegionKind::Reserved));
    assert_eq!(*map.at(9), entry(0xC000, 0x1000, RegionKind::Free));
    assert_eq!(*map.at(10), entry(0xD000, 0x1000, RegionKind::BootReserved));
    assert_eq!(*map.at(11), entry(0xE000, 0x1000, RegionKind::Bad));
    assert_eq!(*map.at(12), entry(0x10000, 0x1000, RegionKind::Free));
    assert_eq!(*map.at(13), entry(0x11000, 0x1000, RegionKind::BootReserved));
    assert_eq!(*map.at(14), entry(0x12000, 0x1000, RegionKind::Free));
}

#[test]
fn exact_window_fits() {
    let mut map = MemoryMap::new();
    map.add_range(0x5000, 0x3000, RegionKind::Free);

    let mut allocator = BootAllocator::new(map);
    // lower + pages * 4K == upper: succeeds and leaves no residue below.
    assert_eq!(allocator.reserve_contiguous(2, 0x5000, 0x7000, ReservationTag::InitialHeap), 0x5000);
    let map = allocator.release();
    assert_eq!(*map.at(0), entry(0x5000, 0x2000, RegionKind::InitialHeap));
    assert_eq!(*map.at(1), entry(0x7000, 0x1000, RegionKind::Free));
}

#[test]
#[should_panic]
fn window_too_small_is_fatal() {
    let mut map = MemoryMap::new();
    map.add_range(0x5000, 0x3000, RegionKind::Free);

    let mut allocator = BootAllocator::new(map);
    allocator.reserve_contiguous(3, 0x5000, 0x7000, ReservationTag::Generic);
}

#[test]
#[should_panic]
fn inverted_window_is_fatal() {
    let mut map = MemoryMap::new();
    map.add_range(0x5000, 0x3000, RegionKind::Free);

    let mut allocator = BootAllocator::new(map);
    allocator.reserve_contiguous(1, 0x7000, 0x5000, ReservationTag::Generic);
}

#[test]
fn reserve_at_is_exact() {
    let mut map = MemoryMap::new();
    map.add_range(0x0000, 0x10000, RegionKind::Free);

    let mut allocator = BootAllocator::new(map);
    assert_eq!(allocator.reserve_at(0x4000, 2, ReservationTag::KernelImage), 0x4000);

    let map = allocator.release();
    assert_eq!(*map.at(0), entry(0x0000, 0x4000, RegionKind::Free));
    assert_eq!(*map.at(1), entry(0x4000, 0x2000, RegionKind::KernelImage));
    assert_eq!(*map.at(2), entry(0x6000, 0xA000, RegionKind::Free));
}

/// All reservations land inside the requested window, and the map stays
/// sorted and merge-normalized after every operation.
#[test]
fn map_invariants_hold_after_every_reservation() {
    let mut map = MemoryMap::new();
    map.add_range(0x0000, 0x40000, RegionKind::Free);
    map.add_range(0x40000, 0x1000, RegionKind::Reserved);
    map.add_range(0x41000, 0x40000, RegionKind::Free);

    let mut allocator = BootAllocator::new(map);
    for i in 0..12u64 {
        let addr = allocator.reserve_contiguous(
            i + 1,
            0x1000 * i,
            0x90000,
            ReservationTag::Generic,
        );
        assert!(addr >= 0x1000 * i);
        assert!(addr + (i + 1) * 0x1000 <= 0x90000);

        let map = allocator.map();
        for w in 0..map.entry_count().saturating_sub(1) {
            let (a, b) = (map.at(w), map.at(w + 1));
            assert!(a.begin < b.begin, "map not sorted: {:?}", map);
            assert!(a.end() <= b.begin, "map overlaps: {:?}", map);
            assert!(
                a.end() < b.begin || a.kind != b.kind,
                "unmerged neighbors: {:?}",
                map,
            );
        }
        for e in map.iter() {
            assert!(e.length > 0, "empty entry in {:?}", map);
        }
    }
}
