extern crate std;

use super::*;
use boot_allocator::RegionKind;

#[test]
fn early_reservations_carve_the_map_in_order() {
    let mut map = MemoryMap::new();
    map.add_range(0x0, 0x1000, RegionKind::Reserved); // real-mode IVT etc.
    map.add_range(0x1000, 0x9F000, RegionKind::Free);
    map.add_range(0x100000, 0x700000, RegionKind::Free);

    let reservations = [
        EarlyReservation {
            begin: 0x100000,
            page_count: 0x200,
            tag: ReservationTag::KernelImage,
        },
        EarlyReservation {
            begin: 0x300000,
            page_count: 0x10,
            tag: ReservationTag::KernelModule,
        },
    ];

    let (map, heap_base) = reserve_early_ranges(map, &reservations, 0x40);

    // The heap landed in the lowest gap that fits it.
    assert_eq!(heap_base, 0x1000);

    let kinds: std::vec::Vec<_> = map.iter().map(|e| (e.begin, e.kind)).collect();
    assert!(kinds.contains(&(0x100000, RegionKind::KernelImage)));
    assert!(kinds.contains(&(0x300000, RegionKind::KernelModule)));
    assert!(kinds.contains(&(0x1000, RegionKind::InitialHeap)));

    // What's left over is still free and still normalized.
    assert!(kinds.contains(&(0x41000, RegionKind::Free)));
    for window in map.iter().zip(map.iter().skip(1)) {
        assert!(window.0.end() <= window.1.begin);
    }
}
