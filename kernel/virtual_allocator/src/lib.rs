//! An ordered, coalescing allocator for virtual address ranges.
//!
//! Each address space owns one [`VirtualAllocator`] over its arena. The
//! allocator tracks the set of *allocated* ranges in an ordered map keyed
//! by range start; free space is the complement. Two invariants are
//! maintained eagerly on every mutation:
//!
//! * no two tracked ranges overlap, and
//! * no two tracked ranges touch: touching neighbors are merged on both
//!   allocation and deallocation, so the set stays minimal.
//!
//! All sizing failures are fatal: the callers (kernel mappings, region
//! creation) have no way to proceed without their address range.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use core::fmt;

use kernel_config::memory::PAGE_SIZE;
use log::trace;
use memory_structs::{VirtualAddress, VirtualRange};
use sync_irq::IrqSafeMutex;

pub struct VirtualAllocator {
    inner: IrqSafeMutex<Inner>,
}

struct Inner {
    base_range: VirtualRange,
    /// Allocated ranges keyed by their start address.
    allocated: BTreeMap<VirtualAddress, VirtualRange>,
}

impl VirtualAllocator {
    /// Creates an allocator over the arena `[begin, end)`.
    pub fn new(begin: VirtualAddress, end: VirtualAddress) -> VirtualAllocator {
        assert!(begin.is_page_aligned() && end.is_page_aligned());
        VirtualAllocator {
            inner: IrqSafeMutex::new(Inner {
                base_range: VirtualRange::new(begin, end),
                allocated: BTreeMap::new(),
            }),
        }
    }

    /// Replaces the arena and forgets all allocations. Used once during
    /// kernel bring-up when the final kernel arena bounds become known.
    pub fn reset_to(&self, begin: VirtualAddress, end: VirtualAddress) {
        assert!(begin.is_page_aligned() && end.is_page_aligned());
        let mut inner = self.inner.lock();
        inner.base_range = VirtualRange::new(begin, end);
        inner.allocated.clear();
    }

    /// Allocates `length` bytes (rounded up to whole pages) at the lowest
    /// suitably aligned free gap. `alignment` is raised to at least a page
    /// and must be a power of two.
    pub fn allocate(&self, length: usize, alignment: usize) -> VirtualRange {
        assert!(length != 0, "VirtualAllocator: zero-length allocation");

        let alignment = core::cmp::max(alignment, PAGE_SIZE);
        assert!(alignment.is_power_of_two());

        let rounded = length
            .checked_add(PAGE_SIZE - 1)
            .map(|l| l & !(PAGE_SIZE - 1))
            .unwrap_or_else(|| {
                panic!("VirtualAllocator: length overflow (length {:#X})", length)
            });

        let mut inner = self.inner.lock();

        let mut gap_begin = inner.base_range.start();
        let mut placed: Option<VirtualRange> = None;

        for range in inner.allocated.values() {
            if let Some(fit) = try_place(gap_begin, range.start(), rounded, alignment) {
                placed = Some(fit);
                break;
            }
            gap_begin = range.end();
        }
        let placed = placed
            .or_else(|| try_place(gap_begin, inner.base_range.end(), rounded, alignment))
            .unwrap_or_else(|| {
                panic!(
                    "VirtualAllocator: failed to allocate {:#X} bytes aligned to {:#X} in {:?}",
                    rounded, alignment, inner.base_range,
                )
            });

        trace!("virtual_allocator: allocated {:?}", placed);
        inner.insert_merged(placed);
        placed
    }

    /// Reserves an explicit range, expanded outward to page boundaries.
    /// Any overlap with an existing allocation is fatal.
    pub fn allocate_specific(&self, range: VirtualRange) -> VirtualRange {
        assert!(!range.is_empty(), "VirtualAllocator: empty specific allocation");

        let begin = range.start().align_down_to_page();
        let end = range
            .end()
            .align_up_to_page()
            .unwrap_or_else(|| panic!("VirtualAllocator: range end overflow: {:?}", range));
        let range = VirtualRange::new(begin, end);

        let mut inner = self.inner.lock();
        assert!(
            inner.base_range.contains_range(&range),
            "VirtualAllocator: {:?} is outside the arena {:?}",
            range,
            inner.base_range,
        );

        // The only candidate for an overlap is the tracked range with the
        // greatest start below this range's end.
        if let Some((_, neighbor)) = inner.allocated.range(..range.end()).next_back() {
            if neighbor.end() > range.start() {
                panic!(
                    "VirtualAllocator: {:?} overlaps existing allocation {:?}",
                    range, neighbor,
                );
            }
        }

        inner.insert_merged(range);
        range
    }

    /// Releases `range`, which must lie entirely within a single tracked
    /// allocation; remnants before and after it are kept.
    pub fn deallocate(&self, range: VirtualRange) {
        assert!(!range.is_empty());
        assert!(range.start().is_page_aligned() && range.end().is_page_aligned());

        let mut inner = self.inner.lock();
        assert!(
            inner.base_range.contains_range(&range),
            "VirtualAllocator: {:?} does not belong to arena {:?}",
            range,
            inner.base_range,
        );

        let owner = inner
            .allocated
            .range(..=range.start())
            .next_back()
            .map(|(k, v)| (*k, *v))
            .filter(|(_, v)| v.contains_range(&range))
            .unwrap_or_else(|| {
                panic!("VirtualAllocator: {:?} was not found as allocated", range)
            });

        trace!("virtual_allocator: deallocating {:?} from {:?}", range, owner.1);
        inner.allocated.remove(&owner.0);

        let before = VirtualRange::new(owner.1.start(), range.start());
        let after = VirtualRange::new(range.end(), owner.1.end());
        if !before.is_empty() {
            inner.allocated.insert(before.start(), before);
        }
        if !after.is_empty() {
            inner.allocated.insert(after.start(), after);
        }
    }

    pub fn contains_address(&self, addr: VirtualAddress) -> bool {
        self.inner.lock().base_range.contains_address(addr)
    }

    pub fn contains_range(&self, range: &VirtualRange) -> bool {
        self.inner.lock().base_range.contains_range(range)
    }

    /// Whether `addr` falls inside any allocated range.
    pub fn is_allocated(&self, addr: VirtualAddress) -> bool {
        let inner = self.inner.lock();
        if !inner.base_range.contains_address(addr) {
            return false;
        }
        inner
            .allocated
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, range)| range.contains_address(addr))
    }

    pub fn base_range(&self) -> VirtualRange {
        self.inner.lock().base_range
    }

    /// The number of tracked (maximally merged) allocated ranges.
    pub fn range_count(&self) -> usize {
        self.inner.lock().allocated.len()
    }

    /// Calls `f` with every allocated range, in address order.
    pub fn for_each_allocated(&self, mut f: impl FnMut(&VirtualRange)) {
        for range in self.inner.lock().allocated.values() {
            f(range);
        }
    }
}

impl Inner {
    /// Inserts `range`, merging it with the neighbors it touches.
    fn insert_merged(&mut self, range: VirtualRange) {
        let mut start = range.start();
        let mut end = range.end();

        let before_key = self
            .allocated
            .range(..start)
            .next_back()
            .filter(|(_, prev)| prev.end() == start)
            .map(|(k, _)| *k);
        if let Some(key) = before_key {
            let prev = self.allocated.remove(&key).unwrap();
            start = prev.start();
        }

        if let Some(next) = self.allocated.remove(&end) {
            end = next.end();
        }

        self.allocated.insert(start, VirtualRange::new(start, end));
    }
}

/// Returns the placement of `length` bytes aligned to `alignment` inside
/// the gap `[gap_begin, gap_end)`, if it fits.
fn try_place(
    gap_begin: VirtualAddress,
    gap_end: VirtualAddress,
    length: usize,
    alignment: usize,
) -> Option<VirtualRange> {
    let aligned = VirtualAddress::new_canonical(
        gap_begin.value().checked_add(alignment - 1)? & !(alignment - 1),
    );
    if aligned < gap_begin {
        return None;
    }
    let end = aligned.checked_add(length)?;
    (end <= gap_end).then(|| VirtualRange::new(aligned, end))
}

impl fmt::Debug for VirtualAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VirtualAllocator")
            .field("base_range", &inner.base_range)
            .field("allocated", &inner.allocated.values().collect::<alloc::vec::Vec<_>>())
            .finish()
    }
}
