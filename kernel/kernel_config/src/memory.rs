//! The virtual memory layout and paging geometry the kernel assumes.
//!
//! On x86_64 the layout is:
//! * `0xFFFF_FFFF_8000_0000` and up: the kernel image (-2 GiB region).
//! * `0xFFFF_C000_0000_0000 ..= 0xFFFF_FF7F_FFFF_FFFF`: the kernel's
//!   dynamic virtual arena (heap blocks, device windows, caches).
//! * `0xFFFF_8000_0000_0000`: all of physical memory, linearly mapped.
//! * everything below `0x0000_8000_0000_0000`: userspace.
//!
//! The 32-bit layout is the classic 3/1 split with the kernel at
//! `0xC000_0000` and a linear window over low physical memory above it.

/// The lower 12 bits of a virtual address are the offset within a page.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4 KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of bytes per address/page-table entry.
pub const BYTES_PER_ADDR: usize = core::mem::size_of::<usize>();

pub const MAX_VIRTUAL_ADDRESS: usize = usize::MAX;
pub const MAX_PAGE_NUMBER: usize = MAX_VIRTUAL_ADDRESS / PAGE_SIZE;

cfg_if::cfg_if! {
if #[cfg(target_arch = "x86")] {

    /// Two-level paging: directory -> table.
    pub const PAGE_TABLE_LEVELS: usize = 2;
    /// Value: 1024. A paging table fills exactly one page.
    pub const ENTRIES_PER_PAGE_TABLE: usize = PAGE_SIZE / BYTES_PER_ADDR;
    /// Value: 10. Shift a page number by this to get the next level's index.
    pub const PAGE_TABLE_INDEX_BITS: usize = 10;

    /// 4 MiB PSE pages.
    pub const HUGE_PAGE_SHIFT: usize = 22;

    /// Without PAE, nothing above 4 GiB is reachable.
    pub const MAX_PHYSICAL_ADDRESS: u64 = 1 << 32;

    /// The classic 3/1 split: the kernel owns the top gigabyte.
    pub const KERNEL_OFFSET: usize = 0xC000_0000;

    /// Low physical memory is mapped linearly at the kernel base.
    pub const PHYSICAL_MEMORY_OFFSET: usize = KERNEL_OFFSET;

    /// Dynamic kernel allocations live between the linearly mapped low
    /// memory and the last (reserved) large page.
    pub const KERNEL_ARENA_START: usize = 0xE000_0000;
    pub const KERNEL_ARENA_END: usize = 0xFFC0_0000;

    pub const USER_ARENA_START: usize = 0x0040_0000;
    pub const USER_ARENA_END: usize = KERNEL_OFFSET;

} else {

    /// Four-level paging: PML4 -> PDPT -> PDT -> PT.
    pub const PAGE_TABLE_LEVELS: usize = 4;
    /// Value: 512. A paging table fills exactly one page.
    pub const ENTRIES_PER_PAGE_TABLE: usize = PAGE_SIZE / BYTES_PER_ADDR;
    /// Value: 9. Shift a page number by this to get the next level's index.
    pub const PAGE_TABLE_INDEX_BITS: usize = 9;

    /// 2 MiB huge pages (PDT leaves).
    pub const HUGE_PAGE_SHIFT: usize = 21;

    /// The ceiling the physical allocator clamps regions to; 46 bits covers
    /// the linearly mapped span below.
    pub const MAX_PHYSICAL_ADDRESS: u64 = 1 << 46;

    /// The kernel image is linked at -2 GiB.
    pub const KERNEL_OFFSET: usize = 0xFFFF_FFFF_8000_0000;

    /// All of physical memory is mapped starting at the base of the
    /// higher half; any frame is readable at `PHYSICAL_MEMORY_OFFSET + paddr`.
    pub const PHYSICAL_MEMORY_OFFSET: usize = 0xFFFF_8000_0000_0000;

    /// Dynamic kernel allocations live above the linear map and below the
    /// kernel image.
    pub const KERNEL_ARENA_START: usize = 0xFFFF_C000_0000_0000;
    pub const KERNEL_ARENA_END: usize = 0xFFFF_FF80_0000_0000;

    /// Userspace gets the canonical lower half, minus the first 4 MiB.
    pub const USER_ARENA_START: usize = 0x0000_0000_0040_0000;
    pub const USER_ARENA_END: usize = 0x0000_8000_0000_0000;

}
}

/// Huge page size: 2 MiB with 4-level paging, 4 MiB with 2-level paging.
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;
