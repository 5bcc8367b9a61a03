//! The kernel's virtual memory core: multi-level paging and the
//! [`AddressSpace`] object.
//!
//! The design premise, on both supported architectures, is that all of
//! physical memory is reachable through the linear mapping (see the
//! `linear_map` crate). Page tables are therefore ordinary memory that
//! any CPU can edit for any address space; nothing here requires the
//! edited space to be active, and there is no temporary-mapping window.
//!
//! The pieces:
//! * [`paging`]: entries, tables, and the [`Mapper`] walker.
//! * [`AddressSpace`]: root frame + virtual arena + owned frames + the
//!   recursive interrupt-safe lock serializing mutations.
//! * [`handle_page_fault`]: lazy backfill of allocated-but-unmapped
//!   ranges, safe-copy fixups, and the fatal/report split.
//! * [`safe_copy`]: the fault-intercepting copy primitive.
//!
//! Kernel bring-up calls [`init_kernel_space`] once, after the frame
//! allocator is live, to build the kernel's own space: the huge-page
//! linear mapping of every physical range plus the kernel image mapping.

#![no_std]

extern crate alloc;

mod address_space;
mod arch;
mod page_fault;
pub mod paging;
pub mod safe_copy;

pub use address_space::{AddressSpace, Privilege};
pub use page_fault::{handle_page_fault, FaultOutcome, PageFault, PageFaultKind};
pub use paging::{EntryFlags, Mapper, PageTableEntry, Table};
pub use safe_copy::safe_copy_memory;

use boot_allocator::{MemoryMap, RegionKind};
use kernel_config::memory::{HUGE_PAGE_SIZE, KERNEL_OFFSET, MAX_PHYSICAL_ADDRESS, PAGE_SIZE};
use log::{debug, info, warn};
use memory_structs::{PhysicalAddress, VirtualAddress};
use spin::Once;

static KERNEL_SPACE: Once<AddressSpace> = Once::new();

/// How the scheduler tells this crate whose address space is current.
/// Installed once at scheduler bring-up.
static CURRENT_SPACE_PROVIDER: Once<fn() -> Option<&'static AddressSpace>> = Once::new();

/// Builds the kernel's address space over the released boot memory map:
///
/// * every physical range in the map becomes reachable through the
///   linear mapping, built with huge pages (entries are aligned outward
///   to huge-page boundaries first);
/// * the kernel image ranges are additionally mapped at their linked
///   virtual addresses (`KERNEL_OFFSET + paddr`).
///
/// The caller decides when to actually switch to the new space.
pub fn init_kernel_space(map: &MemoryMap) -> Result<&'static AddressSpace, &'static str> {
    if !linear_map::is_initialized() {
        return Err("memory: linear map must be initialized first");
    }
    if KERNEL_SPACE.get().is_some() {
        return Err("memory: kernel address space already initialized");
    }

    let space = KERNEL_SPACE.call_once(|| AddressSpace::new(Privilege::Kernel));

    let data_flags = EntryFlags::WRITABLE | EntryFlags::GLOBAL | EntryFlags::no_exec();
    let huge = HUGE_PAGE_SIZE as u64;
    let mut mapped_huge_pages = 0usize;

    for entry in map.iter() {
        let begin = entry.begin & !(huge - 1);
        let end = entry.end().div_ceil(huge) * huge;

        let mut addr = begin;
        while addr < end && addr < MAX_PHYSICAL_ADDRESS {
            let phys = PhysicalAddress::new_canonical(addr as usize);
            let virt = linear_map::phys_to_virt(phys);
            // Alignment rounding makes adjacent entries share boundary
            // huge pages; map each one once.
            if space.translate(virt).is_none() {
                space.map_huge_page_with_flags(virt, phys, data_flags);
                mapped_huge_pages += 1;
            }
            addr += huge;
        }
    }

    let image_flags = EntryFlags::WRITABLE | EntryFlags::GLOBAL;
    for entry in map.iter().filter(|e| e.kind == RegionKind::KernelImage) {
        debug!("memory: mapping kernel image range {:?}", entry);
        let mut addr = entry.begin;
        while addr < entry.end() {
            let phys = PhysicalAddress::new_canonical(addr as usize);
            let virt = VirtualAddress::new_canonical(KERNEL_OFFSET + addr as usize);
            space.map_page_with_flags(virt, phys, image_flags);
            addr += PAGE_SIZE as u64;
        }
    }

    info!(
        "memory: kernel address space built ({} huge pages in the linear map, root {:?})",
        mapped_huge_pages,
        space.root(),
    );
    Ok(space)
}

/// The kernel's address space. Panics before [`init_kernel_space`].
pub fn kernel_space() -> &'static AddressSpace {
    KERNEL_SPACE
        .get()
        .expect("memory: kernel address space not yet initialized")
}

pub(crate) fn kernel_space_if_initialized() -> Option<&'static AddressSpace> {
    KERNEL_SPACE.get()
}

/// Installs the scheduler's notion of the current address space.
pub fn set_current_space_provider(provider: fn() -> Option<&'static AddressSpace>) {
    CURRENT_SPACE_PROVIDER.call_once(|| provider);
}

/// The address space of the currently running thread. Falls back to the
/// kernel space when no thread context exists yet (early boot, or a
/// fault taken before the scheduler is up).
pub fn current_space() -> &'static AddressSpace {
    if let Some(provider) = CURRENT_SPACE_PROVIDER.get() {
        if let Some(space) = provider() {
            return space;
        }
        warn!("memory: no current thread, falling back to the kernel address space");
    }
    kernel_space()
}
