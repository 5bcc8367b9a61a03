//! Access to physical memory through the kernel's linear mapping.
//!
//! All of physical memory is mapped at a fixed virtual offset
//! ([`kernel_config::memory::PHYSICAL_MEMORY_OFFSET`] once paging is up),
//! so the contents of any frame are reachable as `offset + paddr` without
//! temporary mappings. Every crate that needs to touch raw frame memory
//! (zeroing fresh frames, walking page tables, APIC MMIO) goes through
//! [`phys_to_virt`].
//!
//! The offset is installed once during memory-subsystem bring-up. Unit
//! tests install the base of an ordinary in-process buffer instead, which
//! makes "physical" memory a plain array and lets the walkers and
//! allocators run on the host unmodified.

#![no_std]

use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use spin::Once;

static PHYSICAL_MEMORY_OFFSET: Once<usize> = Once::new();

/// Installs the virtual offset at which physical memory is mapped.
///
/// Called once during memory-subsystem init; later calls are ignored.
pub fn init(offset: VirtualAddress) {
    PHYSICAL_MEMORY_OFFSET.call_once(|| offset.value());
}

/// Returns `true` once [`init`] has run.
pub fn is_initialized() -> bool {
    PHYSICAL_MEMORY_OFFSET.get().is_some()
}

fn offset() -> usize {
    *PHYSICAL_MEMORY_OFFSET
        .get()
        .expect("linear_map: used before init")
}

/// The virtual address through which the given physical address is
/// accessible.
pub fn phys_to_virt(paddr: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new_canonical(offset() + paddr.value())
}

/// The inverse of [`phys_to_virt`]; only valid for addresses inside the
/// linear mapping.
pub fn virt_to_phys(vaddr: VirtualAddress) -> PhysicalAddress {
    PhysicalAddress::new_canonical(vaddr.value() - offset())
}

/// A mutable pointer to the first byte of the given frame.
pub fn frame_as_ptr(frame: Frame) -> *mut u8 {
    phys_to_virt(frame.start_address()).value() as *mut u8
}

/// Zeroes the entire frame through the linear mapping.
pub fn zero_frame(frame: Frame) {
    let ptr = frame_as_ptr(frame);
    // The frame is exclusively owned by the caller (it was just allocated
    // or is being recycled), so a raw write cannot alias Rust data.
    unsafe {
        core::ptr::write_bytes(ptr, 0, kernel_config::memory::PAGE_SIZE);
    }
}
