//! TLB and root-register primitives. Real on bare metal, no-ops on the
//! host so the walker and address-space logic can be unit tested.

use memory_structs::{Frame, VirtualAddress};

cfg_if::cfg_if! {
if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {

    use x86_64::{PhysAddr, VirtAddr};
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::frame::PhysFrame;

    /// Invalidates the TLB entry for one page (INVLPG).
    pub fn flush_page(vaddr: VirtualAddress) {
        x86_64::instructions::tlb::flush(VirtAddr::new_truncate(vaddr.value() as u64));
    }

    /// Reloads CR3, discarding all non-global TLB entries.
    pub fn flush_all() {
        x86_64::instructions::tlb::flush_all();
    }

    /// Loads `root` into CR3.
    pub fn write_root(root: Frame) {
        let frame = PhysFrame::containing_address(
            PhysAddr::new_truncate(root.start_address().value() as u64),
        );
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    /// The frame currently loaded in CR3.
    pub fn current_root() -> Option<Frame> {
        let (frame, _flags) = Cr3::read();
        Some(Frame::containing_address(
            memory_structs::PhysicalAddress::new_canonical(frame.start_address().as_u64() as usize),
        ))
    }

} else {

    pub fn flush_page(_vaddr: VirtualAddress) {}

    pub fn flush_all() {}

    pub fn write_root(_root: Frame) {}

    pub fn current_root() -> Option<Frame> {
        None
    }

}
}
