//! A single entry in a paging table.

use core::fmt;

use memory_structs::{Frame, PhysicalAddress};

cfg_if::cfg_if! {
if #[cfg(target_arch = "x86")] {

    /// Raw width of one paging entry (no PAE).
    pub type EntryBits = u32;
    /// Bits of the entry that hold the frame's physical address.
    const ADDRESS_MASK: EntryBits = 0xFFFF_F000;

    bitflags::bitflags! {
        /// Attribute bits of a 32-bit paging entry.
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        pub struct EntryFlags: EntryBits {
            const PRESENT         = 1 << 0;
            const WRITABLE        = 1 << 1;
            const USER_ACCESSIBLE = 1 << 2;
            const WRITE_THROUGH   = 1 << 3;
            const NO_CACHE        = 1 << 4;
            const ACCESSED        = 1 << 5;
            const DIRTY           = 1 << 6;
            /// 4 MiB leaf in the page directory; PAT bit in a page table.
            const HUGE_PAGE       = 1 << 7;
            const GLOBAL          = 1 << 8;
        }
    }

} else {

    /// Raw width of one paging entry.
    pub type EntryBits = u64;
    /// Bits of the entry that hold the frame's physical address.
    const ADDRESS_MASK: EntryBits = 0x000F_FFFF_FFFF_F000;

    bitflags::bitflags! {
        /// Attribute bits of a 64-bit paging entry.
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        pub struct EntryFlags: EntryBits {
            const PRESENT         = 1 << 0;
            const WRITABLE        = 1 << 1;
            const USER_ACCESSIBLE = 1 << 2;
            const WRITE_THROUGH   = 1 << 3;
            const NO_CACHE        = 1 << 4;
            const ACCESSED        = 1 << 5;
            const DIRTY           = 1 << 6;
            /// 2 MiB (or 1 GiB) leaf one level above the page table;
            /// PAT bit within a page table entry.
            const HUGE_PAGE       = 1 << 7;
            const GLOBAL          = 1 << 8;
            const NO_EXECUTE      = 1 << 63;
        }
    }

}
}

impl EntryFlags {
    /// `NO_EXECUTE` where the architecture has it, empty otherwise.
    pub fn no_exec() -> EntryFlags {
        #[cfg(target_arch = "x86")]
        {
            EntryFlags::empty()
        }
        #[cfg(not(target_arch = "x86"))]
        {
            EntryFlags::NO_EXECUTE
        }
    }
}

/// One slot of a paging table: frame address plus attribute bits.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(EntryBits);

impl PageTableEntry {
    pub const fn unused() -> PageTableEntry {
        PageTableEntry(0)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn is_huge(&self) -> bool {
        self.flags().contains(EntryFlags::HUGE_PAGE)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// The physical frame this entry points at.
    pub fn frame(&self) -> Frame {
        Frame::containing_address(PhysicalAddress::new_canonical(
            (self.0 & ADDRESS_MASK) as usize,
        ))
    }

    pub fn set(&mut self, frame: Frame, flags: EntryFlags) {
        let addr = frame.start_address().value() as EntryBits;
        debug_assert_eq!(addr & !ADDRESS_MASK, 0);
        self.0 = (addr & ADDRESS_MASK) | flags.bits();
    }

    pub fn set_unused(&mut self) {
        self.0 = 0;
    }

    /// Clears only the PRESENT bit, preserving the rest of the entry.
    pub fn clear_present(&mut self) {
        self.0 &= !EntryFlags::PRESENT.bits();
    }

    pub fn raw(&self) -> EntryBits {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageTableEntry({:#X}: {:?})", self.0 & ADDRESS_MASK, self.flags())
    }
}
