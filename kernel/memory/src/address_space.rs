//! The address-space object: a paging hierarchy, the virtual arena over
//! it, and the frames it owns.

use alloc::vec::Vec;
use core::fmt;

use frame_allocator::AllocatedFrame;
use kernel_config::memory::{
    KERNEL_ARENA_END, KERNEL_ARENA_START, PAGE_TABLE_LEVELS, PHYSICAL_MEMORY_OFFSET,
    USER_ARENA_END, USER_ARENA_START,
};
use log::trace;
use memory_structs::{Frame, Page, PhysicalAddress, VirtualAddress, VirtualRange};
use spin::Mutex;
use sync_irq::RecursiveIrqSafeLock;
use virtual_allocator::VirtualAllocator;

use crate::arch;
use crate::paging::{EntryFlags, Mapper, Table};

/// Whether an address space belongs to the kernel or to a user process.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Privilege {
    Kernel,
    User,
}

/// One address space: the root paging frame, the allocator over its
/// virtual arena, and every frame it owns (paging-table frames plus
/// lazily backfilled data frames).
///
/// All paging mutations are serialized behind `lock`, which is recursive
/// and interrupt-safe: a page fault taken *while* mutating (e.g., the
/// first touch of a lazily allocated buffer inside a mapping operation)
/// re-enters on the same CPU without deadlocking.
pub struct AddressSpace {
    privilege: Privilege,
    mapper: Mapper,
    /// Keeps the root frame allocated for the life of the space.
    root_frame: Option<AllocatedFrame>,
    allocator: VirtualAllocator,
    owned_frames: Mutex<Vec<AllocatedFrame>>,
    lock: RecursiveIrqSafeLock,
}

impl AddressSpace {
    /// Creates a fresh address space with an empty paging hierarchy.
    ///
    /// A user space starts with the kernel's top-level entries copied in,
    /// so kernel code and the linear mapping stay reachable after a
    /// switch; a kernel space starts entirely empty.
    pub fn new(privilege: Privilege) -> AddressSpace {
        let root_frame = frame_allocator::allocate_frame();
        let root = root_frame.frame();

        let (arena_start, arena_end) = match privilege {
            Privilege::Kernel => (KERNEL_ARENA_START, KERNEL_ARENA_END),
            Privilege::User => (USER_ARENA_START, USER_ARENA_END),
        };

        let space = AddressSpace {
            privilege,
            mapper: Mapper::with_root(root),
            root_frame: Some(root_frame),
            allocator: VirtualAllocator::new(
                VirtualAddress::new_canonical(arena_start),
                VirtualAddress::new_canonical(arena_end),
            ),
            owned_frames: Mutex::new(Vec::new()),
            lock: RecursiveIrqSafeLock::new(),
        };

        if privilege == Privilege::User {
            if let Some(kernel) = crate::kernel_space_if_initialized() {
                space.copy_kernel_entries_from(kernel);
            }
        }

        space
    }

    /// Copies the kernel half of the top-level table from `kernel`, so
    /// this space shares the kernel's upper mappings.
    fn copy_kernel_entries_from(&self, kernel: &AddressSpace) {
        let first_kernel_index = VirtualAddress::new_canonical(PHYSICAL_MEMORY_OFFSET)
            .page_table_index(PAGE_TABLE_LEVELS);

        let _guard = self.lock.lock();
        let src = unsafe { Table::at_frame(kernel.mapper.root()) };
        let dst = unsafe { Table::at_frame(self.mapper.root()) };
        for index in first_kernel_index..kernel_config::memory::ENTRIES_PER_PAGE_TABLE {
            *dst.entry_mut(index) = *src.entry(index);
        }
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn allocator(&self) -> &VirtualAllocator {
        &self.allocator
    }

    /// The physical frame of the top-level paging table.
    pub fn root(&self) -> Frame {
        self.mapper.root()
    }

    /// The attribute bits for a normal data mapping in this space.
    fn default_flags(&self) -> EntryFlags {
        match self.privilege {
            Privilege::Kernel => EntryFlags::WRITABLE,
            Privilege::User => EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE,
        }
    }

    /// Maps `virt` to `phys` with explicit attributes.
    pub fn map_page_with_flags(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: EntryFlags,
    ) {
        assert!(virt.is_page_aligned(), "map_page: unaligned {:?}", virt);
        assert!(phys.is_page_aligned(), "map_page: unaligned {:?}", phys);

        let _guard = self.lock.lock();
        let mut new_tables = Vec::new();
        self.mapper.map_page(
            Page::containing_address(virt),
            Frame::containing_address(phys),
            flags,
            &mut new_tables,
        );
        if !new_tables.is_empty() {
            self.owned_frames.lock().append(&mut new_tables);
        }
        arch::flush_page(virt);
    }

    /// Maps one page as supervisor-only.
    pub fn map_supervisor_page(&self, virt: VirtualAddress, phys: PhysicalAddress) {
        self.map_page_with_flags(virt, phys, EntryFlags::WRITABLE);
    }

    /// Maps one page as user-accessible.
    pub fn map_user_page(&self, virt: VirtualAddress, phys: PhysicalAddress) {
        self.map_page_with_flags(virt, phys, EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE);
    }

    /// Maps a huge page (2 MiB on x86_64) with the given attributes.
    pub fn map_huge_page_with_flags(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: EntryFlags,
    ) {
        let _guard = self.lock.lock();
        let mut new_tables = Vec::new();
        self.mapper.map_huge_page(virt, phys, flags, &mut new_tables);
        if !new_tables.is_empty() {
            self.owned_frames.lock().append(&mut new_tables);
        }
        arch::flush_page(virt);
    }

    /// Unmaps the page at `virt` and invalidates it everywhere: locally
    /// via INVLPG, and on all other online CPUs via the shootdown IPI.
    pub fn unmap_page(&self, virt: VirtualAddress) {
        assert!(virt.is_page_aligned(), "unmap_page: unaligned {:?}", virt);

        {
            let _guard = self.lock.lock();
            self.mapper.unmap_page(Page::containing_address(virt));
        }
        arch::flush_page(virt);
        tlb_shootdown::post_invalidate(VirtualRange::from_start_len(
            virt,
            kernel_config::memory::PAGE_SIZE,
        ));
    }

    /// Resolves `virt` through this space's tables.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let _guard = self.lock.lock();
        self.mapper.translate(virt)
    }

    /// Records a frame as owned by this space; it is freed when the
    /// space is destroyed.
    pub fn store_owned_frame(&self, frame: AllocatedFrame) {
        self.owned_frames.lock().push(frame);
    }

    pub fn owned_frame_count(&self) -> usize {
        self.owned_frames.lock().len()
    }

    /// Backfills a freshly allocated, zeroed frame behind a faulting
    /// address that the arena has allocated but nothing mapped yet.
    pub(crate) fn backfill_page(&self, fault_address: VirtualAddress) {
        let page_base = fault_address.align_down_to_page();
        let frame = frame_allocator::allocate_frame();
        trace!(
            "address_space: lazily backfilling {:?} with {:?}",
            page_base,
            frame,
        );
        self.map_page_with_flags(page_base, frame.start_address(), self.default_flags());
        self.store_owned_frame(frame);
    }

    /// Loads this space's root into the paging root register.
    pub fn make_active(&self) {
        arch::write_root(self.root());
    }

    pub fn is_active(&self) -> bool {
        arch::current_root() == Some(self.root())
    }

    /// Reloads the root register, discarding all non-global TLB entries.
    pub fn flush_all(&self) {
        arch::flush_all();
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("privilege", &self.privilege)
            .field("root", &self.root())
            .field("owned_frames", &self.owned_frames.lock().len())
            .finish()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Owned frames (tables and backfilled pages) flow back to the
        // frame allocator; the root frame goes last.
        self.owned_frames.lock().clear();
        self.root_frame.take();
    }
}
