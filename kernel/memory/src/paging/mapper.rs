//! The top-down page-table walker.

use frame_allocator::AllocatedFrame;
use kernel_config::memory::{
    HUGE_PAGE_SIZE, PAGE_SHIFT, PAGE_TABLE_INDEX_BITS, PAGE_TABLE_LEVELS,
};
use memory_structs::{Frame, Page, PhysicalAddress, VirtualAddress};

use super::entry::EntryFlags;
use super::table::Table;

/// Walks and edits the paging hierarchy rooted at one top-level frame.
///
/// All table memory is reached through the linear mapping, so a `Mapper`
/// can edit any address space, not just the active one. Callers serialize
/// mutations through the owning address space's lock.
pub struct Mapper {
    root: Frame,
}

impl Mapper {
    pub fn with_root(root: Frame) -> Mapper {
        Mapper { root }
    }

    pub fn root(&self) -> Frame {
        self.root
    }

    /// Maps `page` to `frame` with the given attributes.
    ///
    /// Absent intermediate tables are created from the frame allocator;
    /// the handles for those table frames are appended to `table_frames`,
    /// whose owner (the address space) keeps them alive.
    pub fn map_page(
        &self,
        page: Page,
        frame: Frame,
        flags: EntryFlags,
        table_frames: &mut alloc::vec::Vec<AllocatedFrame>,
    ) {
        let table = self.walk_and_create(page.start_address(), 1, flags, table_frames);
        let index = page.start_address().page_table_index(1);
        table.entry_mut(index).set(frame, flags | EntryFlags::PRESENT);
    }

    /// Maps a huge page: the walk terminates one level early and the leaf
    /// entry carries the huge bit. Both addresses must be huge-aligned.
    pub fn map_huge_page(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: EntryFlags,
        table_frames: &mut alloc::vec::Vec<AllocatedFrame>,
    ) {
        assert_eq!(virt.value() % HUGE_PAGE_SIZE, 0, "map_huge_page: unaligned {:?}", virt);
        assert_eq!(phys.value() % HUGE_PAGE_SIZE, 0, "map_huge_page: unaligned {:?}", phys);

        let table = self.walk_and_create(virt, 2, flags, table_frames);
        let index = virt.page_table_index(2);
        table.entry_mut(index).set(
            Frame::containing_address(phys),
            flags | EntryFlags::PRESENT | EntryFlags::HUGE_PAGE,
        );
    }

    /// Clears the PRESENT bit of the leaf entry for `page`.
    /// Intermediate tables are left in place.
    pub fn unmap_page(&self, page: Page) {
        let vaddr = page.start_address();
        let mut table = unsafe { Table::at_frame(self.root) };

        for level in (2..=PAGE_TABLE_LEVELS).rev() {
            let index = vaddr.page_table_index(level);
            let next = table.next_table_frame(index).unwrap_or_else(|| {
                panic!("unmap_page: no table behind level {} for {:?}", level, vaddr)
            });
            table = unsafe { Table::at_frame(next) };
        }

        let entry = table.entry_mut(vaddr.page_table_index(1));
        assert!(entry.is_present(), "unmap_page: {:?} was not mapped", vaddr);
        entry.clear_present();
    }

    /// Resolves a virtual address through the hierarchy, honoring huge
    /// leaves. Returns `None` anywhere the walk hits a non-present entry.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = unsafe { Table::at_frame(self.root) };

        for level in (2..=PAGE_TABLE_LEVELS).rev() {
            let index = vaddr.page_table_index(level);
            let entry = table.entry(index);
            if !entry.is_present() {
                return None;
            }
            if entry.is_huge() {
                let span = 1usize << (PAGE_SHIFT + (level - 1) * PAGE_TABLE_INDEX_BITS);
                let offset = vaddr.value() & (span - 1);
                return Some(entry.frame().start_address() + offset);
            }
            table = unsafe { Table::at_frame(entry.frame()) };
        }

        let entry = table.entry(vaddr.page_table_index(1));
        entry
            .is_present()
            .then(|| entry.frame().start_address() + vaddr.page_offset())
    }

    /// Walks down to the table at `stop_level`, creating zeroed
    /// intermediate tables as needed.
    fn walk_and_create<'t>(
        &self,
        vaddr: VirtualAddress,
        stop_level: usize,
        leaf_flags: EntryFlags,
        table_frames: &mut alloc::vec::Vec<AllocatedFrame>,
    ) -> &'t mut Table {
        let mut intermediate = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if leaf_flags.contains(EntryFlags::USER_ACCESSIBLE) {
            intermediate |= EntryFlags::USER_ACCESSIBLE;
        }

        let mut table = unsafe { Table::at_frame(self.root) };
        for level in ((stop_level + 1)..=PAGE_TABLE_LEVELS).rev() {
            let index = vaddr.page_table_index(level);

            if table.entry(index).is_present() {
                assert!(
                    !table.entry(index).is_huge(),
                    "map: {:?} already covered by a huge page at level {}",
                    vaddr,
                    level,
                );
                // Widen the intermediate for user access if this mapping
                // needs it; tightening never happens here.
                if intermediate.contains(EntryFlags::USER_ACCESSIBLE)
                    && !table.entry(index).flags().contains(EntryFlags::USER_ACCESSIBLE)
                {
                    let frame = table.entry(index).frame();
                    let flags = table.entry(index).flags() | EntryFlags::USER_ACCESSIBLE;
                    table.entry_mut(index).set(frame, flags);
                }
            } else {
                // Fresh table frames come back zeroed from the allocator.
                let new_table = frame_allocator::allocate_frame();
                table.entry_mut(index).set(new_table.frame(), intermediate);
                table_frames.push(new_table);
            }

            let next = table.entry(index).frame();
            table = unsafe { Table::at_frame(next) };
        }
        table
    }
}
