//! The boot-time view of physical memory, and the allocator that carves it.
//!
//! The bootloader hands over an ordered list of tagged physical ranges
//! (the [`MemoryMap`]). Before the frame allocator exists, early
//! reservations (kernel image, boot modules, the initial heap block) are
//! made through the [`BootAllocator`], which *shatters* `Free` map entries
//! around each reservation and keeps the map normalized. Once bring-up is
//! past the point of early reservations, [`BootAllocator::release`]
//! returns the final map, which seeds the real frame allocator; any
//! reservation after that is a bug and panics.
//!
//! Every failure here is fatal: this runs before there is anyone to report
//! an error to, and a boot that cannot place the kernel image has nothing
//! sensible left to do.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use log::debug;

/// Page size as the map's native `u64` arithmetic type.
const PAGE_SIZE: u64 = kernel_config::memory::PAGE_SIZE as u64;

/// The kind of a physical range in the boot memory map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    /// Usable RAM.
    Free,
    /// Firmware-reserved, never usable.
    Reserved,
    /// Known-faulty memory reported by the firmware.
    Bad,
    /// Reserved by the boot allocator without a more specific tag.
    BootReserved,
    KernelImage,
    KernelModule,
    InitialHeap,
}

impl RegionKind {
    /// Ranges that must never be dropped from the map, no matter how small.
    pub fn is_firmware_reserved(&self) -> bool {
        matches!(self, RegionKind::Reserved | RegionKind::Bad)
    }
}

/// One contiguous physical range `[begin, begin + length)` with a kind tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub begin: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryMapEntry {
    pub const fn new(begin: u64, length: u64, kind: RegionKind) -> MemoryMapEntry {
        MemoryMapEntry { begin, length, kind }
    }

    pub const fn end(&self) -> u64 {
        self.begin + self.length
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.begin <= addr && addr < self.end()
    }
}

impl fmt::Debug for MemoryMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:#X}..{:#X}) {:?}", self.begin, self.end(), self.kind)
    }
}

/// An ordered, normalized list of physical ranges.
///
/// Invariants maintained by every mutation:
/// * entries are sorted by `begin` and never overlap;
/// * no entry is empty;
/// * no two adjacent entries share a kind (they are merged).
#[derive(Clone, Default)]
pub struct MemoryMap {
    entries: Vec<MemoryMapEntry>,
}

impl MemoryMap {
    pub const fn new() -> MemoryMap {
        MemoryMap { entries: Vec::new() }
    }

    /// Ingests one bootloader-reported range, keeping the map ordered and
    /// merging it with same-kind neighbors or overlapping duplicates.
    pub fn add_range(&mut self, begin: u64, length: u64, kind: RegionKind) {
        if length == 0 {
            return;
        }
        let entry = MemoryMapEntry::new(begin, length, kind);
        let index = self
            .entries
            .iter()
            .position(|e| e.begin > entry.begin)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
        self.merge_around(index);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn at(&self, index: usize) -> &MemoryMapEntry {
        &self.entries[index]
    }

    pub fn iter(&self) -> core::slice::Iter<'_, MemoryMapEntry> {
        self.entries.iter()
    }

    /// Merges mergeable neighbors in the vicinity of `index`:
    /// same-kind entries that touch or overlap become one.
    fn merge_around(&mut self, index: usize) {
        let mut i = index.saturating_sub(1);
        while i + 1 < self.entries.len() {
            let (current, next) = (self.entries[i], self.entries[i + 1]);
            if current.kind == next.kind && current.end() >= next.begin {
                let merged_end = core::cmp::max(current.end(), next.end());
                self.entries[i].length = merged_end - current.begin;
                self.entries.remove(i + 1);
                // Re-check the same position against the new neighbor.
                continue;
            }
            if i >= index + 1 {
                break;
            }
            i += 1;
        }
    }

    /// Replaces the entry at `index` with up to three shatter pieces,
    /// then re-merges around the edit.
    fn replace_with_pieces(&mut self, index: usize, pieces: &[Option<MemoryMapEntry>]) {
        self.entries.remove(index);
        let mut insert_at = index;
        for piece in pieces.iter().flatten() {
            let keep = piece.length >= PAGE_SIZE || piece.kind.is_firmware_reserved();
            if piece.length == 0 || !keep {
                continue;
            }
            self.entries.insert(insert_at, *piece);
            insert_at += 1;
        }
        self.merge_around(index);
    }
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

/// The tag a caller attaches to an early reservation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReservationTag {
    Generic,
    KernelImage,
    KernelModule,
    InitialHeap,
}

impl ReservationTag {
    fn as_region_kind(self) -> RegionKind {
        match self {
            ReservationTag::Generic => RegionKind::BootReserved,
            ReservationTag::KernelImage => RegionKind::KernelImage,
            ReservationTag::KernelModule => RegionKind::KernelModule,
            ReservationTag::InitialHeap => RegionKind::InitialHeap,
        }
    }
}

/// The single boot-time allocator over the memory map.
pub struct BootAllocator {
    map: MemoryMap,
    released: bool,
}

impl BootAllocator {
    pub fn new(map: MemoryMap) -> BootAllocator {
        BootAllocator { map, released: false }
    }

    /// Reserves exactly `[addr, addr + page_count * PAGE_SIZE)`.
    pub fn reserve_at(&mut self, addr: u64, page_count: u64, tag: ReservationTag) -> u64 {
        let length = page_count
            .checked_mul(PAGE_SIZE)
            .unwrap_or_else(|| self.fail(page_count, addr, addr, tag));
        let upper = addr
            .checked_add(length)
            .unwrap_or_else(|| self.fail(page_count, addr, addr, tag));
        self.reserve_contiguous(page_count, addr, upper, tag)
    }

    /// Finds the lowest free gap of `page_count` pages inside
    /// `[lower, upper)` and reserves it with the given tag.
    pub fn reserve_contiguous(
        &mut self,
        page_count: u64,
        lower: u64,
        upper: u64,
        tag: ReservationTag,
    ) -> u64 {
        assert!(!self.released, "BootAllocator: reservation after release()");

        let bytes = page_count
            .checked_mul(PAGE_SIZE)
            .unwrap_or_else(|| self.fail(page_count, lower, upper, tag));

        if lower >= upper
            || lower.checked_add(bytes).is_none()
            || lower + bytes > upper
        {
            self.fail(page_count, lower, upper, tag);
        }

        // Walk the ordered map for the first Free entry that can hold the
        // request inside the window.
        let mut found: Option<(usize, u64)> = None;
        for (index, entry) in self.map.iter().enumerate() {
            if entry.begin >= upper {
                break;
            }
            if entry.kind != RegionKind::Free || entry.end() <= lower {
                continue;
            }
            let candidate = core::cmp::max(lower, entry.begin);
            if candidate + bytes <= entry.end() && candidate + bytes <= upper {
                found = Some((index, candidate));
                break;
            }
        }

        let (index, begin) = found.unwrap_or_else(|| self.fail(page_count, lower, upper, tag));
        let entry = *self.map.at(index);

        debug!(
            "boot_allocator: reserving [{:#X}..{:#X}) as {:?} out of {:?}",
            begin,
            begin + bytes,
            tag,
            entry,
        );

        // Shatter the chosen Free entry into before / allocated / after.
        let pieces = [
            Some(MemoryMapEntry::new(entry.begin, begin - entry.begin, RegionKind::Free)),
            Some(MemoryMapEntry::new(begin, bytes, tag.as_region_kind())),
            Some(MemoryMapEntry::new(
                begin + bytes,
                entry.end() - (begin + bytes),
                RegionKind::Free,
            )),
        ];
        self.map.replace_with_pieces(index, &pieces);

        begin
    }

    /// Consumes the allocator, returning the final memory map.
    /// Any reservation attempted afterwards panics.
    pub fn release(mut self) -> MemoryMap {
        self.released = true;
        core::mem::take(&mut self.map)
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    fn fail(&self, page_count: u64, lower: u64, upper: u64, tag: ReservationTag) -> ! {
        panic!(
            "BootAllocator: failed to reserve {} pages ({:?}) within [{:#X}..{:#X}); map: {:?}",
            page_count, tag, lower, upper, self.map,
        );
    }
}

#[cfg(test)]
mod test;
