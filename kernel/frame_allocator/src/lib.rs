//! Provides the allocator for physical memory frames.
//!
//! The allocator is a set of [`PhysicalRegion`]s, one per usable range of
//! the released boot memory map. Each region tracks its frames in an
//! allocation bitmap (one bit per frame, set = allocated) together with a
//! free count and a rotating next-search hint, so the common pattern of
//! many back-to-back allocations is O(1) amortized.
//!
//! Allocation hands out an [`AllocatedFrame`]: an owning handle that
//! returns the frame to its region when dropped. Frames whose lifetime is
//! the kernel's (page-table roots, the linear map's tables) are
//! [`AllocatedFrame::leak`]ed instead. Every frame is zeroed through the
//! linear mapping before it is returned.
//!
//! Running out of physical memory is fatal, as is freeing a frame twice.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use bit_field::BitField;
use boot_allocator::{MemoryMap, RegionKind};
use kernel_config::memory::{MAX_PHYSICAL_ADDRESS, PAGE_SIZE};
use log::{debug, info};
use memory_structs::{Frame, PhysicalAddress};
use spin::{Mutex, Once};
use static_assertions::const_assert;

const_assert!(PAGE_SIZE.is_power_of_two());

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A contiguous range of physical frames with a bitmap of allocations.
pub struct PhysicalRegion {
    base: Frame,
    page_count: usize,
    inner: Mutex<RegionInner>,
}

struct RegionInner {
    /// One bit per frame; set = allocated. Padding bits past
    /// `page_count` in the last word are permanently set.
    bitmap: Vec<u64>,
    free_count: usize,
    /// Where the next allocation scan starts.
    next_hint: usize,
}

impl PhysicalRegion {
    fn new(base: Frame, page_count: usize) -> PhysicalRegion {
        let words = (page_count + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let mut bitmap = alloc::vec![0u64; words];
        for bit in page_count..words * BITS_PER_WORD {
            bitmap[bit / BITS_PER_WORD].set_bit(bit % BITS_PER_WORD, true);
        }
        PhysicalRegion {
            base,
            page_count,
            inner: Mutex::new(RegionInner { bitmap, free_count: page_count, next_hint: 0 }),
        }
    }

    pub fn base_address(&self) -> PhysicalAddress {
        self.base.start_address()
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_count
    }

    pub fn contains(&self, frame: Frame) -> bool {
        self.base <= frame && frame - self.base < self.page_count
    }

    /// Allocates one frame, scanning for a clear bit at or after the hint
    /// (wrapping to the start if the tail of the region is exhausted).
    fn allocate(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if inner.free_count == 0 {
            return None;
        }

        let hint = inner.next_hint;
        let bit = Self::find_clear_bit(&inner.bitmap, hint, self.page_count)
            .or_else(|| Self::find_clear_bit(&inner.bitmap, 0, self.page_count))?;

        inner.bitmap[bit / BITS_PER_WORD].set_bit(bit % BITS_PER_WORD, true);
        inner.free_count -= 1;
        inner.next_hint = if bit + 1 == self.page_count { 0 } else { bit + 1 };

        Some(self.base + bit)
    }

    /// First clear bit in `bitmap` at or after `start`, below `limit`.
    fn find_clear_bit(bitmap: &[u64], start: usize, limit: usize) -> Option<usize> {
        let mut word_index = start / BITS_PER_WORD;
        let mut mask = !0u64 << (start % BITS_PER_WORD);

        while word_index * BITS_PER_WORD < limit {
            let candidates = !bitmap[word_index] & mask;
            if candidates != 0 {
                let bit = word_index * BITS_PER_WORD + candidates.trailing_zeros() as usize;
                return (bit < limit).then_some(bit);
            }
            word_index += 1;
            mask = !0u64;
        }
        None
    }

    fn free(&self, frame: Frame) {
        let bit = frame - self.base;
        assert!(bit < self.page_count);

        let mut inner = self.inner.lock();
        let was_allocated = inner.bitmap[bit / BITS_PER_WORD].get_bit(bit % BITS_PER_WORD);
        assert!(
            was_allocated,
            "PhysicalRegion: double free of {:?} (region base {:?})",
            frame, self.base,
        );

        inner.bitmap[bit / BITS_PER_WORD].set_bit(bit % BITS_PER_WORD, false);
        inner.free_count += 1;
    }

    /// Checks the `popcount(bitmap) + free_count == page_count` invariant.
    /// Used by diagnostics and tests.
    pub fn verify_bitmap_invariant(&self) -> bool {
        let inner = self.inner.lock();
        let mut allocated = 0usize;
        for bit in 0..self.page_count {
            if inner.bitmap[bit / BITS_PER_WORD].get_bit(bit % BITS_PER_WORD) {
                allocated += 1;
            }
        }
        allocated + inner.free_count == self.page_count
    }
}

impl fmt::Debug for PhysicalRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PhysicalRegion(base {:?}, {} pages, {} free)",
            self.base,
            self.page_count,
            self.free_count(),
        )
    }
}

/// The set of physical regions built from the boot memory map.
pub struct FrameAllocator {
    regions: Vec<PhysicalRegion>,
}

impl FrameAllocator {
    /// Builds regions from the `Free` entries of the released boot map.
    ///
    /// Entries are trimmed to page alignment at both ends, clamped below
    /// the architectural address ceiling, and skipped entirely when less
    /// than one page remains.
    pub fn from_memory_map(map: &MemoryMap) -> FrameAllocator {
        let mut regions = Vec::new();
        let mut total_free_pages = 0usize;

        for entry in map.iter() {
            if entry.kind != RegionKind::Free {
                continue;
            }

            let mut begin = entry.begin;
            let mut end = entry.end();

            if begin >= MAX_PHYSICAL_ADDRESS {
                debug!("frame_allocator: skipping region above the address ceiling: {:?}", entry);
                continue;
            }
            if end > MAX_PHYSICAL_ADDRESS {
                debug!("frame_allocator: clamping region to the address ceiling: {:?}", entry);
                end = MAX_PHYSICAL_ADDRESS;
            }

            // Trim both ends to page boundaries.
            begin = (begin + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
            end &= !(PAGE_SIZE as u64 - 1);

            if begin >= end {
                debug!("frame_allocator: region too small after trimming: {:?}", entry);
                continue;
            }

            let base = Frame::containing_address(PhysicalAddress::new_canonical(begin as usize));
            let page_count = ((end - begin) / PAGE_SIZE as u64) as usize;
            total_free_pages += page_count;
            let region = PhysicalRegion::new(base, page_count);
            debug!("frame_allocator: new {:?}", region);
            regions.push(region);
        }

        info!(
            "frame_allocator: {} regions, {} free pages ({} MiB)",
            regions.len(),
            total_free_pages,
            total_free_pages * PAGE_SIZE / (1024 * 1024),
        );

        FrameAllocator { regions }
    }

    /// Allocates one zeroed frame. Out of memory is fatal.
    pub fn allocate(&'static self) -> AllocatedFrame {
        for region in &self.regions {
            if let Some(frame) = region.allocate() {
                linear_map::zero_frame(frame);
                return AllocatedFrame { frame, owner: self };
            }
        }
        panic!("frame_allocator: out of physical memory");
    }

    fn free(&self, frame: Frame) {
        for region in &self.regions {
            if region.contains(frame) {
                region.free(frame);
                return;
            }
        }
        panic!("frame_allocator: no region owns {:?}", frame);
    }

    pub fn regions(&self) -> &[PhysicalRegion] {
        &self.regions
    }

    pub fn free_count(&self) -> usize {
        self.regions.iter().map(|r| r.free_count()).sum()
    }
}

/// An owned, zeroed physical frame.
///
/// Dropping the handle returns the frame to its allocator. Frames that
/// live for the kernel's lifetime are transferred out with [`leak`].
///
/// [`leak`]: AllocatedFrame::leak
pub struct AllocatedFrame {
    frame: Frame,
    owner: &'static FrameAllocator,
}

impl AllocatedFrame {
    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn start_address(&self) -> PhysicalAddress {
        self.frame.start_address()
    }

    /// Transfers ownership of the frame out of the drop-based lifecycle.
    /// The caller becomes responsible for the frame forever.
    pub fn leak(self) -> Frame {
        let frame = self.frame;
        core::mem::forget(self);
        frame
    }
}

impl Drop for AllocatedFrame {
    fn drop(&mut self) {
        self.owner.free(self.frame);
    }
}

impl fmt::Debug for AllocatedFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AllocatedFrame({:?})", self.frame)
    }
}

/// The system-wide frame allocator instance.
static FRAME_ALLOCATOR: Once<FrameAllocator> = Once::new();

/// Initializes the system-wide allocator from the released boot map.
/// The linear mapping must already be usable, since freshly allocated
/// frames are zeroed through it.
pub fn init(map: &MemoryMap) -> Result<&'static FrameAllocator, &'static str> {
    if FRAME_ALLOCATOR.get().is_some() {
        return Err("frame_allocator: already initialized");
    }
    Ok(FRAME_ALLOCATOR.call_once(|| FrameAllocator::from_memory_map(map)))
}

/// Allocates one zeroed frame from the system-wide allocator.
pub fn allocate_frame() -> AllocatedFrame {
    FRAME_ALLOCATOR
        .get()
        .expect("frame_allocator: used before init")
        .allocate()
}

/// The system-wide allocator, if initialized.
pub fn get() -> Option<&'static FrameAllocator> {
    FRAME_ALLOCATOR.get()
}

#[cfg(test)]
mod test;
