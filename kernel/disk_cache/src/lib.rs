//! An LRU cache between a filesystem and its storage device.
//!
//! The filesystem above addresses fixed-size *FS blocks*; the device
//! below addresses *logical sectors* (512 or 4096 bytes). The cache
//! mediates in slots of `io_size = max(fs_block_size, page)` bytes, so a
//! slot holds several small FS blocks (and they live or die together:
//! eviction is strict LRU over whole slots).
//!
//! Geometry invariants, fixed at construction:
//! * `io_size` is a multiple of both the FS block size and the page size;
//! * `fs_blocks_per_io = io_size / fs_block_size`;
//! * a slot's map key is its first FS block,
//!   `index & !(fs_blocks_per_io - 1)`.
//!
//! A RAM-backed device needs none of this: `io_size` is zero and every
//! operation passes straight through on the byte-addressed path.
//!
//! Slot buffers are allocated lazily, on first use of each slot, and are
//! never freed; a long-lived cache converges to `capacity` live slots.
//!
//! Concurrency: one caller at a time (the owning filesystem serializes).
//! Copies in and out of user buffers go through the fault-intercepting
//! copy and surface [`ErrorCode::MemoryAccessViolation`] instead of
//! faulting the kernel.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use error_code::ErrorCode;
use hashbrown::HashMap;
use kernel_config::memory::PAGE_SIZE;
use log::{debug, info, warn};
use memory::safe_copy_memory;
use memory_structs::LbaRange;
use storage_device::{AsyncRequest, MediumType, RamdiskRequest, StorageDevice};

/// `io_size` value marking a pass-through (RAM-backed) cache.
const NO_CACHING_REQUIRED: usize = 0;

/// Index value for "no slot" in the intrusive LRU links.
const NIL: usize = usize::MAX;

struct CacheSlot {
    /// Lazily allocated backing of `io_size` bytes.
    buffer: Option<Box<[u8]>>,
    /// First FS block held by this slot (the map key).
    first_fs_block: u64,
    dirty: bool,
    /// LRU list links (slot indices).
    prev: usize,
    next: usize,
}

pub struct DiskCache {
    device: Arc<dyn StorageDevice>,
    fs_lba_range: LbaRange,
    logical_block_size: usize,
    fs_block_size: usize,
    io_size: usize,
    fs_blocks_per_io: u64,
    /// Capacity in slots (re-denominated from the FS-block capacity the
    /// caller asked for).
    capacity: usize,

    slots: Vec<CacheSlot>,
    /// Slots detached from the LRU/map after a failed fill, ready for
    /// reuse before the cache grows or evicts.
    free_slots: Vec<usize>,
    /// `first_fs_block` -> slot index. Mirrors the LRU list exactly.
    block_to_slot: HashMap<u64, usize>,
    /// Most recently used slot.
    lru_head: usize,
    /// Eviction candidate.
    lru_tail: usize,
}

impl DiskCache {
    /// Builds a cache of (at first) `block_capacity` FS blocks in front
    /// of `device`, covering the partition `fs_lba_range`.
    pub fn new(
        device: Arc<dyn StorageDevice>,
        fs_lba_range: LbaRange,
        fs_block_size: usize,
        block_capacity: usize,
    ) -> DiskCache {
        assert!(block_capacity != 0);

        let info = device.info();
        assert!(
            info.logical_block_size == 512 || info.logical_block_size == 4096,
            "DiskCache: unsupported logical sector size {}",
            info.logical_block_size,
        );

        let mut cache = DiskCache {
            device,
            fs_lba_range,
            logical_block_size: info.logical_block_size,
            fs_block_size,
            io_size: NO_CACHING_REQUIRED,
            fs_blocks_per_io: 1,
            capacity: block_capacity,
            slots: Vec::new(),
            free_slots: Vec::new(),
            block_to_slot: HashMap::new(),
            lru_head: NIL,
            lru_tail: NIL,
        };

        // A filesystem living entirely in RAM needs no IO caching.
        if info.medium == MediumType::Ram {
            debug!("DiskCache: RAM medium, running as a pass-through");
            return cache;
        }

        if fs_block_size >= PAGE_SIZE {
            assert!(
                fs_block_size % PAGE_SIZE == 0,
                "DiskCache: FS block size {:#X} is not page aligned",
                fs_block_size,
            );
            cache.io_size = fs_block_size;
        } else {
            cache.io_size = PAGE_SIZE;
            assert!(cache.io_size % fs_block_size == 0);
        }
        cache.fs_blocks_per_io = (cache.io_size / fs_block_size) as u64;

        // Capacity is measured in slots, not FS blocks, unless an FS
        // block fills a whole slot by itself.
        cache.capacity = block_capacity / cache.fs_blocks_per_io as usize;
        assert!(cache.capacity != 0, "DiskCache: capacity too small for even one slot");

        info!(
            "DiskCache: {} slots of {} bytes, {} FS blocks per slot",
            cache.capacity, cache.io_size, cache.fs_blocks_per_io,
        );

        if fs_lba_range.start() % 8 != 0
            && cache.logical_block_size == 512
            && fs_block_size < cache.io_size
        {
            warn!(
                "DiskCache: partition starts at unaligned logical block {}, expect poor performance",
                fs_lba_range.start(),
            );
        }

        cache
    }

    /// The slot size in bytes; zero for a pass-through cache.
    pub fn io_size(&self) -> usize {
        self.io_size
    }

    pub fn fs_blocks_per_io(&self) -> u64 {
        self.fs_blocks_per_io
    }

    pub fn capacity_in_slots(&self) -> usize {
        self.capacity
    }

    pub fn cached_slot_count(&self) -> usize {
        self.block_to_slot.len()
    }

    /// The device sector holding the first byte of the FS block.
    pub fn block_to_first_lba(&self, block_index: u64) -> u64 {
        let byte_offset = block_index * self.fs_block_size as u64;
        self.fs_lba_range.start() + byte_offset / self.logical_block_size as u64
    }

    /// The sector range one slot-sized transfer for `key` covers.
    ///
    /// With small FS blocks on 512-byte sectors, the transfer is aligned
    /// down to the 8-sector boundary so slot reads match page-sized disk
    /// stripes.
    pub fn block_to_lba_range(&self, key: u64) -> LbaRange {
        let mut lba_offset =
            key * self.fs_block_size as u64 / self.logical_block_size as u64;
        let sectors_per_slot = (self.io_size / self.logical_block_size) as u64;

        if self.fs_block_size < self.io_size && self.logical_block_size == 512 {
            lba_offset &= !0b111;
        }

        let range = LbaRange::new(self.fs_lba_range.start() + lba_offset, sectors_per_slot);
        assert!(
            self.fs_lba_range.contains_range(&range),
            "DiskCache: slot transfer {:?} escapes the filesystem range {:?}",
            range,
            self.fs_lba_range,
        );
        range
    }

    fn key_for(&self, block_index: u64) -> u64 {
        block_index & !(self.fs_blocks_per_io - 1)
    }

    // --- LRU list management (index-linked, O(1)) ---

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.lru_tail = prev;
        }
        self.slots[index].prev = NIL;
        self.slots[index].next = NIL;
    }

    fn push_front(&mut self, index: usize) {
        self.slots[index].prev = NIL;
        self.slots[index].next = self.lru_head;
        if self.lru_head != NIL {
            self.slots[self.lru_head].prev = index;
        } else {
            self.lru_tail = index;
        }
        self.lru_head = index;
    }

    /// Resolves an FS block to `(slot index, byte offset of the block
    /// within the slot)`, faulting the slot in from the device on a miss
    /// and evicting the least recently used slot when full.
    fn cached_slot(&mut self, block_index: u64) -> Result<(usize, usize), ErrorCode> {
        let key = self.key_for(block_index);
        let offset = ((block_index - key) * self.fs_block_size as u64) as usize;

        if let Some(&index) = self.block_to_slot.get(&key) {
            // Hit: refresh its recency.
            self.unlink(index);
            self.push_front(index);
            return Ok((index, offset));
        }

        let index = if let Some(free) = self.free_slots.pop() {
            free
        } else if self.slots.len() == self.capacity {
            self.evict_one()?
        } else {
            // Grow on demand: a fresh slot with a fresh buffer.
            self.slots.push(CacheSlot {
                buffer: Some(vec![0u8; self.io_size].into_boxed_slice()),
                first_fs_block: 0,
                dirty: false,
                prev: NIL,
                next: NIL,
            });
            self.slots.len() - 1
        };

        let lba_range = self.block_to_lba_range(key);
        let request = AsyncRequest::make_read(
            self.slots[index].buffer.as_mut().unwrap().as_mut_ptr(),
            lba_range,
        );
        self.device.submit_request(&request);
        request.wait().into_result().map_err(|code| {
            warn!("DiskCache: read of slot {:#X} failed: {:?}", key, code);
            // The slot never made it into the map or the LRU list; park
            // it on the freelist for the next miss.
            self.free_slots.push(index);
            code
        })?;

        self.slots[index].first_fs_block = key;
        self.slots[index].dirty = false;
        self.block_to_slot.insert(key, index);
        self.push_front(index);

        Ok((index, offset))
    }

    /// Detaches the least recently used slot for reuse, writing it back
    /// first if dirty.
    fn evict_one(&mut self) -> Result<usize, ErrorCode> {
        let victim = self.lru_tail;
        assert!(victim != NIL, "DiskCache: eviction from an empty cache");

        debug!("DiskCache: evicting slot of FS block {:#X}", self.slots[victim].first_fs_block);

        if self.slots[victim].dirty {
            self.flush_slot(victim)?;
        }
        self.unlink(victim);
        self.block_to_slot.remove(&self.slots[victim].first_fs_block);
        self.slots[victim].first_fs_block = 0;
        Ok(victim)
    }

    fn flush_slot(&mut self, index: usize) -> Result<(), ErrorCode> {
        if !self.slots[index].dirty {
            return Ok(());
        }

        let key = self.slots[index].first_fs_block;
        debug!("DiskCache: flushing slot of FS block {:#X}", key);

        let lba_range = self.block_to_lba_range(key);
        let request = AsyncRequest::make_write(
            self.slots[index].buffer.as_ref().unwrap().as_ptr(),
            lba_range,
        );
        self.device.submit_request(&request);
        request.wait().into_result()?;

        self.slots[index].dirty = false;
        Ok(())
    }

    /// Reads `byte_count` bytes from the FS block at `offset` within it.
    pub fn read_one(
        &mut self,
        block_index: u64,
        offset: usize,
        byte_count: usize,
        buffer: *mut u8,
    ) -> ErrorCode {
        assert!(offset + byte_count <= self.fs_block_size);

        if self.io_size == NO_CACHING_REQUIRED {
            let full_offset = offset + block_index as usize * self.fs_block_size;
            let request = RamdiskRequest::make_read(buffer, full_offset, byte_count);
            self.device.submit_ramdisk_request(&request);
            return request.result();
        }

        let (index, slot_offset) = match self.cached_slot(block_index) {
            Ok(resolved) => resolved,
            Err(code) => return code,
        };

        let source = unsafe {
            self.slots[index].buffer.as_ref().unwrap().as_ptr().add(slot_offset + offset)
        };
        if !safe_copy_memory(buffer, source, byte_count) {
            return ErrorCode::MemoryAccessViolation;
        }
        ErrorCode::NoError
    }

    /// Writes `byte_count` bytes into the FS block at `offset` within it.
    pub fn write_one(
        &mut self,
        block_index: u64,
        offset: usize,
        byte_count: usize,
        buffer: *const u8,
    ) -> ErrorCode {
        assert!(offset + byte_count <= self.fs_block_size);

        if self.io_size == NO_CACHING_REQUIRED {
            let full_offset = offset + block_index as usize * self.fs_block_size;
            let request = RamdiskRequest::make_write(buffer, full_offset, byte_count);
            self.device.submit_ramdisk_request(&request);
            return request.result();
        }

        let (index, slot_offset) = match self.cached_slot(block_index) {
            Ok(resolved) => resolved,
            Err(code) => return code,
        };

        // Mark dirty before copying: a partially faulting copy may still
        // have modified the slot.
        self.slots[index].dirty = true;
        let destination = unsafe {
            self.slots[index].buffer.as_mut().unwrap().as_mut_ptr().add(slot_offset + offset)
        };
        if !safe_copy_memory(destination, buffer, byte_count) {
            return ErrorCode::MemoryAccessViolation;
        }
        ErrorCode::NoError
    }

    /// Zero-fills the whole FS block.
    pub fn zero_fill_one(&mut self, block_index: u64) -> ErrorCode {
        if self.io_size == NO_CACHING_REQUIRED {
            let zeroes = vec![0u8; self.fs_block_size];
            let full_offset = block_index as usize * self.fs_block_size;
            let request =
                RamdiskRequest::make_write(zeroes.as_ptr(), full_offset, self.fs_block_size);
            self.device.submit_ramdisk_request(&request);
            return request.result();
        }

        let (index, slot_offset) = match self.cached_slot(block_index) {
            Ok(resolved) => resolved,
            Err(code) => return code,
        };

        let slot = &mut self.slots[index];
        slot.buffer.as_mut().unwrap()[slot_offset..slot_offset + self.fs_block_size].fill(0);
        slot.dirty = true;
        ErrorCode::NoError
    }

    /// Writes back the slot holding `block_index`, if cached and dirty.
    pub fn flush_specific(&mut self, block_index: u64) -> ErrorCode {
        if self.io_size == NO_CACHING_REQUIRED {
            return ErrorCode::NoError;
        }

        let key = self.key_for(block_index);
        let Some(&index) = self.block_to_slot.get(&key) else {
            warn!("DiskCache: was asked to flush uncached block {:#X}", block_index);
            return ErrorCode::NoError;
        };

        match self.flush_slot(index) {
            Ok(()) => ErrorCode::NoError,
            Err(code) => code,
        }
    }

    /// Writes back every dirty slot.
    pub fn flush_all(&mut self) -> ErrorCode {
        if self.io_size == NO_CACHING_REQUIRED {
            return ErrorCode::NoError;
        }

        let mut flushed = 0usize;
        let mut index = self.lru_head;
        while index != NIL {
            if self.slots[index].dirty {
                if let Err(code) = self.flush_slot(index) {
                    return code;
                }
                flushed += 1;
            }
            index = self.slots[index].next;
        }

        if flushed != 0 {
            info!("DiskCache: flushed {} slots", flushed);
        }
        ErrorCode::NoError
    }

    /// The map and the LRU list must always describe the same set of
    /// slots. Checked by tests and debug assertions.
    pub fn verify_index_invariant(&self) -> bool {
        let mut listed = 0usize;
        let mut index = self.lru_head;
        while index != NIL {
            if self.block_to_slot.get(&self.slots[index].first_fs_block) != Some(&index) {
                return false;
            }
            listed += 1;
            index = self.slots[index].next;
        }
        listed == self.block_to_slot.len()
    }
}
