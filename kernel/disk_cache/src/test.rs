extern crate std;

use super::*;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use std::vec::Vec;
use storage_device::ramdisk::Ramdisk;
use storage_device::{DeviceInfo, RequestKind};

/// A sector-backed fake disk that counts transfers.
struct TestDisk {
    sectors: Mutex<Vec<u8>>,
    logical_block_size: usize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl TestDisk {
    fn new(logical_block_size: usize, sector_count: u64) -> Arc<TestDisk> {
        Arc::new(TestDisk {
            sectors: Mutex::new(vec![0u8; logical_block_size * sector_count as usize]),
            logical_block_size,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    /// Every byte of sector `i` holds `i as u8`, so reads are checkable.
    fn with_sector_pattern(logical_block_size: usize, sector_count: u64) -> Arc<TestDisk> {
        let disk = TestDisk::new(logical_block_size, sector_count);
        {
            let mut sectors = disk.sectors.lock();
            for sector in 0..sector_count as usize {
                let begin = sector * logical_block_size;
                sectors[begin..begin + logical_block_size].fill(sector as u8);
            }
        }
        disk
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn sector_bytes(&self, lba: u64) -> Vec<u8> {
        let begin = lba as usize * self.logical_block_size;
        self.sectors.lock()[begin..begin + self.logical_block_size].to_vec()
    }
}

impl StorageDevice for TestDisk {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            logical_block_size: self.logical_block_size,
            logical_block_count: (self.sectors.lock().len() / self.logical_block_size) as u64,
            medium: MediumType::Disk,
        }
    }

    fn submit_request(&self, request: &AsyncRequest) {
        let range = request.lba_range();
        let begin = range.start() as usize * self.logical_block_size;
        let byte_count = range.count() as usize * self.logical_block_size;
        let mut sectors = self.sectors.lock();
        assert!(begin + byte_count <= sectors.len(), "transfer beyond the fake disk");

        unsafe {
            match request.kind() {
                RequestKind::Read => {
                    self.reads.fetch_add(1, Ordering::SeqCst);
                    core::ptr::copy_nonoverlapping(
                        sectors.as_ptr().add(begin),
                        request.buffer(),
                        byte_count,
                    );
                }
                RequestKind::Write => {
                    self.writes.fetch_add(1, Ordering::SeqCst);
                    core::ptr::copy_nonoverlapping(
                        request.buffer() as *const u8,
                        sectors.as_mut_ptr().add(begin),
                        byte_count,
                    );
                }
            }
        }
        request.complete(ErrorCode::NoError);
    }
}

fn read_block(cache: &mut DiskCache, block: u64, offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    assert_eq!(cache.read_one(block, offset, len, out.as_mut_ptr()), ErrorCode::NoError);
    out
}

fn write_block(cache: &mut DiskCache, block: u64, offset: usize, data: &[u8]) {
    assert_eq!(
        cache.write_one(block, offset, data.len(), data.as_ptr()),
        ErrorCode::NoError,
    );
}

#[test]
fn geometry_for_small_fs_blocks() {
    let disk = TestDisk::new(512, 1024);
    let cache = DiskCache::new(disk, LbaRange::new(0, 1024), 1024, 64);

    assert_eq!(cache.io_size(), 4096);
    assert_eq!(cache.fs_blocks_per_io(), 4);
    // 64 FS blocks re-denominated into 4-block slots.
    assert_eq!(cache.capacity_in_slots(), 16);
}

#[test]
fn geometry_for_large_fs_blocks() {
    let disk = TestDisk::new(512, 1024);
    let cache = DiskCache::new(disk, LbaRange::new(0, 1024), 8192, 8);

    assert_eq!(cache.io_size(), 8192);
    assert_eq!(cache.fs_blocks_per_io(), 1);
    assert_eq!(cache.capacity_in_slots(), 8);
}

#[test]
fn first_lba_includes_the_partition_base() {
    // 8 KiB FS blocks on 512-byte sectors, partition starting at 33.
    let disk = TestDisk::new(512, 4096);
    let cache = DiskCache::new(disk, LbaRange::new(33, 4000), 8192, 8);

    let sectors_per_block = 8192 / 512;
    assert_eq!(cache.block_to_first_lba(0), 33);
    assert_eq!(cache.block_to_first_lba(4), 33 + 4 * sectors_per_block);
    assert_eq!(cache.block_to_first_lba(7), 33 + 7 * sectors_per_block);
}

#[test]
fn first_lba_with_sectors_larger_than_fs_blocks() {
    // 512-byte FS blocks on 4 KiB sectors: eight blocks per sector.
    let disk = TestDisk::new(4096, 128);
    let cache = DiskCache::new(disk, LbaRange::new(0, 128), 512, 64);

    assert_eq!(cache.block_to_first_lba(0), 0);
    assert_eq!(cache.block_to_first_lba(7), 0);
    assert_eq!(cache.block_to_first_lba(8), 1);
    assert_eq!(cache.block_to_first_lba(25), 3);
}

#[test]
fn slot_transfers_align_to_eight_sectors() {
    let disk = TestDisk::new(512, 1024);
    let cache = DiskCache::new(disk, LbaRange::new(33, 512), 1024, 64);

    // Key 4 sits at sector offset 8 within the partition; offsets stay
    // aligned even though the partition base itself is not.
    let range = cache.block_to_lba_range(4);
    assert_eq!(range.start(), 33 + 8);
    assert_eq!(range.count(), 8);

    // Key 2 would start mid-stripe (offset 4); it is aligned down.
    let range = cache.block_to_lba_range(2);
    assert_eq!(range.start(), 33);
    assert_eq!(range.count(), 8);
}

#[test]
fn hits_misses_and_clean_eviction() {
    let disk = TestDisk::new(512, 1024);
    // One FS block per slot, two slots.
    let mut cache = DiskCache::new(disk.clone(), LbaRange::new(0, 1024), 4096, 2);

    read_block(&mut cache, 0, 0, 16);
    assert_eq!(disk.reads(), 1);
    read_block(&mut cache, 1, 0, 16);
    assert_eq!(disk.reads(), 2);

    // A hit refreshes recency and does no I/O.
    read_block(&mut cache, 0, 0, 16);
    assert_eq!(disk.reads(), 2);

    // Block 2 misses; block 1 is now the LRU tail and clean, so its
    // eviction costs no writeback.
    write_block(&mut cache, 2, 0, &[0xEE]);
    assert_eq!(disk.reads(), 3);
    assert_eq!(disk.writes(), 0);
    assert_eq!(cache.cached_slot_count(), 2);
    assert!(cache.verify_index_invariant());

    // Exactly one dirty slot to write back.
    assert_eq!(cache.flush_all(), ErrorCode::NoError);
    assert_eq!(disk.writes(), 1);

    // A second flush with nothing newly written performs zero I/O.
    assert_eq!(cache.flush_all(), ErrorCode::NoError);
    assert_eq!(disk.writes(), 1);
}

#[test]
fn written_data_survives_eviction() {
    let disk = TestDisk::new(512, 1024);
    let mut cache = DiskCache::new(disk.clone(), LbaRange::new(0, 1024), 4096, 2);

    let payload: Vec<u8> = (0..64u8).collect();
    write_block(&mut cache, 0, 128, &payload);

    // Push block 0 out through the LRU tail.
    read_block(&mut cache, 1, 0, 16);
    read_block(&mut cache, 2, 0, 16);
    assert_eq!(disk.writes(), 1, "dirty eviction must write back");

    // Reading it again faults the slot back in from the device.
    assert_eq!(read_block(&mut cache, 0, 128, 64), payload);
    assert!(cache.verify_index_invariant());
}

#[test]
fn sub_block_offsets_resolve_within_the_slot() {
    // Four 1 KiB FS blocks per slot, prefilled with per-sector patterns.
    let disk = TestDisk::with_sector_pattern(512, 1024);
    let mut cache = DiskCache::new(disk, LbaRange::new(0, 1024), 1024, 64);

    // Block 5 lives in the slot keyed 4, at byte offset 1024; its first
    // sector is LBA 10.
    let bytes = read_block(&mut cache, 5, 0, 4);
    assert_eq!(bytes, [10, 10, 10, 10]);

    // An index equal to its key resolves at offset zero (LBA 8).
    let bytes = read_block(&mut cache, 4, 0, 4);
    assert_eq!(bytes, [8, 8, 8, 8]);

    // Intra-block offsets shift by whole sectors within the slot.
    let bytes = read_block(&mut cache, 5, 512, 4);
    assert_eq!(bytes, [11, 11, 11, 11]);
}

#[test]
fn zero_fill_clears_one_block_but_not_its_slot_mates() {
    let disk = TestDisk::with_sector_pattern(512, 1024);
    let mut cache = DiskCache::new(disk.clone(), LbaRange::new(0, 1024), 1024, 64);

    assert_eq!(cache.zero_fill_one(5), ErrorCode::NoError);
    assert_eq!(read_block(&mut cache, 5, 0, 4), [0, 0, 0, 0]);
    // The neighbor in the same slot is untouched.
    assert_eq!(read_block(&mut cache, 4, 0, 4), [8, 8, 8, 8]);

    assert_eq!(cache.flush_all(), ErrorCode::NoError);
    // On the device: block 5's sectors (LBA 10, 11) are zeroed, block
    // 4's (LBA 8) still carries its pattern.
    assert!(disk.sector_bytes(10).iter().all(|&b| b == 0));
    assert!(disk.sector_bytes(11).iter().all(|&b| b == 0));
    assert!(disk.sector_bytes(8).iter().all(|&b| b == 8));
}

#[test]
fn flush_specific_writes_only_its_slot() {
    let disk = TestDisk::new(512, 1024);
    let mut cache = DiskCache::new(disk.clone(), LbaRange::new(0, 1024), 4096, 8);

    write_block(&mut cache, 0, 0, &[1, 2, 3]);
    write_block(&mut cache, 3, 0, &[4, 5, 6]);

    assert_eq!(cache.flush_specific(3), ErrorCode::NoError);
    assert_eq!(disk.writes(), 1);

    // Flushing something that was never cached is a warning, not an
    // error, and does no I/O.
    assert_eq!(cache.flush_specific(7), ErrorCode::NoError);
    assert_eq!(disk.writes(), 1);

    assert_eq!(cache.flush_all(), ErrorCode::NoError);
    assert_eq!(disk.writes(), 2);
}

#[test]
fn ram_media_pass_straight_through() {
    let ramdisk = Arc::new(Ramdisk::new(512, 64));
    let mut cache = DiskCache::new(ramdisk.clone(), LbaRange::new(0, 64), 1024, 16);

    assert_eq!(cache.io_size(), 0);

    let payload = [7u8, 8, 9];
    write_block(&mut cache, 3, 10, &payload);
    assert_eq!(read_block(&mut cache, 3, 10, 3), payload);
    assert_eq!(cache.cached_slot_count(), 0, "pass-through must cache nothing");

    // The bytes really reached the medium (byte offset 3 * 1024 + 10).
    let mut direct = [0u8; 3];
    let request = RamdiskRequest::make_read(direct.as_mut_ptr(), 3 * 1024 + 10, 3);
    ramdisk.submit_ramdisk_request(&request);
    assert_eq!(request.result(), ErrorCode::NoError);
    assert_eq!(direct, payload);
}

#[test]
fn faulting_user_buffers_surface_as_access_violations() {
    let disk = TestDisk::new(512, 1024);
    let mut cache = DiskCache::new(disk, LbaRange::new(0, 1024), 4096, 8);

    let mut buffer = [0u8; 16];
    memory::safe_copy::simulate_fault_on_next_copy();
    assert_eq!(
        cache.read_one(0, 0, 16, buffer.as_mut_ptr()),
        ErrorCode::MemoryAccessViolation,
    );

    memory::safe_copy::simulate_fault_on_next_copy();
    assert_eq!(
        cache.write_one(0, 0, 16, buffer.as_ptr()),
        ErrorCode::MemoryAccessViolation,
    );

    // The cache itself stays coherent afterwards.
    assert!(cache.verify_index_invariant());
    assert_eq!(cache.read_one(0, 0, 16, buffer.as_mut_ptr()), ErrorCode::NoError);
}

#[test]
fn index_invariant_survives_heavy_churn() {
    let disk = TestDisk::with_sector_pattern(512, 4096);
    let mut cache = DiskCache::new(disk, LbaRange::new(0, 4096), 1024, 16); // 4 slots

    for round in 0..6u64 {
        for block in 0..32 {
            let index = (block * 7 + round) % 256;
            if index % 3 == 0 {
                write_block(&mut cache, index, 0, &[index as u8]);
            } else {
                read_block(&mut cache, index, 0, 8);
            }
            assert!(cache.verify_index_invariant());
            assert!(cache.cached_slot_count() <= cache.capacity_in_slots());
        }
        assert_eq!(cache.flush_all(), ErrorCode::NoError);
    }
}
