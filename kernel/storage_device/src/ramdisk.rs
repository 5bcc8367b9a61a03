//! A RAM-backed storage device.
//!
//! Serves both the sector-addressed request path (so it can stand behind
//! any filesystem unchanged) and the byte-addressed ramdisk fast path
//! that lets consumers skip sector arithmetic and caching entirely.

use alloc::vec;
use alloc::vec::Vec;

use error_code::ErrorCode;
use log::debug;
use spin::Mutex;

use crate::{
    AsyncRequest, DeviceInfo, MediumType, RamdiskRequest, RequestKind, StorageDevice,
};

pub struct Ramdisk {
    backing: Mutex<Vec<u8>>,
    logical_block_size: usize,
}

impl Ramdisk {
    /// A zero-filled ramdisk of `logical_block_count` sectors.
    pub fn new(logical_block_size: usize, logical_block_count: u64) -> Ramdisk {
        assert!(logical_block_size == 512 || logical_block_size == 4096);
        let bytes = logical_block_size * logical_block_count as usize;
        debug!("ramdisk: creating {} byte RAM disk", bytes);
        Ramdisk {
            backing: Mutex::new(vec![0u8; bytes]),
            logical_block_size,
        }
    }

    /// A ramdisk over pre-existing contents (e.g., a loaded boot module).
    pub fn from_contents(logical_block_size: usize, contents: Vec<u8>) -> Ramdisk {
        assert!(contents.len() % logical_block_size == 0);
        Ramdisk {
            backing: Mutex::new(contents),
            logical_block_size,
        }
    }
}

impl StorageDevice for Ramdisk {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            logical_block_size: self.logical_block_size,
            logical_block_count: (self.backing.lock().len() / self.logical_block_size) as u64,
            medium: MediumType::Ram,
        }
    }

    fn submit_request(&self, request: &AsyncRequest) {
        let range = request.lba_range();
        let begin = range.start() as usize * self.logical_block_size;
        let byte_count = range.count() as usize * self.logical_block_size;

        let mut backing = self.backing.lock();
        if begin + byte_count > backing.len() {
            request.complete(ErrorCode::AccessDenied);
            return;
        }

        // The submitter guarantees the buffer covers the transfer and
        // stays untouched until its wait() returns.
        unsafe {
            match request.kind() {
                RequestKind::Read => core::ptr::copy_nonoverlapping(
                    backing.as_ptr().add(begin),
                    request.buffer(),
                    byte_count,
                ),
                RequestKind::Write => core::ptr::copy_nonoverlapping(
                    request.buffer() as *const u8,
                    backing.as_mut_ptr().add(begin),
                    byte_count,
                ),
            }
        }
        request.complete(ErrorCode::NoError);
    }

    fn submit_ramdisk_request(&self, request: &RamdiskRequest) {
        let mut backing = self.backing.lock();
        let begin = request.offset();
        let byte_count = request.byte_count();

        if begin + byte_count > backing.len() {
            request.set_result(ErrorCode::AccessDenied);
            return;
        }

        unsafe {
            match request.kind() {
                RequestKind::Read => core::ptr::copy_nonoverlapping(
                    backing.as_ptr().add(begin),
                    request.buffer(),
                    byte_count,
                ),
                RequestKind::Write => core::ptr::copy_nonoverlapping(
                    request.buffer() as *const u8,
                    backing.as_mut_ptr().add(begin),
                    byte_count,
                ),
            }
        }
        request.set_result(ErrorCode::NoError);
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use memory_structs::LbaRange;
    use std::vec as stdvec;

    #[test]
    fn sector_requests_round_trip() {
        let disk = Ramdisk::new(512, 16);

        let payload = stdvec![0xA5u8; 1024];
        let write = AsyncRequest::make_write(payload.as_ptr(), LbaRange::new(4, 2));
        disk.submit_request(&write);
        assert_eq!(write.wait(), ErrorCode::NoError);

        let mut readback = stdvec![0u8; 1024];
        let read = AsyncRequest::make_read(readback.as_mut_ptr(), LbaRange::new(4, 2));
        disk.submit_request(&read);
        assert_eq!(read.wait(), ErrorCode::NoError);
        assert_eq!(readback, payload);
    }

    #[test]
    fn byte_requests_skip_sector_geometry() {
        let disk = Ramdisk::new(512, 16);

        let payload = [1u8, 2, 3, 4, 5];
        let write = RamdiskRequest::make_write(payload.as_ptr(), 100, payload.len());
        disk.submit_ramdisk_request(&write);
        assert_eq!(write.result(), ErrorCode::NoError);

        let mut readback = [0u8; 5];
        let read = RamdiskRequest::make_read(readback.as_mut_ptr(), 100, readback.len());
        disk.submit_ramdisk_request(&read);
        assert_eq!(read.result(), ErrorCode::NoError);
        assert_eq!(readback, payload);
    }

    #[test]
    fn out_of_range_transfers_are_rejected() {
        let disk = Ramdisk::new(512, 4);

        let mut buffer = stdvec![0u8; 1024];
        let read = AsyncRequest::make_read(buffer.as_mut_ptr(), LbaRange::new(3, 2));
        disk.submit_request(&read);
        assert_eq!(read.result(), ErrorCode::AccessDenied);
    }
}
