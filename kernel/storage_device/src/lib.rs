//! The seam between block consumers (filesystems, the disk cache) and
//! storage drivers.
//!
//! Consumers build an [`AsyncRequest`] naming a buffer and a range of
//! logical sectors, submit it, and [`wait`](AsyncRequest::wait) on its
//! completion blocker; drivers fulfil the request (immediately or from
//! their IRQ path) and [`complete`](AsyncRequest::complete) it. Devices
//! whose medium is RAM additionally serve the byte-addressed
//! [`RamdiskRequest`] fast path, which has no sector geometry at all.

#![no_std]

extern crate alloc;

pub mod ramdisk;

use core::fmt;

use blocker::Blocker;
use error_code::ErrorCode;
use memory_structs::LbaRange;
use spin::Mutex;

/// What physically backs a device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MediumType {
    Disk,
    Ram,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    /// Bytes per logical sector; 512 or 4096.
    pub logical_block_size: usize,
    pub logical_block_count: u64,
    pub medium: MediumType,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestKind {
    Read,
    Write,
}

/// A sector-addressed transfer request.
///
/// The buffer is a raw region at least `lba_range.count() *
/// logical_block_size` bytes long; the submitter keeps it alive and
/// untouched until [`wait`](AsyncRequest::wait) returns.
pub struct AsyncRequest {
    kind: RequestKind,
    buffer: *mut u8,
    lba_range: LbaRange,
    completion: Blocker,
    result: Mutex<ErrorCode>,
}

// The raw buffer pointer is only dereferenced by the driver while the
// submitter is parked in `wait()`, which is what makes handing it
// across threads sound.
unsafe impl Send for AsyncRequest {}
unsafe impl Sync for AsyncRequest {}

impl AsyncRequest {
    pub fn make_read(buffer: *mut u8, lba_range: LbaRange) -> AsyncRequest {
        AsyncRequest {
            kind: RequestKind::Read,
            buffer,
            lba_range,
            completion: Blocker::new(),
            result: Mutex::new(ErrorCode::NoError),
        }
    }

    pub fn make_write(buffer: *const u8, lba_range: LbaRange) -> AsyncRequest {
        AsyncRequest {
            kind: RequestKind::Write,
            buffer: buffer as *mut u8,
            lba_range,
            completion: Blocker::new(),
            result: Mutex::new(ErrorCode::NoError),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn lba_range(&self) -> LbaRange {
        self.lba_range
    }

    /// The transfer buffer. Only the servicing driver touches this.
    pub fn buffer(&self) -> *mut u8 {
        self.buffer
    }

    /// Blocks the calling thread until the driver completes the request,
    /// then yields the outcome.
    pub fn wait(&self) -> ErrorCode {
        self.completion.block();
        self.result()
    }

    pub fn result(&self) -> ErrorCode {
        *self.result.lock()
    }

    /// Driver side: publish the outcome and release the waiter.
    pub fn complete(&self, code: ErrorCode) {
        *self.result.lock() = code;
        self.completion.unblock();
    }
}

impl fmt::Debug for AsyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AsyncRequest({:?} {:?})", self.kind, self.lba_range)
    }
}

/// The byte-addressed fast path for RAM-backed devices.
pub struct RamdiskRequest {
    kind: RequestKind,
    buffer: *mut u8,
    offset: usize,
    byte_count: usize,
    result: Mutex<ErrorCode>,
}

unsafe impl Send for RamdiskRequest {}
unsafe impl Sync for RamdiskRequest {}

impl RamdiskRequest {
    pub fn make_read(buffer: *mut u8, offset: usize, byte_count: usize) -> RamdiskRequest {
        RamdiskRequest {
            kind: RequestKind::Read,
            buffer,
            offset,
            byte_count,
            result: Mutex::new(ErrorCode::NoError),
        }
    }

    pub fn make_write(buffer: *const u8, offset: usize, byte_count: usize) -> RamdiskRequest {
        RamdiskRequest {
            kind: RequestKind::Write,
            buffer: buffer as *mut u8,
            offset,
            byte_count,
            result: Mutex::new(ErrorCode::NoError),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn buffer(&self) -> *mut u8 {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn result(&self) -> ErrorCode {
        *self.result.lock()
    }

    pub fn set_result(&self, code: ErrorCode) {
        *self.result.lock() = code;
    }
}

/// A storage driver endpoint.
pub trait StorageDevice: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Queues (or directly services) a sector-addressed request. The
    /// submitter waits on the request for completion.
    fn submit_request(&self, request: &AsyncRequest);

    /// Services a byte-addressed request synchronously. Only meaningful
    /// for RAM-backed media.
    fn submit_ramdisk_request(&self, request: &RamdiskRequest) {
        let _ = request;
        panic!("storage_device: ramdisk request on a non-RAM device");
    }
}
