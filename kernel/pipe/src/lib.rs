//! Anonymous pipes.
//!
//! A pipe is a page-rounded ring buffer shared by read-side and
//! write-side handles. Reads and writes are non-blocking and partial: a
//! read of an empty pipe returns 0 bytes, a write to a full one accepts
//! 0, and callers that want to wait use [`Pipe::block_until_readable`] /
//! [`Pipe::block_until_writable`], which park the thread on the pipe's
//! wait lists.
//!
//! The end-of-stream rules follow from the handle counts: waiting to
//! read with no writers left (or vice versa) can never succeed and
//! fails with [`ErrorCode::WouldBlockForever`]; the last handle of a
//! side dropping wakes the opposite side's waiters so nobody sleeps
//! through it. Copies go through the fault-intercepting primitive, and
//! a faulting user buffer rolls the ring state back and reports
//! [`ErrorCode::MemoryAccessViolation`].

#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use blocker::{BlockResult, Blocker};
use error_code::ErrorCode;
use kernel_config::memory::PAGE_SIZE;
use log::trace;
use memory::safe_copy_memory;
use sync_irq::IrqSafeMutex;

/// Which end of the pipe a handle is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Read,
    Write,
}

struct Ring {
    buffer: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    /// Bytes currently stored.
    size: usize,
    read_waiters: Vec<Arc<Blocker>>,
    write_waiters: Vec<Arc<Blocker>>,
}

struct State {
    ring: IrqSafeMutex<Ring>,
    reader_count: AtomicUsize,
    writer_count: AtomicUsize,
}

impl State {
    fn wake_all(waiters: &mut Vec<Arc<Blocker>>) {
        for waiter in waiters.drain(..) {
            waiter.unblock();
        }
    }
}

/// One end of a pipe.
pub struct Pipe {
    state: Arc<State>,
    side: Side,
    closed: AtomicBool,
}

impl Pipe {
    /// Creates a connected (reader, writer) pair with at least
    /// `capacity` bytes of buffer (rounded up to whole pages).
    pub fn create_pair(capacity: usize) -> (Pipe, Pipe) {
        assert!(capacity > 0);
        let capacity = (capacity + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let state = Arc::new(State {
            ring: IrqSafeMutex::new(Ring {
                buffer: vec![0u8; capacity],
                read_offset: 0,
                write_offset: 0,
                size: 0,
                read_waiters: Vec::new(),
                write_waiters: Vec::new(),
            }),
            reader_count: AtomicUsize::new(1),
            writer_count: AtomicUsize::new(1),
        });

        let reader = Pipe {
            state: state.clone(),
            side: Side::Read,
            closed: AtomicBool::new(false),
        };
        let writer = Pipe { state, side: Side::Write, closed: AtomicBool::new(false) };
        (reader, writer)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Duplicates this handle (same side, same pipe).
    pub fn clone_handle(&self) -> Result<Pipe, ErrorCode> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ErrorCode::StreamClosed);
        }
        match self.side {
            Side::Read => self.state.reader_count.fetch_add(1, Ordering::AcqRel),
            Side::Write => self.state.writer_count.fetch_add(1, Ordering::AcqRel),
        };
        Ok(Pipe {
            state: self.state.clone(),
            side: self.side,
            closed: AtomicBool::new(false),
        })
    }

    /// Reads up to `bytes` into `buffer`, returning how many were read
    /// (0 when the pipe is empty).
    pub fn read(&self, buffer: *mut u8, bytes: usize) -> Result<usize, ErrorCode> {
        if self.side == Side::Write {
            return Err(ErrorCode::AccessDenied);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ErrorCode::StreamClosed);
        }

        let mut ring = self.state.ring.lock();
        if ring.size == 0 {
            return Ok(0);
        }

        let to_read = core::cmp::min(bytes, ring.size);
        let initial_read_offset = ring.read_offset;
        let initial_size = ring.size;

        // The ring wraps, so a single request is at most two copies.
        let mut remaining = to_read;
        let mut out = buffer;
        while remaining > 0 {
            let contiguous = core::cmp::min(remaining, ring.buffer.len() - ring.read_offset);
            let source = unsafe { ring.buffer.as_ptr().add(ring.read_offset) };
            if !safe_copy_memory(out, source, contiguous) {
                ring.read_offset = initial_read_offset;
                ring.size = initial_size;
                return Err(ErrorCode::MemoryAccessViolation);
            }
            remaining -= contiguous;
            out = unsafe { out.add(contiguous) };
            ring.read_offset += contiguous;
            ring.size -= contiguous;
            if ring.read_offset == ring.buffer.len() {
                ring.read_offset = 0;
            }
        }

        // Space opened up; release anyone waiting to write.
        State::wake_all(&mut ring.write_waiters);
        Ok(to_read)
    }

    /// Writes up to `bytes` from `buffer`, returning how many were
    /// accepted (0 when the pipe is full).
    pub fn write(&self, buffer: *const u8, bytes: usize) -> Result<usize, ErrorCode> {
        if self.side == Side::Read {
            return Err(ErrorCode::AccessDenied);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ErrorCode::StreamClosed);
        }

        let mut ring = self.state.ring.lock();
        let space = ring.buffer.len() - ring.size;
        if space == 0 {
            return Ok(0);
        }

        let to_write = core::cmp::min(bytes, space);
        let initial_write_offset = ring.write_offset;
        let initial_size = ring.size;

        let mut remaining = to_write;
        let mut input = buffer;
        while remaining > 0 {
            let contiguous = core::cmp::min(remaining, ring.buffer.len() - ring.write_offset);
            let destination = unsafe { ring.buffer.as_mut_ptr().add(ring.write_offset) };
            if !safe_copy_memory(destination, input, contiguous) {
                ring.write_offset = initial_write_offset;
                ring.size = initial_size;
                return Err(ErrorCode::MemoryAccessViolation);
            }
            remaining -= contiguous;
            input = unsafe { input.add(contiguous) };
            ring.write_offset += contiguous;
            ring.size += contiguous;
            if ring.write_offset == ring.buffer.len() {
                ring.write_offset = 0;
            }
        }

        State::wake_all(&mut ring.read_waiters);
        Ok(to_write)
    }

    /// Parks the calling thread until the pipe has data to read.
    ///
    /// Fails with `WouldBlockForever` once no writer is left: nothing
    /// could ever wake the sleeper.
    pub fn block_until_readable(&self) -> Result<BlockResult, ErrorCode> {
        if self.side == Side::Write {
            return Err(ErrorCode::AccessDenied);
        }

        let waiter = Arc::new(Blocker::new());
        {
            let mut ring = self.state.ring.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(ErrorCode::StreamClosed);
            }
            if ring.size != 0 {
                return Ok(BlockResult::Unblocked);
            }
            if self.state.writer_count.load(Ordering::Acquire) == 0 {
                return Err(ErrorCode::WouldBlockForever);
            }
            ring.read_waiters.push(waiter.clone());
        }

        let result = waiter.block();
        self.remove_waiter(&waiter, Side::Read);
        Ok(result)
    }

    /// Parks the calling thread until the pipe has room to write.
    pub fn block_until_writable(&self) -> Result<BlockResult, ErrorCode> {
        if self.side == Side::Read {
            return Err(ErrorCode::AccessDenied);
        }

        let waiter = Arc::new(Blocker::new());
        {
            let mut ring = self.state.ring.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(ErrorCode::StreamClosed);
            }
            if ring.size != ring.buffer.len() {
                return Ok(BlockResult::Unblocked);
            }
            if self.state.reader_count.load(Ordering::Acquire) == 0 {
                return Err(ErrorCode::WouldBlockForever);
            }
            ring.write_waiters.push(waiter.clone());
        }

        let result = waiter.block();
        self.remove_waiter(&waiter, Side::Write);
        Ok(result)
    }

    /// An interrupted waiter removes itself from the wait list it
    /// joined; a woken one was already drained by the waker.
    fn remove_waiter(&self, waiter: &Arc<Blocker>, side: Side) {
        let mut ring = self.state.ring.lock();
        let list = match side {
            Side::Read => &mut ring.read_waiters,
            Side::Write => &mut ring.write_waiters,
        };
        list.retain(|existing| !Arc::ptr_eq(existing, waiter));
    }

    /// Closes this handle. The last handle of a side wakes the other
    /// side's waiters, whose blocked operations then re-evaluate.
    pub fn close(&self) -> Result<(), ErrorCode> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ErrorCode::StreamClosed);
        }

        let counter = match self.side {
            Side::Read => &self.state.reader_count,
            Side::Write => &self.state.writer_count,
        };
        let remaining = counter.fetch_sub(1, Ordering::AcqRel) - 1;

        if remaining == 0 {
            trace!("pipe: last {:?} handle closed", self.side);
            let mut ring = self.state.ring.lock();
            match self.side {
                // No more readers: writers can never make progress.
                Side::Read => State::wake_all(&mut ring.write_waiters),
                // No more writers: wake readers to observe end of stream.
                Side::Write => State::wake_all(&mut ring.read_waiters),
            }
        }
        Ok(())
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod test;
