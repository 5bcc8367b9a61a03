//! The suspension primitive threads block on.
//!
//! A [`Blocker`] is installed by the thread that intends to sleep, then
//! handed (by reference) to whatever will produce the wakeup: an interrupt
//! top-half, another thread, a completion routine. [`Blocker::block`]
//! returns once [`Blocker::unblock`] or [`Blocker::interrupt`] has been
//! called, *including when that happened before `block()` itself ran*,
//! which is the property the deferred-IRQ worker and I/O completion paths
//! rely on to never lose a wakeup.
//!
//! How a blocked thread actually waits is the scheduler's business: it
//! installs park/wake functions at bring-up ([`set_park_ops`]). Until
//! then (and on the host, where unit tests exercise real cross-thread
//! wakeups) blocking is a pause loop.

#![no_std]

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

/// Why `block()` returned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockResult {
    /// Another actor called `unblock()`.
    Unblocked,
    /// The thread was interrupted (e.g., signaled) while waiting.
    Interrupted,
}

const ARMED: u32 = 0;
const UNBLOCKED: u32 = 1;
const INTERRUPTED: u32 = 2;

/// A one-shot wait object. See the crate docs.
pub struct Blocker {
    state: AtomicU32,
}

impl Blocker {
    pub const fn new() -> Blocker {
        Blocker { state: AtomicU32::new(ARMED) }
    }

    /// Waits until this blocker is signalled. Returns immediately if it
    /// already was.
    pub fn block(&self) -> BlockResult {
        loop {
            match self.state.load(Ordering::Acquire) {
                UNBLOCKED => return BlockResult::Unblocked,
                INTERRUPTED => return BlockResult::Interrupted,
                _ => park(),
            }
        }
    }

    /// Signals the blocker, releasing the blocked thread (or making the
    /// upcoming `block()` call return immediately). Idempotent; an
    /// interruption that arrived first wins.
    pub fn unblock(&self) {
        let _ = self.state.compare_exchange(
            ARMED,
            UNBLOCKED,
            Ordering::Release,
            Ordering::Relaxed,
        );
        wake();
    }

    /// Marks the waiting thread as interrupted.
    pub fn interrupt(&self) {
        let _ = self.state.compare_exchange(
            ARMED,
            INTERRUPTED,
            Ordering::Release,
            Ordering::Relaxed,
        );
        wake();
    }

    /// Whether this blocker has already been signalled.
    pub fn is_signalled(&self) -> bool {
        self.state.load(Ordering::Acquire) != ARMED
    }
}

impl Default for Blocker {
    fn default() -> Self {
        Self::new()
    }
}

/// How a blocked thread yields, and how a signaller nudges the scheduler.
pub struct ParkOps {
    /// Called repeatedly while waiting; the scheduler's version
    /// deschedules the current thread.
    pub park: fn(),
    /// Called after a signal is published.
    pub wake: fn(),
}

static PARK_OPS: Once<ParkOps> = Once::new();

/// Installs the scheduler's park/wake strategy. Before this is called,
/// waiting is a spin loop.
pub fn set_park_ops(ops: ParkOps) {
    PARK_OPS.call_once(|| ops);
}

fn park() {
    match PARK_OPS.get() {
        Some(ops) => (ops.park)(),
        None => core::hint::spin_loop(),
    }
}

fn wake() {
    if let Some(ops) = PARK_OPS.get() {
        (ops.wake)();
    }
}

#[cfg(test)]
mod test;
