//! Deferred interrupt work.
//!
//! Interrupt top halves must stay short and lock-free; anything longer
//! is shed to a dedicated worker thread through this crate. Each
//! registered [`DeferredIrqHandler`] carries an atomic pending counter:
//! the top half calls [`DeferredIrq::deferred_invoke`], which bumps the
//! counter and pokes the worker's current blocker, and the worker later
//! calls the handler once per pending increment.
//!
//! The worker's loop is shaped so that no wakeup can be lost: a *fresh*
//! blocker is installed before the handler sweep, so an invocation that
//! arrives between the sweep and `block()` has already signalled the
//! blocker and `block()` returns immediately. Rapid bursts coalesce
//! (the counter grows past 1 while the worker gets just one wakeup) and
//! the handler still runs exactly once per `deferred_invoke()`.

#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use blocker::{BlockResult, Blocker};
use log::debug;
use spin::Mutex;
use sync_irq::IrqSafeMutex;

/// The driver-side half: the actual deferred work.
pub trait DeferredIrqHandler: Send + Sync {
    /// Runs in thread context, once per `deferred_invoke()`.
    fn handle_deferred_irq(&self) -> bool;

    fn name(&self) -> &'static str {
        "unnamed deferred handler"
    }
}

/// A registered deferred handler with its pending counter.
pub struct DeferredIrq {
    handler: Arc<dyn DeferredIrqHandler>,
    pending: AtomicUsize,
}

impl DeferredIrq {
    /// Schedules one deferred invocation. Safe to call from interrupt
    /// context: one atomic increment plus a wakeup under the tiny
    /// blocker-access lock.
    pub fn deferred_invoke(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        request_invocation();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Worker side: consume one pending increment and run the handler.
    fn invoke(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(previous != 0, "deferred_interrupt_tasks: invoke without pending work");
        self.handler.handle_deferred_irq();
    }
}

struct Manager {
    /// The worker's current blocker. Interrupt-safe: top halves take it.
    blocker_access: IrqSafeMutex<Option<Arc<Blocker>>>,
    /// The handler set. Not interrupt-safe; only the worker thread and
    /// (de)registration paths touch it, never interrupt context.
    handlers: Mutex<Vec<Arc<DeferredIrq>>>,
}

static MANAGER: Manager = Manager {
    blocker_access: IrqSafeMutex::new(None),
    handlers: Mutex::new(Vec::new()),
};

fn request_invocation() {
    let blocker = MANAGER.blocker_access.lock();
    if let Some(blocker) = blocker.as_ref() {
        blocker.unblock();
    }
    // No blocker installed means the worker is mid-sweep and will see
    // the new pending count on its own.
}

/// Registers a handler, returning the handle its top half uses to
/// schedule work.
pub fn register_handler(handler: Arc<dyn DeferredIrqHandler>) -> Arc<DeferredIrq> {
    let registration = Arc::new(DeferredIrq { handler, pending: AtomicUsize::new(0) });
    let mut handlers = MANAGER.handlers.lock();
    handlers.push(registration.clone());
    debug!("deferred_interrupt_tasks: registered '{}'", registration.handler.name());
    registration
}

/// Removes a handler. Unregistering something never registered is fatal.
pub fn unregister_handler(registration: &Arc<DeferredIrq>) {
    let mut handlers = MANAGER.handlers.lock();
    let before = handlers.len();
    handlers.retain(|existing| !Arc::ptr_eq(existing, registration));
    assert!(
        handlers.len() < before,
        "deferred_interrupt_tasks: unregistering unknown handler '{}'",
        registration.handler.name(),
    );
}

/// One worker iteration: install a fresh blocker, drain every handler's
/// pending work, then sleep until the next invocation request.
///
/// The blocker is installed *before* the sweep. An invocation arriving
/// during the sweep has already unblocked it, so the `block()` at the
/// end returns immediately instead of sleeping through the request.
fn service_once() {
    let blocker = Arc::new(Blocker::new());
    *MANAGER.blocker_access.lock() = Some(blocker.clone());

    {
        let handlers = MANAGER.handlers.lock();
        for handler in handlers.iter() {
            while handler.is_pending() {
                handler.invoke();
            }
        }
    }

    let result = blocker.block();
    assert!(
        result == BlockResult::Unblocked,
        "deferred_interrupt_tasks: worker blocker was interrupted",
    );

    *MANAGER.blocker_access.lock() = None;
}

/// The body of the deferred-IRQ kernel thread. Spawned once during
/// bring-up and never returns.
pub fn run_worker_loop() -> ! {
    debug!("deferred_interrupt_tasks: worker running");
    loop {
        service_once();
    }
}

#[cfg(test)]
mod test;
