//! Synchronisation primitives that hold off local interrupts while held.
//!
//! Two locks are provided on top of a plain spinlock:
//! * [`IrqSafeMutex`]: a spin mutex whose guard also keeps local interrupts
//!   disabled, so it is safe to acquire from interrupt handlers.
//! * [`RecursiveIrqSafeLock`]: an interrupt-safe critical-section lock that
//!   the *same* holder may re-acquire. It guards a code region rather than
//!   data; state serialized by it must live outside Rust's aliasing rules
//!   (e.g., raw page-table memory) or carry its own interior locking.
//!
//! Interrupts are only actually disabled when compiled for bare metal
//! (`target_os = "none"`); on a hosted target the spin half of each lock is
//! real and the interrupt half is a no-op, which is what lets the kernel
//! crates run their unit tests on the host.

#![no_std]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard, Once};

/// A guard that re-enables local interrupts (if they were enabled at
/// acquisition time) when dropped.
pub struct HeldInterrupts {
    were_enabled: bool,
}

/// Disables local interrupts and returns a guard that restores
/// the previous state on drop.
pub fn hold_interrupts() -> HeldInterrupts {
    let held = HeldInterrupts {
        were_enabled: interrupts_enabled(),
    };
    disable_interrupts();
    held
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        fn interrupts_enabled() -> bool {
            x86_64::instructions::interrupts::are_enabled()
        }
        fn disable_interrupts() {
            x86_64::instructions::interrupts::disable();
        }
        fn enable_interrupts() {
            x86_64::instructions::interrupts::enable();
        }
    } else {
        // Hosted target: nothing to mask.
        fn interrupts_enabled() -> bool { false }
        fn disable_interrupts() {}
        fn enable_interrupts() {}
    }
}

/// A spin mutex that disables local interrupts for as long as it is held.
///
/// Interrupts are disabled *before* spinning, so a holder can never be
/// interrupted by a handler that tries to take the same lock on this CPU.
pub struct IrqSafeMutex<T: ?Sized> {
    inner: Mutex<T>,
}

pub struct IrqSafeMutexGuard<'a, T: ?Sized> {
    // Field order matters: the spinlock must be released before
    // interrupts are restored.
    guard: MutexGuard<'a, T>,
    _held: HeldInterrupts,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(value: T) -> IrqSafeMutex<T> {
        IrqSafeMutex { inner: Mutex::new(value) }
    }
}

impl<T: ?Sized> IrqSafeMutex<T> {
    pub fn lock(&self) -> IrqSafeMutexGuard<'_, T> {
        let held = hold_interrupts();
        IrqSafeMutexGuard {
            guard: self.inner.lock(),
            _held: held,
        }
    }

    pub fn try_lock(&self) -> Option<IrqSafeMutexGuard<'_, T>> {
        let held = hold_interrupts();
        self.inner.try_lock().map(|guard| IrqSafeMutexGuard { guard, _held: held })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

// Same bounds as `spin::Mutex`.
unsafe impl<T: ?Sized + Send> Send for IrqSafeMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for IrqSafeMutex<T> {}

impl<T: ?Sized> Deref for IrqSafeMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqSafeMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// The function used to identify the current lock holder (normally the
/// current CPU id). Installed once by CPU bring-up; before that, all
/// holders share identity 0, which is correct on the bootstrap processor.
static HOLDER_ID: Once<fn() -> usize> = Once::new();

/// Installs the holder-identity function used by [`RecursiveIrqSafeLock`].
pub fn set_holder_id_fn(f: fn() -> usize) {
    HOLDER_ID.call_once(|| f);
}

fn current_holder_id() -> usize {
    HOLDER_ID.get().map_or(0, |f| f())
}

/// An interrupt-safe critical-section lock that the same holder (CPU) may
/// re-acquire.
///
/// Unlike a mutex this protects a *region of code*, not data: it hands out
/// no references. It serializes page-table mutation, where the "data" is
/// raw table memory reached through the linear map.
pub struct RecursiveIrqSafeLock {
    /// Holder id + 1 while held; 0 while free.
    owner: AtomicUsize,
    depth: UnsafeCell<usize>,
}

pub struct RecursiveLockGuard<'a> {
    lock: &'a RecursiveIrqSafeLock,
    _held: HeldInterrupts,
}

impl RecursiveIrqSafeLock {
    pub const fn new() -> RecursiveIrqSafeLock {
        RecursiveIrqSafeLock {
            owner: AtomicUsize::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    pub fn lock(&self) -> RecursiveLockGuard<'_> {
        let held = hold_interrupts();
        let me = current_holder_id() + 1;

        if self.owner.load(Ordering::Acquire) != me {
            while self
                .owner
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
        }

        // Only the owner ever touches `depth`, so the plain cell is fine.
        unsafe { *self.depth.get() += 1 };
        RecursiveLockGuard { lock: self, _held: held }
    }

    /// Returns `true` if the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }
}

impl Default for RecursiveIrqSafeLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for RecursiveIrqSafeLock {}
unsafe impl Sync for RecursiveIrqSafeLock {}

impl Drop for RecursiveLockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            let depth = self.lock.depth.get();
            *depth -= 1;
            if *depth == 0 {
                self.lock.owner.store(0, Ordering::Release);
            }
        }
    }
}
