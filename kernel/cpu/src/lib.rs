//! CPU identity and the registry of online CPUs.
//!
//! A [`CpuId`] is the processor's local APIC id. CPUs are registered here
//! as they are brought online; the registry is what the TLB-shootdown
//! protocol iterates when it posts work to "every other CPU".
//!
//! On the host (unit tests), the current CPU is a per-thread value that
//! tests set explicitly, which is how a handful of threads stand in for a
//! multi-core machine.

#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kernel_config::MAX_CPUS;

/// The identity of a single processor (its local APIC id).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn as_index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static ONLINE: [AtomicBool; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const OFFLINE: AtomicBool = AtomicBool::new(false);
    [OFFLINE; MAX_CPUS]
};
static ONLINE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Marks the given CPU as online. Called once per CPU during bring-up.
pub fn register_cpu(id: CpuId) {
    assert!(id.as_index() < MAX_CPUS, "cpu: id {} exceeds MAX_CPUS", id);
    let was_online = ONLINE[id.as_index()].swap(true, Ordering::SeqCst);
    assert!(!was_online, "cpu: {:?} registered twice", id);
    ONLINE_COUNT.fetch_add(1, Ordering::SeqCst);
}

pub fn is_online(id: CpuId) -> bool {
    id.as_index() < MAX_CPUS && ONLINE[id.as_index()].load(Ordering::SeqCst)
}

pub fn online_count() -> usize {
    ONLINE_COUNT.load(Ordering::SeqCst)
}

/// Iterates over all online CPUs.
pub fn online_cpus() -> impl Iterator<Item = CpuId> {
    (0..MAX_CPUS as u32)
        .map(CpuId)
        .filter(|id| ONLINE[id.as_index()].load(Ordering::SeqCst))
}

cfg_if::cfg_if! {
if #[cfg(target_os = "none")] {

    /// The id of the CPU this code is running on, from CPUID
    /// (the initial APIC id).
    pub fn current_cpu() -> CpuId {
        let result = unsafe { core::arch::x86_64::__cpuid(1) };
        CpuId(result.ebx >> 24)
    }

    /// Pauses briefly in a busy-wait loop.
    pub fn pause() {
        core::hint::spin_loop();
    }

} else {

    extern crate std;

    std::thread_local! {
        static CURRENT_CPU: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
    }

    /// The id of the simulated CPU for the current test thread.
    pub fn current_cpu() -> CpuId {
        CpuId(CURRENT_CPU.with(|c| c.get()))
    }

    /// Binds the current test thread to a simulated CPU id.
    pub fn set_current_cpu(id: CpuId) {
        CURRENT_CPU.with(|c| c.set(id.value()));
    }

    pub fn pause() {
        std::thread::yield_now();
    }

}
}

/// Holder-identity bridge for the recursive locks.
pub fn current_cpu_index() -> usize {
    current_cpu().as_index()
}
