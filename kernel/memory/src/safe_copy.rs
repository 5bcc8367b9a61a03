//! Fault-intercepting memory copy.
//!
//! `safe_copy_memory` copies between a kernel buffer and a possibly
//! hostile pointer (a user buffer, a stale mapping). Instead of letting a
//! bad pointer take down the kernel, the copy arms a per-CPU trap cell
//! holding a landing address; if the copy faults, the page-fault handler
//! redirects execution to that landing, the copy disarms itself and
//! reports failure. Callers translate `false` into
//! `ErrorCode::MemoryAccessViolation`.
//!
//! On the host there is no fault interception; the copy is plain, and
//! tests that need the failure path inject it with
//! [`simulate_fault_on_next_copy`].

use memory_structs::VirtualAddress;

cfg_if::cfg_if! {
if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {

    use core::sync::atomic::{AtomicUsize, Ordering};
    use kernel_config::MAX_CPUS;

    /// Per-CPU landing address; zero while no copy is in flight.
    static TRAP_CELLS: [AtomicUsize; MAX_CPUS] = {
        #[allow(clippy::declare_interior_mutable_const)]
        const DISARMED: AtomicUsize = AtomicUsize::new(0);
        [DISARMED; MAX_CPUS]
    };

    /// The landing address of the in-flight copy on this CPU, if one is
    /// armed. Consulted by the page-fault path.
    pub fn armed_landing() -> Option<VirtualAddress> {
        let cell = &TRAP_CELLS[cpu::current_cpu().as_index()];
        match cell.load(Ordering::Acquire) {
            0 => None,
            landing => Some(VirtualAddress::new_canonical(landing)),
        }
    }

    /// Copies `len` bytes from `src` to `dst`, returning `false` if any
    /// access faulted.
    pub fn safe_copy_memory(dst: *mut u8, src: *const u8, len: usize) -> bool {
        let cell = &TRAP_CELLS[cpu::current_cpu().as_index()] as *const AtomicUsize as *mut usize;
        let failed: usize;
        unsafe {
            core::arch::asm!(
                // Arm the trap with the landing address, then do the copy.
                "lea {tmp}, [rip + 22f]",
                "mov [{cell}], {tmp}",
                "xor {failed:e}, {failed:e}",
                "rep movsb",
                "jmp 33f",
                // Landing pad: the page-fault handler resumes here.
                "22:",
                "mov {failed:e}, 1",
                "33:",
                "mov qword ptr [{cell}], 0",
                cell = in(reg) cell,
                tmp = out(reg) _,
                failed = out(reg) failed,
                inout("rsi") src => _,
                inout("rdi") dst => _,
                inout("rcx") len => _,
                options(nostack),
            );
        }
        failed == 0
    }

} else {

    extern crate std;

    std::thread_local! {
        static FORCE_FAULT: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
    }

    pub fn armed_landing() -> Option<VirtualAddress> {
        None
    }

    /// Host-side copy; faults cannot be intercepted here, so tests inject
    /// them instead.
    pub fn safe_copy_memory(dst: *mut u8, src: *const u8, len: usize) -> bool {
        if FORCE_FAULT.with(|f| f.replace(false)) {
            return false;
        }
        unsafe { core::ptr::copy_nonoverlapping(src, dst, len) };
        true
    }

    /// Makes the next `safe_copy_memory` on this thread report a fault.
    pub fn simulate_fault_on_next_copy() {
        FORCE_FAULT.with(|f| f.set(true));
    }

}
}
