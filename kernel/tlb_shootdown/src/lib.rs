//! Cross-CPU TLB shootdown.
//!
//! When a mapping is removed (or its permissions tightened) while other
//! CPUs may hold it in their TLBs, the mutating CPU posts a
//! [`ShootdownRequest`] to every other online CPU's queue and sends each
//! one the shootdown IPI (vector
//! [`kernel_config::interrupts::TLB_SHOOTDOWN_IPI_VECTOR`]). Each
//! receiver drains its queue, invalidating the requested range page by
//! page, and decrements the request's completion countdown. The
//! originator spins until the countdown reaches zero, draining its *own*
//! queue while it waits so two concurrent originators cannot deadlock on
//! each other.
//!
//! A bounded spin guards against a wedged CPU: expiry is fatal, except
//! for [`hang`](ShootdownKind::Hang) requests: those are posted by the
//! panic path, which must not panic again.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use cpu::CpuId;
use kernel_config::interrupts::{IPI_COMPLETION_TIMEOUT_ITERATIONS, TLB_SHOOTDOWN_IPI_VECTOR};
use kernel_config::MAX_CPUS;
use log::error;
use memory_structs::VirtualRange;
use spin::Once;
use sync_irq::{hold_interrupts, IrqSafeMutex};

/// What a queued request asks the receiving CPU to do.
#[derive(Clone, Debug)]
pub enum ShootdownKind {
    /// Park this CPU forever. Posted by the panic path to stop the
    /// machine coherently.
    Hang,
    /// Invalidate every page of the given range.
    InvalidateRange(VirtualRange),
}

/// A shootdown request shared between the originator and all receivers.
pub struct ShootdownRequest {
    kind: ShootdownKind,
    completion_countdown: AtomicUsize,
}

impl ShootdownRequest {
    fn new(kind: ShootdownKind) -> ShootdownRequest {
        ShootdownRequest { kind, completion_countdown: AtomicUsize::new(0) }
    }

    pub fn kind(&self) -> &ShootdownKind {
        &self.kind
    }

    /// How many receivers have not finished yet.
    pub fn pending(&self) -> usize {
        self.completion_countdown.load(Ordering::Acquire)
    }

    fn add_receiver(&self) {
        self.completion_countdown.fetch_add(1, Ordering::AcqRel);
    }

    fn complete(&self) {
        let previous = self.completion_countdown.fetch_sub(1, Ordering::AcqRel);
        assert!(previous != 0, "tlb_shootdown: completion underflow");
    }
}

/// One pending-request queue per CPU.
struct CpuQueues {
    queues: [IrqSafeMutex<VecDeque<Arc<ShootdownRequest>>>; MAX_CPUS],
}

static QUEUES: Once<CpuQueues> = Once::new();

fn queues() -> &'static CpuQueues {
    QUEUES.call_once(|| CpuQueues {
        queues: [const { IrqSafeMutex::new(VecDeque::new()) }; MAX_CPUS],
    })
}

/// How an IPI physically reaches another CPU. The default goes through
/// the local APIC; tests install their own.
static IPI_SENDER: Once<fn(CpuId)> = Once::new();

pub fn set_ipi_sender(sender: fn(CpuId)) {
    IPI_SENDER.call_once(|| sender);
}

fn send_ipi(dest: CpuId) {
    match IPI_SENDER.get() {
        Some(sender) => sender(dest),
        None => interrupt_controller::send_ipi(dest.value(), TLB_SHOOTDOWN_IPI_VECTOR),
    }
}

/// Posts a range invalidation to every other online CPU and waits for
/// all of them to acknowledge it. No-op on a single-CPU system.
pub fn post_invalidate(range: VirtualRange) -> Option<Arc<ShootdownRequest>> {
    post(ShootdownKind::InvalidateRange(range))
}

/// Posts a hang request to every other online CPU. Does not wait for
/// completion beyond the bounded spin; a core that fails to park only
/// costs an error line, since this runs under panic.
pub fn hang_other_cpus() -> Option<Arc<ShootdownRequest>> {
    post(ShootdownKind::Hang)
}

fn post(kind: ShootdownKind) -> Option<Arc<ShootdownRequest>> {
    if cpu::online_count() <= 1 {
        return None;
    }

    let request = Arc::new(ShootdownRequest::new(kind));
    {
        let _held = hold_interrupts();
        let me = cpu::current_cpu();
        for other in cpu::online_cpus().filter(|id| *id != me) {
            request.add_receiver();
            queues().queues[other.as_index()].lock().push_back(request.clone());
            send_ipi(other);
        }
    }

    wait_for_completion(&request);
    Some(request)
}

/// Spins until every receiver has completed `request`, draining this
/// CPU's own queue in the meantime.
pub fn wait_for_completion(request: &ShootdownRequest) {
    let mut budget = completion_timeout();
    while request.pending() != 0 && budget != 0 {
        drain_local_queue();
        cpu::pause();
        budget -= 1;
    }

    if request.pending() == 0 {
        return;
    }

    match request.kind() {
        // Probably posted from a panic; don't panic on top of it.
        ShootdownKind::Hang => error!(
            "tlb_shootdown: {} core(s) failed to complete a hang request",
            request.pending(),
        ),
        ShootdownKind::InvalidateRange(range) => panic!(
            "tlb_shootdown: timeout, {} core(s) failed to invalidate {:?}",
            request.pending(),
            range,
        ),
    }
}

/// Drains this CPU's queue. Called from the shootdown IPI handler and
/// from originators while they wait.
pub fn drain_local_queue() {
    let index = cpu::current_cpu().as_index();
    loop {
        let next = queues().queues[index].lock().pop_front();
        let Some(request) = next else { break };

        match request.kind() {
            ShootdownKind::Hang => {
                request.complete();
                arch::park_forever();
            }
            ShootdownKind::InvalidateRange(range) => {
                for page in range.pages() {
                    arch::invalidate_page(page.start_address());
                }
                request.complete();
            }
        }
    }
}

cfg_if::cfg_if! {
if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {

    mod arch {
        use memory_structs::VirtualAddress;

        pub fn invalidate_page(vaddr: VirtualAddress) {
            x86_64::instructions::tlb::flush(
                x86_64::VirtAddr::new_truncate(vaddr.value() as u64),
            );
        }

        pub fn park_forever() -> ! {
            loop {
                x86_64::instructions::interrupts::disable();
                x86_64::instructions::hlt();
            }
        }
    }

    fn completion_timeout() -> u64 {
        IPI_COMPLETION_TIMEOUT_ITERATIONS
    }

} else {

    mod arch {
        use core::sync::atomic::{AtomicUsize, Ordering};
        use memory_structs::VirtualAddress;

        static INVALIDATED_PAGES: AtomicUsize = AtomicUsize::new(0);

        pub fn invalidate_page(_vaddr: VirtualAddress) {
            INVALIDATED_PAGES.fetch_add(1, Ordering::SeqCst);
        }

        /// Total pages invalidated on this host process, for tests.
        pub fn invalidated_page_count() -> usize {
            INVALIDATED_PAGES.load(Ordering::SeqCst)
        }

        pub fn park_forever() -> ! {
            extern crate std;
            loop {
                std::thread::park();
            }
        }
    }

    /// Total pages invalidated in this process (host only).
    pub fn invalidated_page_count() -> usize {
        arch::invalidated_page_count()
    }

    use core::sync::atomic::AtomicU64;

    static TEST_TIMEOUT: AtomicU64 = AtomicU64::new(IPI_COMPLETION_TIMEOUT_ITERATIONS);

    /// Shrinks the completion spin budget so timeout paths are testable.
    pub fn set_completion_timeout_for_test(iterations: u64) {
        TEST_TIMEOUT.store(iterations, Ordering::SeqCst);
    }

    fn completion_timeout() -> u64 {
        TEST_TIMEOUT.load(Ordering::SeqCst)
    }

}
}
