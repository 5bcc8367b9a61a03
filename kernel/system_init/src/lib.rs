//! The bring-up sequence.
//!
//! Order matters and is the whole point of this crate:
//!
//! 1. Ingest the bootloader's memory map and make the early
//!    reservations through the boot allocator (kernel image, boot
//!    modules, the initial heap block), then release the final map.
//! 2. Build the physical side: the linear mapping's offset, the frame
//!    allocator over the released map, the kernel address space, and
//!    switch to it.
//! 3. Per CPU: descriptor tables, the dispatch fabric (exceptions, IRQ
//!    fan-out, syscall gate, shootdown IPI receiver), the chosen
//!    interrupt controller.
//! 4. Hand the deferred-IRQ worker loop to the scheduler.
//!
//! Everything here is thin glue over the owning crates.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;

use boot_allocator::{BootAllocator, MemoryMap, ReservationTag};
use interrupt_controller::apic::{
    ApicController, IoApic, LocalApic, IO_APIC_DEFAULT_BASE, LOCAL_APIC_DEFAULT_BASE,
};
use interrupt_controller::pic::ChainedPics;
use interrupts::{InterruptContext, InterruptHandler};
use kernel_config::interrupts::TLB_SHOOTDOWN_IPI_VECTOR;
use kernel_config::memory::PHYSICAL_MEMORY_OFFSET;
use log::info;
use memory_structs::{PhysicalAddress, VirtualAddress};

/// A physical range the bootloader wants carved out of the map.
#[derive(Clone, Copy, Debug)]
pub struct EarlyReservation {
    pub begin: u64,
    pub page_count: u64,
    pub tag: ReservationTag,
}

/// Phase 1: runs the boot allocator over the ingested map (the fixed
/// reservations first, then the initial heap block placed wherever it
/// fits) and releases the final map.
pub fn reserve_early_ranges(
    map: MemoryMap,
    reservations: &[EarlyReservation],
    initial_heap_pages: u64,
) -> (MemoryMap, u64) {
    let mut allocator = BootAllocator::new(map);

    for reservation in reservations {
        allocator.reserve_at(reservation.begin, reservation.page_count, reservation.tag);
    }

    let heap_base = allocator.reserve_contiguous(
        initial_heap_pages,
        0,
        kernel_config::memory::MAX_PHYSICAL_ADDRESS,
        ReservationTag::InitialHeap,
    );

    (allocator.release(), heap_base)
}

/// Phase 2: the physical memory stack, in dependency order.
pub fn init_memory(map: &MemoryMap) -> Result<(), &'static str> {
    linear_map::init(VirtualAddress::new_canonical(PHYSICAL_MEMORY_OFFSET));
    frame_allocator::init(map)?;
    let kernel_space = memory::init_kernel_space(map)?;
    kernel_space.make_active();
    info!("system_init: memory subsystem up");
    Ok(())
}

/// The receiver half of the TLB-shootdown protocol, attached to the
/// dedicated IPI vector.
struct ShootdownIpiReceiver;

impl InterruptHandler for ShootdownIpiReceiver {
    fn handle_interrupt(&self, _context: &mut InterruptContext) {
        tlb_shootdown::drain_local_queue();
        if let Some(controller) = interrupt_controller::primary() {
            controller.end_of_interrupt(TLB_SHOOTDOWN_IPI_VECTOR);
        }
    }

    fn name(&self) -> &'static str {
        "tlb shootdown ipi"
    }
}

/// Which interrupt controller hardware to drive.
#[derive(Clone, Copy, Debug)]
pub enum ControllerKind {
    LegacyPic,
    Apic,
}

/// Phase 3, bootstrap CPU: descriptor tables, dispatch fabric, and the
/// interrupt controller.
pub fn init_interrupts_bsp(kind: ControllerKind) {
    cpu::register_cpu(cpu::current_cpu());
    sync_irq::set_holder_id_fn(cpu::current_cpu_index);

    #[cfg(target_arch = "x86_64")]
    {
        interrupts::idt::init();
        interrupts::idt::load();
    }

    exceptions::init();
    interrupts::irq::init();
    interrupts::syscall::init();
    interrupts::register_mono_handler(
        TLB_SHOOTDOWN_IPI_VECTOR,
        Arc::new(ShootdownIpiReceiver),
        false,
    );

    match kind {
        ControllerKind::LegacyPic => {
            // Start with every line masked; drivers unmask on subscribe.
            let pic = Box::leak(Box::new(ChainedPics::init(0xFF, 0xFF)));
            interrupt_controller::set_primary(pic, true);
        }
        ControllerKind::Apic => {
            let local = interrupt_controller::apic::init_local_apic(
                PhysicalAddress::new_canonical(LOCAL_APIC_DEFAULT_BASE),
            );
            let bootstrap_id = local.id();

            let io = IoApic::at(PhysicalAddress::new_canonical(IO_APIC_DEFAULT_BASE), 0);
            let controller = Box::leak(Box::new(ApicController::new(
                LocalApic::at(PhysicalAddress::new_canonical(LOCAL_APIC_DEFAULT_BASE)),
                io,
            )));
            controller.route_legacy_irqs(bootstrap_id);
            interrupt_controller::set_primary(controller, false);
        }
    }

    info!("system_init: interrupt fabric up on the bootstrap CPU");
}

/// Phase 3, application CPUs: load the shared tables and join the
/// shootdown protocol.
pub fn init_interrupts_ap() {
    cpu::register_cpu(cpu::current_cpu());

    #[cfg(target_arch = "x86_64")]
    interrupts::idt::load();

    info!("system_init: CPU {:?} joined the interrupt fabric", cpu::current_cpu());
}

/// Phase 4: hands the deferred-IRQ worker to the scheduler. `spawn`
/// must start a kernel thread running the given diverging function.
pub fn start_deferred_worker(spawn: fn(fn() -> !)) {
    spawn(deferred_interrupt_tasks::run_worker_loop);
}

#[cfg(test)]
mod test;
