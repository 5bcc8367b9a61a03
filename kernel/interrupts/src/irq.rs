//! Fan-out of device IRQs to their subscribed handlers.
//!
//! The manager owns the legacy IRQ vector window (and any dynamically
//! allocated device vectors) in the dispatch table. Each arriving vector
//! runs *every* subscribed handler, then acknowledges the interrupt
//! through the active controller. Handlers here are top halves: they
//! must be short and push real work to a deferred task.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kernel_config::interrupts::{IDT_ENTRIES, IRQ_BASE_OFFSET, LEGACY_IRQ_COUNT};
use log::warn;
use sync_irq::IrqSafeMutex;

use crate::{vector_allocator, InterruptContext, InterruptHandler};

/// A device's interrupt handler (top half).
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self, context: &InterruptContext);

    fn name(&self) -> &'static str {
        "unnamed irq handler"
    }
}

/// Where a handler wants to be attached.
#[derive(Clone, Copy, Debug)]
pub enum IrqLine {
    /// A legacy (8259 / I/O APIC-routed) IRQ number, 0..16.
    Legacy(u8),
    /// A specific, already-allocated vector.
    Vector(u8),
    /// Any free device vector (MSI style); the assigned vector is
    /// returned from registration.
    Any,
}

pub struct IrqManager {
    subscribers: [IrqSafeMutex<Vec<Arc<dyn IrqHandler>>>; IDT_ENTRIES],
}

static IRQ_MANAGER: spin::Lazy<Arc<IrqManager>> = spin::Lazy::new(|| {
    Arc::new(IrqManager {
        subscribers: core::array::from_fn(|_| IrqSafeMutex::new(Vec::new())),
    })
});

/// Claims the legacy IRQ window in the dispatch table. Called once
/// during interrupt bring-up.
pub fn init() {
    let manager: Arc<dyn InterruptHandler> = IRQ_MANAGER.clone();
    crate::register_ranged_handler(IRQ_BASE_OFFSET, LEGACY_IRQ_COUNT as usize, manager, &[]);
}

/// Subscribes `handler` to an IRQ line, returning the vector it ended up
/// on. Dynamic vectors are claimed from the vector allocator and entered
/// into the dispatch table on first use.
pub fn register_irq_handler(line: IrqLine, handler: Arc<dyn IrqHandler>) -> u8 {
    let vector = match line {
        IrqLine::Legacy(irq) => {
            assert!(irq < LEGACY_IRQ_COUNT, "irq: bad legacy IRQ {}", irq);
            IRQ_BASE_OFFSET + irq
        }
        IrqLine::Vector(vector) => {
            assert!(vector >= IRQ_BASE_OFFSET, "irq: vector {:#X} below the IRQ window", vector);
            vector
        }
        IrqLine::Any => vector_allocator::allocate_vector(),
    };

    let mut subscribers = IRQ_MANAGER.subscribers[vector as usize].lock();
    let first_subscriber = subscribers.is_empty();
    subscribers.push(handler);
    drop(subscribers);

    if first_subscriber && vector >= IRQ_BASE_OFFSET + LEGACY_IRQ_COUNT {
        // Vectors outside the legacy window aren't covered by the ranged
        // registration from `init`.
        let manager: Arc<dyn InterruptHandler> = IRQ_MANAGER.clone();
        crate::register_dynamic_handler(vector, manager, false);
    }

    if let IrqLine::Legacy(irq) = line {
        if let Some(controller) = interrupt_controller::primary() {
            controller.enable_irq(irq);
        }
    }

    vector
}

/// Unsubscribes a handler from its vector. The last handler of a legacy
/// line masks the line again.
pub fn unregister_irq_handler(vector: u8, handler: &Arc<dyn IrqHandler>) {
    let mut subscribers = IRQ_MANAGER.subscribers[vector as usize].lock();
    let before = subscribers.len();
    subscribers.retain(|existing| !Arc::ptr_eq(existing, handler));
    assert!(
        subscribers.len() < before,
        "irq: handler '{}' was not subscribed to vector {:#X}",
        handler.name(),
        vector,
    );

    if subscribers.is_empty() && vector < IRQ_BASE_OFFSET + LEGACY_IRQ_COUNT {
        if let Some(controller) = interrupt_controller::primary() {
            controller.disable_irq(vector - IRQ_BASE_OFFSET);
        }
    }
}

impl InterruptHandler for IrqManager {
    fn handle_interrupt(&self, context: &mut InterruptContext) {
        let vector = context.vector;

        // Snapshot the subscriber list so handlers run without the lock.
        let handlers: Vec<Arc<dyn IrqHandler>> =
            self.subscribers[vector as usize].lock().clone();

        if handlers.is_empty() {
            warn!("irq: vector {:#X} arrived with no subscribers", vector);
        }
        for handler in &handlers {
            handler.handle_irq(context);
        }

        if let Some(controller) = interrupt_controller::primary() {
            controller.end_of_interrupt(vector);
        }
    }

    fn name(&self) -> &'static str {
        "irq manager"
    }
}
