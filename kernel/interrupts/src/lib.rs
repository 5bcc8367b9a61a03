//! The interrupt fabric.
//!
//! Five layers, bottom-up:
//!
//! 1. IDT stubs ([`idt`], x86_64): one `extern "x86-interrupt"` trampoline
//!    per vector, each entering the common dispatcher with a uniform
//!    [`InterruptContext`].
//! 2. The dispatcher ([`dispatch`]): vector → registered handler; an
//!    unhandled vector is fatal.
//! 3. The vector allocator ([`vector_allocator`]).
//! 4. Handler registration: mono, ranged, and dynamic handlers over the
//!    256-slot table. Registration is locked; dispatch clones the slot's
//!    handler reference under a read lock and runs it outside. Slots are
//!    populated during bring-up and never torn down while dispatchable.
//! 5. Special handlers elsewhere: the exception dispatcher (`exceptions`
//!    crate), the IRQ fan-out ([`irq`]), the TLB-shootdown IPI receiver,
//!    and the syscall gate ([`syscall`]).

#![no_std]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod irq;
pub mod syscall;
pub mod vector_allocator;

#[cfg(target_arch = "x86_64")]
pub mod idt;

use alloc::sync::Arc;
use core::fmt;

use kernel_config::interrupts::IDT_ENTRIES;
use log::error;
use spin::RwLock;

pub use vector_allocator::{
    allocate_vector, allocate_vector_at, allocate_vector_range, free_vector, VectorAllocator,
};

/// The uniform view of an interrupt the stubs hand to handlers.
#[derive(Clone, Debug)]
pub struct InterruptContext {
    pub vector: u8,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub cpu_flags: u64,
    /// The hardware-pushed error code, on the exception vectors that
    /// carry one.
    pub error_code: Option<u64>,
    /// Whether the interrupted code ran in ring 3.
    pub from_user: bool,
    /// A handler may set this to redirect the interrupted code; the stub
    /// rewrites the saved instruction pointer before returning.
    pub resume_at: Option<u64>,
}

impl InterruptContext {
    pub fn new(vector: u8) -> InterruptContext {
        InterruptContext {
            vector,
            instruction_pointer: 0,
            stack_pointer: 0,
            cpu_flags: 0,
            error_code: None,
            from_user: false,
            resume_at: None,
        }
    }
}

impl fmt::Display for InterruptContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "vector {:#X}, ip {:#X}, sp {:#X}, flags {:#X}, error {:?}, {}",
            self.vector,
            self.instruction_pointer,
            self.stack_pointer,
            self.cpu_flags,
            self.error_code,
            if self.from_user { "user" } else { "kernel" },
        )
    }
}

/// A registered interrupt handler.
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self, context: &mut InterruptContext);

    /// Shown in diagnostics and double-registration panics.
    fn name(&self) -> &'static str {
        "unnamed"
    }
}

struct HandlerTable {
    slots: [Option<Arc<dyn InterruptHandler>>; IDT_ENTRIES],
}

static HANDLERS: spin::Lazy<RwLock<HandlerTable>> = spin::Lazy::new(|| {
    RwLock::new(HandlerTable { slots: core::array::from_fn(|_| None) })
});

fn set_handler_for_vector(vector: u8, handler: Arc<dyn InterruptHandler>, user_callable: bool) {
    let mut table = HANDLERS.write();
    let slot = &mut table.slots[vector as usize];
    if let Some(existing) = slot {
        panic!(
            "interrupts: vector {:#X} already has handler '{}', refusing '{}'",
            vector,
            existing.name(),
            handler.name(),
        );
    }
    *slot = Some(handler);

    // On the host there is no descriptor table to adjust.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if user_callable {
        idt::make_user_callable(vector);
    }
    let _ = user_callable;
}

fn remove_handler_for_vector(vector: u8, owner: &Arc<dyn InterruptHandler>) {
    let mut table = HANDLERS.write();
    let slot = &mut table.slots[vector as usize];
    match slot {
        Some(existing) if Arc::ptr_eq(existing, owner) => *slot = None,
        _ => panic!(
            "interrupts: tried to remove a non-registered handler from vector {:#X}",
            vector,
        ),
    }
}

/// Registers a handler for a single vector.
pub fn register_mono_handler(
    vector: u8,
    handler: Arc<dyn InterruptHandler>,
    user_callable: bool,
) {
    set_handler_for_vector(vector, handler, user_callable);
}

/// Registers one handler for a contiguous vector range
/// `[first, first + count)`; the vectors in `user_vectors` additionally
/// become callable from ring 3.
pub fn register_ranged_handler(
    first: u8,
    count: usize,
    handler: Arc<dyn InterruptHandler>,
    user_vectors: &[u8],
) {
    for offset in 0..count {
        let vector = first + offset as u8;
        let user_callable = user_vectors.contains(&vector);
        set_handler_for_vector(vector, handler.clone(), user_callable);
    }
}

/// Registers a handler on a runtime-chosen vector (MSI style).
pub fn register_dynamic_handler(
    vector: u8,
    handler: Arc<dyn InterruptHandler>,
    user_callable: bool,
) {
    set_handler_for_vector(vector, handler, user_callable);
}

/// Removes a dynamically registered handler; the caller must pass the
/// handler currently registered, as a stale-deregistration guard.
pub fn deregister_dynamic_handler(vector: u8, owner: &Arc<dyn InterruptHandler>) {
    remove_handler_for_vector(vector, owner);
}

/// The common dispatcher every stub funnels into.
///
/// Spurious deliveries are dropped here (the controller knows which
/// those are and performs any partial acknowledgement itself); anything
/// else without a registered handler is a fatal hole in the fabric.
pub fn dispatch(context: &mut InterruptContext) {
    if let Some(controller) = interrupt_controller::primary() {
        if controller.is_spurious(context.vector) {
            return;
        }
    }

    let handler = HANDLERS.read().slots[context.vector as usize].clone();

    match handler {
        Some(handler) => handler.handle_interrupt(context),
        None => {
            error!("interrupts: unhandled interrupt: {}", context);
            panic!("interrupts: unhandled interrupt {:#X}", context.vector);
        }
    }
}

/// Whether the vector currently has a registered handler.
pub fn has_handler(vector: u8) -> bool {
    HANDLERS.read().slots[vector as usize].is_some()
}

#[cfg(test)]
mod test;
