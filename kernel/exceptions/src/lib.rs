//! The CPU exception dispatcher.
//!
//! One ranged handler owns vectors 0..32 in the dispatch table.
//! Subsystems that can actually resolve an exception subscribe for their
//! specific vector; in practice that is the page-fault handler, which
//! classifies the fault and hands it to the memory subsystem. Any
//! exception without a subscriber panics with its mnemonic and the full
//! interrupt context: there is nothing sensible to resume into.

#![no_std]

extern crate alloc;

mod page_fault;

pub use page_fault::{decode_page_fault_error_code, read_faulting_address};
#[cfg(not(target_os = "none"))]
pub use page_fault::set_faulting_address_for_test;

use alloc::sync::Arc;

use interrupts::{InterruptContext, InterruptHandler};
use kernel_config::interrupts::EXCEPTION_VECTOR_COUNT;
use log::error;
use spin::RwLock;

/// Mnemonics for vectors 0..=20, as architecturally defined. The
/// remaining vectors up to 31 are reserved.
pub const EXCEPTION_MNEMONICS: [&str; 21] = [
    "Divide Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
];

/// The mnemonic for an exception vector.
pub fn mnemonic(vector: u8) -> &'static str {
    EXCEPTION_MNEMONICS
        .get(vector as usize)
        .copied()
        .unwrap_or("Reserved")
}

/// A subsystem's handler for one specific exception.
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, context: &mut InterruptContext);

    fn name(&self) -> &'static str {
        "unnamed exception handler"
    }
}

struct ExceptionDispatcher {
    subscribers: [RwLock<Option<Arc<dyn ExceptionHandler>>>; EXCEPTION_VECTOR_COUNT],
}

static DISPATCHER: spin::Lazy<Arc<ExceptionDispatcher>> = spin::Lazy::new(|| {
    Arc::new(ExceptionDispatcher {
        subscribers: core::array::from_fn(|_| RwLock::new(None)),
    })
});

impl InterruptHandler for ExceptionDispatcher {
    fn handle_interrupt(&self, context: &mut InterruptContext) {
        let vector = context.vector;
        let subscriber = self.subscribers[vector as usize].read().clone();

        match subscriber {
            Some(handler) => handler.handle_exception(context),
            None => {
                error!(
                    "exceptions: unhandled {} (#{}) - {}",
                    mnemonic(vector),
                    vector,
                    context,
                );
                panic!("exceptions: unhandled {} ({})", mnemonic(vector), context);
            }
        }
    }

    fn name(&self) -> &'static str {
        "exception dispatcher"
    }
}

/// Claims vectors 0..32 in the dispatch table and installs the
/// page-fault subscriber. Called once during interrupt bring-up.
pub fn init() {
    let dispatcher: Arc<dyn InterruptHandler> = DISPATCHER.clone();
    interrupts::register_ranged_handler(0, EXCEPTION_VECTOR_COUNT, dispatcher, &[]);
    page_fault::init();
}

/// Subscribes a handler for one exception vector. A second subscriber
/// on the same vector is fatal.
pub fn register_exception_handler(vector: u8, handler: Arc<dyn ExceptionHandler>) {
    assert!((vector as usize) < EXCEPTION_VECTOR_COUNT);

    let mut slot = DISPATCHER.subscribers[vector as usize].write();
    if let Some(existing) = slot.as_ref() {
        panic!(
            "exceptions: {} (#{}) already handled by '{}', refusing '{}'",
            mnemonic(vector),
            vector,
            existing.name(),
            handler.name(),
        );
    }
    *slot = Some(handler);
}
