//! The syscall gate: a user-callable handler on vector 0x80.
//!
//! Argument decoding and the actual call table belong to the userland
//! ABI layer; it installs a dispatcher here during bring-up. This crate
//! only owns the vector and its ring-3 gate.

use alloc::sync::Arc;

use kernel_config::interrupts::SYSCALL_VECTOR;
use log::warn;
use spin::Once;

use crate::{InterruptContext, InterruptHandler};

/// The installed syscall dispatcher; receives the full context and
/// decodes the call number and arguments itself.
static DISPATCHER: Once<fn(&mut InterruptContext)> = Once::new();

struct SyscallGate;

impl InterruptHandler for SyscallGate {
    fn handle_interrupt(&self, context: &mut InterruptContext) {
        match DISPATCHER.get() {
            Some(dispatcher) => dispatcher(context),
            None => warn!("syscall: vector invoked before a dispatcher was installed"),
        }
    }

    fn name(&self) -> &'static str {
        "syscall gate"
    }
}

/// Claims vector 0x80 as a user-callable gate. Called once during
/// interrupt bring-up.
pub fn init() {
    crate::register_mono_handler(SYSCALL_VECTOR, Arc::new(SyscallGate), true);
}

/// Installs the userland ABI's dispatcher.
pub fn set_dispatcher(dispatcher: fn(&mut InterruptContext)) {
    DISPATCHER.call_once(|| dispatcher);
}
