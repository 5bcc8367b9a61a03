//! The page-fault subscriber: decode, delegate, resume.

use alloc::sync::Arc;

use interrupts::InterruptContext;
use log::trace;
use memory::{FaultOutcome, PageFault, PageFaultKind};
use memory_structs::VirtualAddress;

use crate::ExceptionHandler;

const PAGE_FAULT_VECTOR: u8 = 14;

/// Error-code bits pushed by the CPU for a page fault.
const ERROR_PROTECTION_VIOLATION: u64 = 1 << 0;
const ERROR_CAUSED_BY_WRITE: u64 = 1 << 1;
const ERROR_FROM_USER: u64 = 1 << 2;

/// Classifies the hardware error code into the memory subsystem's
/// fault taxonomy: read/write crossed with non-present/protection.
pub fn decode_page_fault_error_code(error_code: u64) -> PageFaultKind {
    let write = error_code & ERROR_CAUSED_BY_WRITE != 0;
    let present = error_code & ERROR_PROTECTION_VIOLATION != 0;
    match (write, present) {
        (false, false) => PageFaultKind::ReadNonPresent,
        (false, true) => PageFaultKind::ReadProtection,
        (true, false) => PageFaultKind::WriteNonPresent,
        (true, true) => PageFaultKind::WriteProtection,
    }
}

cfg_if::cfg_if! {
if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {

    /// The faulting address, latched by the CPU in CR2.
    pub fn read_faulting_address() -> VirtualAddress {
        VirtualAddress::new_canonical(x86_64::registers::control::Cr2::read_raw() as usize)
    }

} else {

    extern crate std;

    std::thread_local! {
        static FAULT_ADDRESS: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
    }

    /// Host stand-in for CR2.
    pub fn read_faulting_address() -> VirtualAddress {
        VirtualAddress::new_canonical(FAULT_ADDRESS.with(|a| a.get()))
    }

    /// Sets what [`read_faulting_address`] reports on this thread.
    pub fn set_faulting_address_for_test(address: VirtualAddress) {
        FAULT_ADDRESS.with(|a| a.set(address.value()));
    }

}
}

struct PageFaultHandler;

impl ExceptionHandler for PageFaultHandler {
    fn handle_exception(&self, context: &mut InterruptContext) {
        let error_code = context.error_code.unwrap_or(0);
        let fault = PageFault {
            address: read_faulting_address(),
            instruction_pointer: VirtualAddress::new_canonical(
                context.instruction_pointer as usize,
            ),
            from_user: error_code & ERROR_FROM_USER != 0,
            kind: decode_page_fault_error_code(error_code),
        };

        match memory::handle_page_fault(&fault) {
            // The mapping is in place now; retrying the access just works.
            FaultOutcome::LazilyFilled => {}
            FaultOutcome::FixupApplied { landing } => {
                context.resume_at = Some(landing.value() as u64);
            }
            FaultOutcome::ReportedToProcess => {
                // Delivery of the fault to the process (signal, kill) is
                // the process layer's job; nothing more to do here.
                trace!("exceptions: user page fault passed upward: {}", fault);
            }
        }
    }

    fn name(&self) -> &'static str {
        "page fault handler"
    }
}

pub(crate) fn init() {
    crate::register_exception_handler(PAGE_FAULT_VECTOR, Arc::new(PageFaultHandler));
}
