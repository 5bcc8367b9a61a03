//! Page-fault classification and resolution.

use core::fmt;

use log::{trace, warn};
use memory_structs::VirtualAddress;

use crate::{current_space, safe_copy};

/// What kind of access faulted, from the hardware error code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageFaultKind {
    ReadNonPresent,
    ReadProtection,
    WriteNonPresent,
    WriteProtection,
}

impl PageFaultKind {
    pub fn is_non_present(&self) -> bool {
        matches!(self, PageFaultKind::ReadNonPresent | PageFaultKind::WriteNonPresent)
    }
}

/// A decoded page fault, as delivered by the exception dispatcher.
#[derive(Clone, Copy)]
pub struct PageFault {
    /// The faulting address (CR2).
    pub address: VirtualAddress,
    pub instruction_pointer: VirtualAddress,
    pub from_user: bool,
    pub kind: PageFaultKind,
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} at {} (ip {}, {})",
            self.kind,
            self.address,
            self.instruction_pointer,
            if self.from_user { "user" } else { "kernel" },
        )
    }
}

/// How a (non-fatal) page fault was resolved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultOutcome {
    /// The fault hit an allocated-but-unmapped range; a fresh zeroed
    /// frame was mapped in and the faulting access can simply retry.
    LazilyFilled,
    /// The fault happened inside a fault-intercepting copy; execution
    /// must resume at the copy's landing address.
    FixupApplied { landing: VirtualAddress },
    /// A user-mode fault that the process layer must deal with.
    ReportedToProcess,
}

/// Classifies and resolves a page fault. Faults that neither belong to an
/// allocated range, nor to a fault-intercepting copy, nor to userspace
/// are kernel bugs and panic.
pub fn handle_page_fault(fault: &PageFault) -> FaultOutcome {
    // A non-present fault on a virtual range the current space has
    // allocated is the expected lazy-fill path.
    let space = current_space();
    if fault.kind.is_non_present() && space.allocator().is_allocated(fault.address) {
        trace!("memory: lazy-fill fault: {}", fault);
        space.backfill_page(fault.address);
        return FaultOutcome::LazilyFilled;
    }

    // A kernel-mode fault with an armed copy trap is redirected to the
    // copy's landing pad, which reports the failure to its caller.
    if !fault.from_user {
        if let Some(landing) = safe_copy::armed_landing() {
            trace!("memory: fixing up faulting copy: {}", fault);
            return FaultOutcome::FixupApplied { landing };
        }
    }

    if fault.from_user {
        warn!("memory: userspace fault, deferring to process layer: {}", fault);
        return FaultOutcome::ReportedToProcess;
    }

    panic!("memory: unexpected kernel page fault: {}", fault);
}
