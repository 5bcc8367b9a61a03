//! The interrupt-controller endpoints the IRQ layer drives.
//!
//! Two implementations of [`IrqController`] exist: the legacy chained
//! 8259 [`pic`] pair, and the modern [`apic`] path (local APIC for EOI
//! and IPIs, I/O APIC for routing). Exactly one is installed as the
//! primary controller during interrupt bring-up; everything above (the
//! IRQ fan-out, EOI, IPI sends) goes through it without caring which.

#![no_std]

pub mod apic;
pub mod pic;

use spin::Once;

/// The endpoint the IRQ-dispatch layer talks to.
pub trait IrqController: Send + Sync {
    /// Acknowledges the interrupt currently being serviced.
    fn end_of_interrupt(&self, vector: u8);

    /// Unmasks the given legacy IRQ line (or GSI).
    fn enable_irq(&self, irq: u8);

    /// Masks the given legacy IRQ line (or GSI).
    fn disable_irq(&self, irq: u8);

    /// Whether the delivery on `vector` is spurious and must be dropped
    /// without running handlers. Implementations take care of whatever
    /// partial acknowledgement the hardware still requires.
    fn is_spurious(&self, vector: u8) -> bool;
}

static PRIMARY: Once<&'static dyn IrqController> = Once::new();
static LEGACY_MODE: Once<bool> = Once::new();

/// Installs the primary controller. Called once during interrupt
/// bring-up, after the chosen controller has been configured.
pub fn set_primary(controller: &'static dyn IrqController, legacy: bool) {
    PRIMARY.call_once(|| controller);
    LEGACY_MODE.call_once(|| legacy);
}

/// The installed primary controller.
pub fn primary() -> Option<&'static dyn IrqController> {
    PRIMARY.get().copied()
}

/// Whether the system runs on the legacy PIC (no APIC, no IPIs).
pub fn is_legacy_mode() -> bool {
    LEGACY_MODE.get().copied().unwrap_or(true)
}

/// Sends an IPI to the CPU with the given APIC id. Only meaningful on
/// the APIC path; a legacy-mode system has a single CPU and no one to
/// send to.
pub fn send_ipi(dest_apic_id: u32, vector: u8) {
    assert!(!is_legacy_mode(), "interrupt_controller: IPI in legacy PIC mode");
    apic::local_apic().send_ipi(dest_apic_id, vector);
}
