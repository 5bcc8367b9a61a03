//! The APIC path: local APIC registers (EOI, spurious vector, IPIs) and
//! the I/O APIC redirection table.
//!
//! Both register banks are memory-mapped and reached through the linear
//! mapping; no fixed virtual windows are set aside for them.

use bit_field::BitField;
use kernel_config::interrupts::{IRQ_BASE_OFFSET, SPURIOUS_INTERRUPT_VECTOR};
use log::{debug, info};
use memory_structs::PhysicalAddress;
use spin::{Mutex, Once};

use crate::IrqController;

/// Default physical base of the local APIC register page.
pub const LOCAL_APIC_DEFAULT_BASE: usize = 0xFEE0_0000;
/// Default physical base of the first I/O APIC.
pub const IO_APIC_DEFAULT_BASE: usize = 0xFEC0_0000;

const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xB0;
const REG_SPURIOUS: usize = 0xF0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const SPURIOUS_ENABLE: u32 = 1 << 8;

/// The per-package local APIC register bank.
pub struct LocalApic {
    base: *mut u32,
}

// The register page is shared MMIO; access is inherently racy with the
// hardware and serialized against other CPUs only where it must be (ICR).
unsafe impl Send for LocalApic {}
unsafe impl Sync for LocalApic {}

impl LocalApic {
    /// A view of the local APIC register page at the given physical base.
    pub fn at(base: PhysicalAddress) -> LocalApic {
        LocalApic {
            base: linear_map::phys_to_virt(base).value() as *mut u32,
        }
    }

    fn read(&self, register: usize) -> u32 {
        unsafe { self.base.add(register / 4).read_volatile() }
    }

    fn write(&self, register: usize, value: u32) {
        unsafe { self.base.add(register / 4).write_volatile(value) };
    }

    pub fn id(&self) -> u32 {
        self.read(REG_ID) >> 24
    }

    /// Software-enables this APIC with the spurious vector installed.
    pub fn enable(&self) {
        self.write(REG_SPURIOUS, SPURIOUS_ENABLE | SPURIOUS_INTERRUPT_VECTOR as u32);
        info!("apic: local APIC {} enabled", self.id());
    }

    pub fn end_of_interrupt(&self) {
        self.write(REG_EOI, 0);
    }

    /// Issues a fixed-delivery IPI to the CPU with `dest_apic_id`.
    pub fn send_ipi(&self, dest_apic_id: u32, vector: u8) {
        let mut low = 0u32;
        low.set_bits(0..8, vector as u32);

        // Writing ICR low fires the IPI; the high half must go first.
        self.write(REG_ICR_HIGH, dest_apic_id << 24);
        self.write(REG_ICR_LOW, low);

        while self.read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// One I/O APIC and the base of the GSI range it serves.
pub struct IoApic {
    registers: Mutex<*mut u32>,
    gsi_base: u8,
}

unsafe impl Send for IoApic {}
unsafe impl Sync for IoApic {}

impl IoApic {
    pub fn at(base: PhysicalAddress, gsi_base: u8) -> IoApic {
        IoApic {
            registers: Mutex::new(linear_map::phys_to_virt(base).value() as *mut u32),
            gsi_base,
        }
    }

    /// Indirect register access: index through the select register at
    /// offset 0, data through the window at offset 0x10.
    fn read(&self, register: u32) -> u32 {
        let regs = self.registers.lock();
        unsafe {
            regs.write_volatile(register);
            regs.add(4).read_volatile()
        }
    }

    fn write(&self, register: u32, value: u32) {
        let regs = self.registers.lock();
        unsafe {
            regs.write_volatile(register);
            regs.add(4).write_volatile(value);
        }
    }

    fn redirection_register(&self, irq: u8) -> u32 {
        0x10 + 2 * (irq - self.gsi_base) as u32
    }

    /// Routes `irq` to `vector` on the CPU with `dest_apic_id`,
    /// initially unmasked.
    pub fn set_redirection(&self, irq: u8, vector: u8, dest_apic_id: u32) {
        let register = self.redirection_register(irq);
        let mut low = 0u32;
        low.set_bits(0..8, vector as u32);
        self.write(register + 1, dest_apic_id << 24);
        self.write(register, low);
        debug!("ioapic: routed IRQ {} to vector {:#X} on APIC {}", irq, vector, dest_apic_id);
    }

    fn set_masked(&self, irq: u8, masked: bool) {
        let register = self.redirection_register(irq);
        let mut low = self.read(register);
        low.set_bit(16, masked);
        self.write(register, low);
    }
}

/// The APIC-mode [`IrqController`]: local APIC for acknowledgement,
/// I/O APIC for routing and masking.
pub struct ApicController {
    local: LocalApic,
    io: IoApic,
}

impl ApicController {
    pub fn new(local: LocalApic, io: IoApic) -> ApicController {
        ApicController { local, io }
    }

    /// Routes all legacy IRQs to their conventional vectors on the
    /// bootstrap CPU.
    pub fn route_legacy_irqs(&self, bootstrap_apic_id: u32) {
        for irq in 0..kernel_config::interrupts::LEGACY_IRQ_COUNT {
            self.io.set_redirection(irq, IRQ_BASE_OFFSET + irq, bootstrap_apic_id);
            self.io.set_masked(irq, true);
        }
    }
}

impl IrqController for ApicController {
    fn end_of_interrupt(&self, _vector: u8) {
        self.local.end_of_interrupt();
    }

    fn enable_irq(&self, irq: u8) {
        self.io.set_masked(irq, false);
    }

    fn disable_irq(&self, irq: u8) {
        self.io.set_masked(irq, true);
    }

    fn is_spurious(&self, vector: u8) -> bool {
        // The APIC's spurious vector needs no EOI and runs no handlers.
        vector == SPURIOUS_INTERRUPT_VECTOR
    }
}

static LOCAL_APIC: Once<LocalApic> = Once::new();

/// Installs the bootstrap local APIC view used for IPI sends.
pub fn init_local_apic(base: PhysicalAddress) -> &'static LocalApic {
    LOCAL_APIC.call_once(|| {
        let apic = LocalApic::at(base);
        apic.enable();
        apic
    })
}

/// The local APIC register view of this package.
pub fn local_apic() -> &'static LocalApic {
    LOCAL_APIC.get().expect("apic: local APIC not initialized")
}
