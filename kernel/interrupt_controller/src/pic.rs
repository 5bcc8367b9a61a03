//! The legacy chained 8259 programmable interrupt controllers.
//!
//! The pair is remapped so IRQ 0 lands on
//! [`kernel_config::interrupts::IRQ_BASE_OFFSET`] instead of colliding
//! with CPU exceptions. Spurious IRQ 7/15 deliveries are detected by
//! reading the in-service register back; a spurious IRQ must not be
//! acknowledged (except the master's cascade share of a spurious IRQ 15).

use core::sync::atomic::{AtomicU64, Ordering};

use kernel_config::interrupts::{IRQ_BASE_OFFSET, LEGACY_IRQ_COUNT};
use log::warn;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::IrqController;

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_INIT_WITH_ICW4: u8 = 0x11;
const ICW4_8086_MODE: u8 = 0x01;
const OCW2_EOI: u8 = 0x20;
const OCW3_READ_ISR: u8 = 0x0B;

struct Ports {
    master_command: Port<u8>,
    master_data: Port<u8>,
    slave_command: Port<u8>,
    slave_data: Port<u8>,
}

/// The chained master/slave 8259 pair.
pub struct ChainedPics {
    ports: Mutex<Ports>,
    /// Count of spurious IRQs seen, for diagnostics.
    spurious_count: AtomicU64,
}

impl ChainedPics {
    /// Remaps the pair to `IRQ_BASE_OFFSET` and applies the given masks
    /// (bit set = line masked).
    pub fn init(master_mask: u8, slave_mask: u8) -> ChainedPics {
        let mut ports = Ports {
            master_command: Port::new(MASTER_COMMAND),
            master_data: Port::new(MASTER_DATA),
            slave_command: Port::new(SLAVE_COMMAND),
            slave_data: Port::new(SLAVE_DATA),
        };

        unsafe {
            ports.master_command.write(ICW1_INIT_WITH_ICW4);
            ports.slave_command.write(ICW1_INIT_WITH_ICW4);
            // ICW2: vector offsets.
            ports.master_data.write(IRQ_BASE_OFFSET);
            ports.slave_data.write(IRQ_BASE_OFFSET + 8);
            // ICW3: slave on cascade line 2.
            ports.master_data.write(0b0000_0100);
            ports.slave_data.write(2);
            ports.master_data.write(ICW4_8086_MODE);
            ports.slave_data.write(ICW4_8086_MODE);

            ports.master_data.write(master_mask);
            ports.slave_data.write(slave_mask);
        }

        ChainedPics {
            ports: Mutex::new(ports),
            spurious_count: AtomicU64::new(0),
        }
    }

    /// Reads both in-service registers: (master, slave).
    pub fn read_isr(&self) -> (u8, u8) {
        let mut ports = self.ports.lock();
        unsafe {
            ports.master_command.write(OCW3_READ_ISR);
            ports.slave_command.write(OCW3_READ_ISR);
            (ports.master_command.read(), ports.slave_command.read())
        }
    }

    fn set_line_masked(&self, irq: u8, masked: bool) {
        assert!(irq < LEGACY_IRQ_COUNT);
        let mut ports = self.ports.lock();
        unsafe {
            let (port, bit) = if irq < 8 {
                (&mut ports.master_data, irq)
            } else {
                (&mut ports.slave_data, irq - 8)
            };
            let mask = port.read();
            let mask = if masked { mask | (1 << bit) } else { mask & !(1 << bit) };
            port.write(mask);
        }
    }

    pub fn spurious_count(&self) -> u64 {
        self.spurious_count.load(Ordering::Relaxed)
    }
}

impl IrqController for ChainedPics {
    fn end_of_interrupt(&self, vector: u8) {
        let irq = vector.wrapping_sub(IRQ_BASE_OFFSET);
        let mut ports = self.ports.lock();
        unsafe {
            if irq >= 8 {
                ports.slave_command.write(OCW2_EOI);
            }
            ports.master_command.write(OCW2_EOI);
        }
    }

    fn enable_irq(&self, irq: u8) {
        self.set_line_masked(irq, false);
    }

    fn disable_irq(&self, irq: u8) {
        self.set_line_masked(irq, true);
    }

    /// IRQ 7 and IRQ 15 can be delivered spuriously; a genuine one has
    /// its bit set in the in-service register.
    fn is_spurious(&self, vector: u8) -> bool {
        let spurious = match vector {
            v if v == IRQ_BASE_OFFSET + 7 => self.read_isr().0 & 0x80 == 0,
            v if v == IRQ_BASE_OFFSET + 15 => {
                let spurious = self.read_isr().1 & 0x80 == 0;
                if spurious {
                    // The master saw a real cascade interrupt and still
                    // expects its EOI.
                    unsafe { self.ports.lock().master_command.write(OCW2_EOI) };
                }
                spurious
            }
            _ => false,
        };

        if spurious {
            let total = self.spurious_count.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("pic: spurious delivery on vector {:#X} (total {})", vector, total);
        }
        spurious
    }
}
