//! Allocation of interrupt vectors.
//!
//! A 256-bit bitmap tracks which vectors are taken. The system-owned
//! vectors are reserved up front: the exception range, the legacy IRQ
//! window, the syscall gate, the TLB-shootdown IPI, and the spurious
//! vector. Device drivers get the rest, handed out from
//! `DEVICE_VECTOR_BASE` upward (MSI blocks as contiguous ranges).

use bit_field::BitField;
use kernel_config::interrupts::{
    DEVICE_VECTOR_BASE, EXCEPTION_VECTOR_COUNT, IDT_ENTRIES, IRQ_BASE_OFFSET, LEGACY_IRQ_COUNT,
    SPURIOUS_INTERRUPT_VECTOR, SYSCALL_VECTOR, TLB_SHOOTDOWN_IPI_VECTOR,
};
use sync_irq::IrqSafeMutex;

pub struct VectorAllocator {
    /// One bit per vector; set = allocated.
    bitmap: [u64; IDT_ENTRIES / 64],
}

impl VectorAllocator {
    /// An allocator with every vector free. System vectors are *not*
    /// reserved; see [`VectorAllocator::with_system_reservations`].
    pub const fn empty() -> VectorAllocator {
        VectorAllocator { bitmap: [0; IDT_ENTRIES / 64] }
    }

    /// The boot-time allocator: exceptions, the legacy IRQ window, and
    /// the fixed system vectors are already taken.
    pub fn with_system_reservations() -> VectorAllocator {
        let mut allocator = VectorAllocator::empty();
        for vector in 0..EXCEPTION_VECTOR_COUNT as u16 {
            allocator.allocate_specific(vector as u8);
        }
        for irq in 0..LEGACY_IRQ_COUNT {
            allocator.allocate_specific(IRQ_BASE_OFFSET + irq);
        }
        allocator.allocate_specific(SYSCALL_VECTOR);
        allocator.allocate_specific(TLB_SHOOTDOWN_IPI_VECTOR);
        allocator.allocate_specific(SPURIOUS_INTERRUPT_VECTOR);
        allocator
    }

    pub fn is_allocated(&self, vector: u8) -> bool {
        self.bitmap[vector as usize / 64].get_bit(vector as usize % 64)
    }

    /// Reserves exactly `vector`. Reserving a taken vector is fatal.
    pub fn allocate_specific(&mut self, vector: u8) {
        assert!(
            !self.is_allocated(vector),
            "VectorAllocator: vector {:#X} is already allocated",
            vector,
        );
        self.bitmap[vector as usize / 64].set_bit(vector as usize % 64, true);
    }

    /// Returns the lowest free vector above the legacy IRQ window.
    pub fn allocate(&mut self) -> u8 {
        for vector in DEVICE_VECTOR_BASE..=u8::MAX {
            if !self.is_allocated(vector) {
                self.allocate_specific(vector);
                return vector;
            }
        }
        panic!("VectorAllocator: out of interrupt vectors");
    }

    /// Reserves `count` contiguous vectors (an MSI block) above the
    /// legacy window, returning the first.
    pub fn allocate_range(&mut self, count: usize) -> u8 {
        assert!(count != 0);
        let mut base = DEVICE_VECTOR_BASE as usize;
        'search: while base + count <= IDT_ENTRIES {
            for offset in 0..count {
                if self.is_allocated((base + offset) as u8) {
                    base += offset + 1;
                    continue 'search;
                }
            }
            for offset in 0..count {
                self.allocate_specific((base + offset) as u8);
            }
            return base as u8;
        }
        panic!("VectorAllocator: no contiguous block of {} vectors", count);
    }

    /// Releases a vector. Freeing a free vector is fatal.
    pub fn free(&mut self, vector: u8) {
        assert!(
            self.is_allocated(vector),
            "VectorAllocator: freeing unallocated vector {:#X}",
            vector,
        );
        self.bitmap[vector as usize / 64].set_bit(vector as usize % 64, false);
    }

    pub fn free_range(&mut self, first: u8, count: usize) {
        for offset in 0..count {
            self.free(first + offset as u8);
        }
    }
}

static VECTOR_ALLOCATOR: spin::Lazy<IrqSafeMutex<VectorAllocator>> =
    spin::Lazy::new(|| IrqSafeMutex::new(VectorAllocator::with_system_reservations()));

/// Allocates the lowest free device vector from the system allocator.
pub fn allocate_vector() -> u8 {
    VECTOR_ALLOCATOR.lock().allocate()
}

/// Reserves a specific vector in the system allocator.
pub fn allocate_vector_at(vector: u8) {
    VECTOR_ALLOCATOR.lock().allocate_specific(vector);
}

/// Reserves a contiguous block of device vectors, returning the first.
pub fn allocate_vector_range(count: usize) -> u8 {
    VECTOR_ALLOCATOR.lock().allocate_range(count)
}

/// Returns a vector to the system allocator.
pub fn free_vector(vector: u8) {
    VECTOR_ALLOCATOR.lock().free(vector);
}
