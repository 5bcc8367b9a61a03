//! The kernel heap.
//!
//! Backed by the `InitialHeap` block the boot allocator reserves; more
//! memory can be donated later (e.g., when a large mapping is torn
//! down). The allocator itself is a linked-list free list behind an
//! interrupt-safe lock, so allocation is legal anywhere except inside
//! the lowest-level interrupt paths, which are written not to allocate.
//!
//! The kernel binary installs [`IrqSafeHeap`] as its `#[global_allocator]`
//! and calls [`init`] exactly once, before the first allocation.

#![no_std]

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use log::info;
use memory_structs::VirtualAddress;
use sync_irq::IrqSafeMutex;

/// An interrupt-safe wrapper around the free-list heap.
pub struct IrqSafeHeap {
    inner: IrqSafeMutex<Heap>,
}

impl IrqSafeHeap {
    pub const fn empty() -> IrqSafeHeap {
        IrqSafeHeap { inner: IrqSafeMutex::new(Heap::empty()) }
    }

    /// Hands the range `[bottom, bottom + size)` to the heap.
    ///
    /// # Safety
    /// The range must be mapped, writable, unused by anything else, and
    /// must stay so forever.
    pub unsafe fn init(&self, bottom: VirtualAddress, size: usize) {
        unsafe { self.inner.lock().init(bottom.value() as *mut u8, size) };
        info!("heap: initialized with {} KiB", size / 1024);
    }

    /// Donates another contiguous, already-mapped range to the heap.
    ///
    /// # Safety
    /// Same contract as [`IrqSafeHeap::init`]; the range must start
    /// exactly at the current top of the heap's region.
    pub unsafe fn extend(&self, additional: usize) {
        unsafe { self.inner.lock().extend(additional) };
    }

    pub fn used(&self) -> usize {
        self.inner.lock().used()
    }

    pub fn free(&self) -> usize {
        self.inner.lock().free()
    }

    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.inner.lock().allocate_first_fit(layout).ok()
    }

    /// # Safety
    /// `ptr` must come from [`allocate`](IrqSafeHeap::allocate) on this
    /// heap with the same layout.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.inner.lock().deallocate(ptr, layout) };
    }
}

unsafe impl GlobalAlloc for IrqSafeHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout)
            .map(|p| p.as_ptr())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.deallocate(ptr, layout);
        }
    }
}

/// The system-wide heap instance.
pub static KERNEL_HEAP: IrqSafeHeap = IrqSafeHeap::empty();

/// Initializes the system-wide heap over the initial heap block.
///
/// # Safety
/// See [`IrqSafeHeap::init`].
pub unsafe fn init(bottom: VirtualAddress, size: usize) {
    unsafe { KERNEL_HEAP.init(bottom, size) };
}
