extern crate std;

use super::*;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use interrupt_controller::IrqController;
use kernel_config::interrupts::{
    DEVICE_VECTOR_BASE, IRQ_BASE_OFFSET, SPURIOUS_INTERRUPT_VECTOR, SYSCALL_VECTOR,
    TLB_SHOOTDOWN_IPI_VECTOR,
};
use spin::Mutex;
use std::vec::Vec;

/// The dispatch table, vector allocator, and primary controller are all
/// process-wide; run serialized and give each test its own vectors.
fn serial() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
    SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct TestController {
    eois: AtomicUsize,
    enabled_irqs: Mutex<Vec<u8>>,
}

impl IrqController for TestController {
    fn end_of_interrupt(&self, _vector: u8) {
        self.eois.fetch_add(1, Ordering::SeqCst);
    }
    fn enable_irq(&self, irq: u8) {
        self.enabled_irqs.lock().push(irq);
    }
    fn disable_irq(&self, irq: u8) {
        self.enabled_irqs.lock().retain(|&i| i != irq);
    }
    fn is_spurious(&self, vector: u8) -> bool {
        vector == SPURIOUS_INTERRUPT_VECTOR
    }
}

static CONTROLLER: TestController = TestController {
    eois: AtomicUsize::new(0),
    enabled_irqs: Mutex::new(Vec::new()),
};

fn setup() {
    static SETUP: spin::Once<()> = spin::Once::new();
    SETUP.call_once(|| {
        interrupt_controller::set_primary(&CONTROLLER, true);
        irq::init();
    });
}

struct CountingHandler {
    invocations: AtomicUsize,
}

impl CountingHandler {
    fn new() -> Arc<CountingHandler> {
        Arc::new(CountingHandler { invocations: AtomicUsize::new(0) })
    }
    fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl InterruptHandler for CountingHandler {
    fn handle_interrupt(&self, _context: &mut InterruptContext) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
    fn name(&self) -> &'static str {
        "counting"
    }
}

impl irq::IrqHandler for CountingHandler {
    fn handle_irq(&self, _context: &InterruptContext) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
    fn name(&self) -> &'static str {
        "counting irq"
    }
}

#[test]
fn system_vectors_are_pre_reserved() {
    let allocator = VectorAllocator::with_system_reservations();
    for vector in 0..DEVICE_VECTOR_BASE {
        assert!(allocator.is_allocated(vector), "vector {:#X} should be reserved", vector);
    }
    assert!(allocator.is_allocated(SYSCALL_VECTOR));
    assert!(allocator.is_allocated(TLB_SHOOTDOWN_IPI_VECTOR));
    assert!(allocator.is_allocated(SPURIOUS_INTERRUPT_VECTOR));
}

#[test]
fn vectors_allocate_lowest_first_and_recycle() {
    let mut allocator = VectorAllocator::with_system_reservations();
    assert_eq!(allocator.allocate(), DEVICE_VECTOR_BASE);
    assert_eq!(allocator.allocate(), DEVICE_VECTOR_BASE + 1);

    allocator.free(DEVICE_VECTOR_BASE);
    assert_eq!(allocator.allocate(), DEVICE_VECTOR_BASE);
}

#[test]
fn vector_ranges_are_contiguous_and_skip_holes() {
    let mut allocator = VectorAllocator::with_system_reservations();
    // Punch a hole shortly after the device base.
    allocator.allocate_specific(DEVICE_VECTOR_BASE + 2);

    let base = allocator.allocate_range(4);
    assert_eq!(base, DEVICE_VECTOR_BASE + 3);
    for offset in 0..4 {
        assert!(allocator.is_allocated(base + offset));
    }

    allocator.free_range(base, 4);
    assert!(!allocator.is_allocated(base));
}

#[test]
#[should_panic(expected = "already allocated")]
fn double_vector_allocation_is_fatal() {
    let mut allocator = VectorAllocator::with_system_reservations();
    allocator.allocate_specific(0x80);
}

#[test]
#[should_panic(expected = "unallocated")]
fn freeing_a_free_vector_is_fatal() {
    let mut allocator = VectorAllocator::empty();
    allocator.free(0x50);
}

#[test]
fn mono_handler_receives_its_vector() {
    let _guard = serial();
    setup();

    let handler = CountingHandler::new();
    register_mono_handler(0xD0, handler.clone(), false);
    assert!(has_handler(0xD0));

    let mut context = InterruptContext::new(0xD0);
    dispatch(&mut context);
    dispatch(&mut context);
    assert_eq!(handler.count(), 2);
}

#[test]
#[should_panic(expected = "already has handler")]
fn second_handler_on_a_vector_is_fatal() {
    let _guard = serial();
    setup();

    register_mono_handler(0xD1, CountingHandler::new(), false);
    register_mono_handler(0xD1, CountingHandler::new(), false);
}

#[test]
#[should_panic(expected = "unhandled interrupt")]
fn unhandled_vector_is_fatal() {
    let _guard = serial();
    setup();
    dispatch(&mut InterruptContext::new(0xD2));
}

#[test]
fn ranged_handler_covers_every_vector() {
    let _guard = serial();
    setup();

    let handler = CountingHandler::new();
    register_ranged_handler(0xB0, 4, handler.clone(), &[]);

    for vector in 0xB0..0xB4u8 {
        dispatch(&mut InterruptContext::new(vector));
    }
    assert_eq!(handler.count(), 4);
}

#[test]
fn dynamic_handlers_can_be_replaced() {
    let _guard = serial();
    setup();

    let first: Arc<dyn InterruptHandler> = CountingHandler::new();
    register_dynamic_handler(0xC0, first.clone(), false);
    assert!(has_handler(0xC0));

    deregister_dynamic_handler(0xC0, &first);
    assert!(!has_handler(0xC0));

    register_dynamic_handler(0xC0, CountingHandler::new(), false);
    assert!(has_handler(0xC0));
}

#[test]
fn irq_fan_out_runs_all_subscribers_then_acks_once() {
    let _guard = serial();
    setup();

    let first = CountingHandler::new();
    let second = CountingHandler::new();
    let vector = irq::register_irq_handler(irq::IrqLine::Legacy(5), first.clone());
    assert_eq!(vector, IRQ_BASE_OFFSET + 5);
    irq::register_irq_handler(irq::IrqLine::Legacy(5), second.clone());

    assert!(CONTROLLER.enabled_irqs.lock().contains(&5));

    let eois_before = CONTROLLER.eois.load(Ordering::SeqCst);
    dispatch(&mut InterruptContext::new(vector));

    assert_eq!(first.count(), 1);
    assert_eq!(second.count(), 1);
    assert_eq!(CONTROLLER.eois.load(Ordering::SeqCst), eois_before + 1);
}

#[test]
fn spurious_vectors_run_nothing_and_send_no_eoi() {
    let _guard = serial();
    setup();

    let eois_before = CONTROLLER.eois.load(Ordering::SeqCst);
    // No handler is registered on the spurious vector; dispatch must
    // still return cleanly without acknowledging anything.
    dispatch(&mut InterruptContext::new(SPURIOUS_INTERRUPT_VECTOR));
    assert_eq!(CONTROLLER.eois.load(Ordering::SeqCst), eois_before);
}
