extern crate std;

use super::*;
use std::thread;
use std::time::{Duration, Instant};

struct CountingDeferredHandler {
    runs: AtomicUsize,
}

impl DeferredIrqHandler for CountingDeferredHandler {
    fn handle_deferred_irq(&self) -> bool {
        self.runs.fetch_add(1, Ordering::SeqCst);
        true
    }
    fn name(&self) -> &'static str {
        "counting deferred handler"
    }
}

fn start_worker() {
    static WORKER: spin::Once<()> = spin::Once::new();
    WORKER.call_once(|| {
        thread::spawn(|| run_worker_loop());
    });
}

fn wait_for(predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for the worker");
        thread::yield_now();
    }
}

#[test]
fn rapid_invocations_coalesce_but_run_once_each() {
    start_worker();
    let handler = Arc::new(CountingDeferredHandler { runs: AtomicUsize::new(0) });
    let registration = register_handler(handler.clone());

    // Two top-half invocations back to back: possibly one worker wakeup,
    // but the handler must run exactly twice.
    registration.deferred_invoke();
    registration.deferred_invoke();

    wait_for(|| handler.runs.load(Ordering::SeqCst) == 2);

    // And not a third time.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
    assert!(!registration.is_pending());

    unregister_handler(&registration);
}

#[test]
fn wakeups_are_not_lost_across_block_cycles() {
    start_worker();
    let handler = Arc::new(CountingDeferredHandler { runs: AtomicUsize::new(0) });
    let registration = register_handler(handler.clone());

    for round in 1..=5 {
        registration.deferred_invoke();
        wait_for(|| handler.runs.load(Ordering::SeqCst) == round);
        // Let the worker reach its blocked state again before the next
        // round, so every round crosses a full block/unblock cycle.
        thread::sleep(Duration::from_millis(10));
    }

    unregister_handler(&registration);
}

#[test]
fn invocations_from_many_threads_all_run() {
    start_worker();
    let handler = Arc::new(CountingDeferredHandler { runs: AtomicUsize::new(0) });
    let registration = register_handler(handler.clone());

    let mut joins = std::vec::Vec::new();
    for _ in 0..4 {
        let registration = registration.clone();
        joins.push(thread::spawn(move || {
            for _ in 0..25 {
                registration.deferred_invoke();
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }

    wait_for(|| handler.runs.load(Ordering::SeqCst) == 100);
    assert_eq!(registration.pending_count(), 0);

    unregister_handler(&registration);
}

#[test]
#[should_panic(expected = "unknown handler")]
fn unregistering_twice_is_fatal() {
    let handler = Arc::new(CountingDeferredHandler { runs: AtomicUsize::new(0) });
    let registration = register_handler(handler);
    unregister_handler(&registration);
    unregister_handler(&registration);
}
