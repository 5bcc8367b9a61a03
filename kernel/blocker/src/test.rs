extern crate std;

use super::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn unblock_before_block_returns_immediately() {
    let blocker = Blocker::new();
    blocker.unblock();
    assert_eq!(blocker.block(), BlockResult::Unblocked);
}

#[test]
fn cross_thread_unblock() {
    let blocker = Arc::new(Blocker::new());
    let signaller = blocker.clone();

    let waiter = thread::spawn(move || blocker.block());
    thread::sleep(Duration::from_millis(20));
    signaller.unblock();

    assert_eq!(waiter.join().unwrap(), BlockResult::Unblocked);
}

#[test]
fn interruption_wins_over_later_unblock() {
    let blocker = Blocker::new();
    blocker.interrupt();
    blocker.unblock();
    assert_eq!(blocker.block(), BlockResult::Interrupted);
}

#[test]
fn repeated_block_sees_same_result() {
    let blocker = Blocker::new();
    blocker.unblock();
    assert_eq!(blocker.block(), BlockResult::Unblocked);
    assert_eq!(blocker.block(), BlockResult::Unblocked);
}
