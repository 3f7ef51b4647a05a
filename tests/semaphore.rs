//! Semaphore wake order and the `Mutex`/`CondVar` machinery built on top of
//! it, exercised across real OS threads. `src/scheduler/
//! semaphore.rs` and `src/scheduler/mutex.rs` already cover FIFO handoff
//! and contended-increment correctness inline; this covers the LIFO mode
//! and a CondVar-gated producer/consumer handoff, neither of which those
//! inline suites touch.

use pentagon::scheduler::mutex::{CondVar, Mutex};
use pentagon::scheduler::semaphore::Semaphore;
use pentagon::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn lifo_order_hands_off_to_the_newest_waiter_first() {
    let scheduler = Arc::new(Scheduler::new());
    let sem = Arc::new(Semaphore::new(0, true));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for id in 0..3 {
        let scheduler = scheduler.clone();
        let sem = sem.clone();
        let order = order.clone();
        handles.push(std::thread::spawn(move || {
            scheduler.attach_current_thread();
            std::thread::sleep(Duration::from_millis(10 * id as u64));
            sem.acquire(&scheduler);
            order.lock().push(id);
        }));
        std::thread::sleep(Duration::from_millis(15));
    }
    for _ in 0..3 {
        sem.release();
        std::thread::sleep(Duration::from_millis(15));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![2, 1, 0], "LIFO must hand off to the most recently queued waiter first");
}

#[test]
fn condvar_wakes_a_consumer_waiting_on_an_empty_queue() {
    let scheduler = Arc::new(Scheduler::new());
    scheduler.attach_current_thread();

    let queue = Arc::new(Mutex::new(Vec::<i32>::new()));
    let not_empty = Arc::new(CondVar::new());

    let consumer_scheduler = scheduler.clone();
    let consumer_queue = queue.clone();
    let consumer_cv = not_empty.clone();
    let consumer = std::thread::spawn(move || {
        consumer_scheduler.attach_current_thread();
        let mut guard = consumer_queue.lock(&consumer_scheduler);
        while guard.is_empty() {
            guard = consumer_cv.wait(guard);
        }
        guard.pop().unwrap()
    });

    std::thread::sleep(Duration::from_millis(20));
    {
        let mut guard = queue.lock(&scheduler);
        guard.push(7);
    }
    not_empty.notify_one();

    assert_eq!(consumer.join().unwrap(), 7);
}
