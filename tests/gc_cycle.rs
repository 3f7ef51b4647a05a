//! A full concurrent cycle driven asynchronously through the conductor
//! thread, as opposed to the inline unit tests in
//! `src/gc/mod.rs` which call the four handshakes directly for
//! determinism. This exercises `Collector::spawn_conductor_thread` and
//! `gc_wait` exactly as a real mutator would.

use pentagon::config::Config;
use pentagon::gc::Collector;
use pentagon::heap::Heap;
use pentagon::pagetable::HostPageSource;
use pentagon::scheduler::Scheduler;
use pentagon::types::TypeDescriptor;
use pentagon::Mutator;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

const OFFSETS: &[usize] = &[0];

fn test_runtime(base: usize, cpu_count: usize) -> (Arc<Heap>, Arc<Scheduler>, Arc<Collector>) {
    let mut config = Config::default();
    config.cpu_count = cpu_count;
    config.heap_base = Some(base);
    let heap = Arc::new(Heap::init(config, Arc::new(HostPageSource::new())).unwrap());
    let scheduler = Arc::new(Scheduler::new());
    let collector = Collector::new(heap.clone(), scheduler.clone());
    collector.spawn_conductor_thread();
    (heap, scheduler, collector)
}

#[test]
fn gc_wait_blocks_until_unreachable_garbage_is_swept() {
    let (heap, scheduler, collector) = test_runtime(0x7500_0000_0000, 2);
    let mutator = Mutator::attach(heap, scheduler, collector.clone());
    let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
    let ty_ptr = &ty as *const TypeDescriptor as *mut TypeDescriptor;

    let garbage = mutator.alloc(8, ty_ptr).unwrap();
    collector.gc_wait(mutator.tcb());

    unsafe {
        assert!((*garbage).is_free(), "nothing rooted this object; it must not survive a cycle");
    }
    assert_eq!(collector.stats.snapshot().cycles, 1);
}

#[test]
fn rooted_object_survives_repeated_cycles() {
    let (heap, scheduler, collector) = test_runtime(0x7600_0000_0000, 2);
    let mutator = Mutator::attach(heap, scheduler, collector.clone());
    let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
    let ty_ptr = &ty as *const TypeDescriptor as *mut TypeDescriptor;

    let child = mutator.alloc(8, ty_ptr).unwrap();
    let root = mutator.alloc(8, ty_ptr).unwrap();
    unsafe {
        let field = (*root).payload() as *const AtomicPtr<u8>;
        (*field).store(child as *mut u8, Ordering::Relaxed);
    }
    collector.global_roots.register(root as usize);

    for _ in 0..3 {
        collector.gc_wait(mutator.tcb());
    }

    unsafe {
        assert!(!(*root).is_free());
        assert!(!(*child).is_free(), "reachable through the root every cycle, must never be swept");
    }
    assert_eq!(collector.stats.snapshot().cycles, 3);
}

#[test]
fn gc_wake_does_not_block_the_caller() {
    let (heap, scheduler, collector) = test_runtime(0x7700_0000_0000, 2);
    let mutator = Mutator::attach(heap, scheduler, collector.clone());
    let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
    let ty_ptr = &ty as *const TypeDescriptor as *mut TypeDescriptor;
    mutator.alloc(8, ty_ptr).unwrap();

    collector.gc_wake();
    // gc_wake must return immediately; gc_wait is the blocking call that
    // actually waits for the cycle it kicked off (or a newer one) to land.
    collector.gc_wait(mutator.tcb());
    assert!(collector.stats.snapshot().cycles >= 1);
}
