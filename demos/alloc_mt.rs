//! Multiple OS threads allocating concurrently through independent
//! `Mutator` handles on one shared heap, with the collector's conductor
//! thread running cycles in the background.
//!
//! Each thread roots its current list head on its own shadow stack --
//! the mechanism the GC conductor walks cross-thread while the mutator
//! sits parked at a safepoint -- rather than through `GlobalRoots`, which
//! only fits roots that don't move.

use pentagon::config::Config;
use pentagon::gc::Collector;
use pentagon::header::ObjectHeader;
use pentagon::heap::Heap;
use pentagon::pagetable::HostPageSource;
use pentagon::scheduler::Scheduler;
use pentagon::shadow_stack::ShadowFrame;
use pentagon::types::TypeDescriptor;
use pentagon::Mutator;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// One managed pointer field, `next`, at offset `0`.
const NODE_OFFSETS: &[usize] = &[0];

fn node_type() -> TypeDescriptor {
    TypeDescriptor::new(8, 8, NODE_OFFSETS, false)
}

fn run_mutator(mutator: Mutator, iterations: u64) {
    let ty = node_type();
    let ty_ptr = &ty as *const TypeDescriptor as *mut TypeDescriptor;

    let mut backing = [0u8; ShadowFrame::HEADER_SIZE + std::mem::size_of::<*mut u8>()];
    let frame = backing.as_mut_ptr() as *mut ShadowFrame;

    unsafe {
        ShadowFrame::init(frame, std::ptr::null_mut(), 0, 1);
        mutator.push_shadow_frame(frame);

        let mut current: *mut ObjectHeader = mutator.alloc(8, ty_ptr).unwrap();
        (*frame).object_slot(0).store(current as *mut u8, Ordering::Release);

        for i in 0..iterations {
            let node = mutator.alloc(8, ty_ptr).unwrap();
            let field = (*node).payload() as *const AtomicPtr<u8>;
            (*field).store(current as *mut u8, Ordering::Relaxed);
            current = node;

            // Periodically drop the chain built so far, handing the
            // collector real garbage to reclaim.
            if i % 8192 == 0 {
                current = mutator.alloc(8, ty_ptr).unwrap();
            }
            (*frame).object_slot(0).store(current as *mut u8, Ordering::Release);
        }

        mutator.pop_shadow_frame(frame);
    }
}

fn main() {
    env_logger::init();

    let mut config = Config::default();
    config.cpu_count = 4;
    config.heap_base = Some(0x7f00_0000_0000);
    config.verbose = true;
    pentagon::waitable::configure(&config);
    let heap = Arc::new(Heap::init(config, Arc::new(HostPageSource::new())).unwrap());
    let scheduler = Arc::new(Scheduler::new());
    let collector = Collector::new(heap.clone(), scheduler.clone());
    collector.spawn_conductor_thread();

    println!("Spawning 4 mutators");
    let mut handles = Vec::new();
    for _ in 0..4 {
        let heap = heap.clone();
        let scheduler = scheduler.clone();
        let collector = collector.clone();
        handles.push(std::thread::spawn(move || {
            let mutator = Mutator::attach(heap, scheduler, collector);
            run_mutator(mutator, 2_000_000);
        }));
    }

    let start = std::time::Instant::now();
    for handle in handles {
        handle.join().unwrap();
    }

    println!("Finished in {:.4} secs", start.elapsed().as_secs_f64());
    println!("{}", collector.stats.snapshot());
}
