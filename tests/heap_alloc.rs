//! Cross-core heap allocation properties: distinct slots
//! under concurrent allocators, and an out-of-resources condition that
//! leaves the heap otherwise usable.

use pentagon::config::Config;
use pentagon::header::Shade;
use pentagon::heap::Heap;
use pentagon::pagetable::HostPageSource;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

fn heap_with_base(base: usize, cpu_count: usize) -> Arc<Heap> {
    let mut config = Config::default();
    config.cpu_count = cpu_count;
    config.heap_base = Some(base);
    Arc::new(Heap::init(config, Arc::new(HostPageSource::new())).unwrap())
}

#[test]
fn many_cores_allocating_concurrently_never_collide_on_a_slot() {
    let heap = heap_with_base(0x7000_0000_0000, 8);
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let heap = heap.clone();
        let seen = seen.clone();
        handles.push(std::thread::spawn(move || {
            let mut mine = Vec::with_capacity(200);
            for _ in 0..200 {
                let hdr = heap.alloc(64, Shade::Shade0).expect("heap has ample room for this test");
                mine.push(hdr as usize);
            }
            let mut seen = seen.lock().unwrap();
            for addr in mine {
                assert!(seen.insert(addr), "two cores were handed the same slot");
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(seen.lock().unwrap().len(), 8 * 200);
}

#[test]
fn oversize_allocation_leaves_the_heap_usable() {
    let heap = heap_with_base(0x7100_0000_0000, 2);
    assert!(heap.alloc(pentagon::globals::MAX_OBJECT_SIZE + 1, Shade::Shade0).is_none());

    let hdr = heap.alloc(128, Shade::Shade0).expect("a normal allocation must still succeed after a failed huge one");
    unsafe {
        assert!(!(*hdr).is_free());
    }
}

#[test]
fn freed_slots_are_reused_by_later_allocations() {
    let heap = heap_with_base(0x7200_0000_0000, 1);
    let first = heap.alloc(48, Shade::Shade0).unwrap();
    let freed = heap.sweep(|_| true);
    assert_eq!(freed, 1);

    let second = heap.alloc(48, Shade::Shade0).unwrap();
    assert_eq!(first, second, "the only free slot in this size class must be the one just swept");
}
