//! Log-pointer write barrier.
//!
//! Every field write of a reference-typed field compiles to a call here,
//! never to a direct store -- the one entry point a reference write is
//! allowed to go through. Preemption is disabled for the whole call.

use crate::header::{ObjectHeader, Shade};
use crate::heap::Heap;
use crate::scheduler::{GcLocalData, LogEntry, ThreadControlBlock};
use crate::types::TypeDescriptor;
use std::sync::atomic::{AtomicPtr, Ordering};

/// # Safety
/// `o` must point to a live, initialised object whose type is `type_desc`,
/// with `offset` one of `type_desc.managed_pointer_offsets` measured from
/// `o`'s payload. `tcb` must be the calling thread's own control block, and
/// `heap` the heap `o` was allocated from.
pub unsafe fn gc_update(
    o: *mut ObjectHeader,
    type_desc: &TypeDescriptor,
    offset: usize,
    new: *mut u8,
    tcb: &ThreadControlBlock,
    current_white: Shade,
    heap: &Heap,
) {
    let _guard = crate::scheduler::disable_preemption();
    let hdr = &*o;
    if tcb.gc.trace_on.load(Ordering::Acquire) && hdr.color() == current_white && hdr.log_pointer().is_null() {
        capture_pre_image(o, type_desc, hdr, &tcb.gc);
    }

    let field = (hdr.payload().add(offset)) as *const AtomicPtr<u8>;
    (*field).store(new, Ordering::Relaxed);
    // A white object this barrier touches must end up
    // either log-pointed (the branch above) or dirty-traced -- the log
    // pointer only protects the pre-image, so the dirty bit is what lets
    // `iterate_dirty_objects` find this write even when no cycle is in
    // flight to have published a log pointer at all.
    heap.mark_dirty(o);

    if tcb.gc.snoop.load(Ordering::Acquire) && !new.is_null() {
        tcb.gc.snooped.lock().insert(new as usize);
    }
}

/// Double-checked publish of the pre-mutation snapshot.
/// `ObjectHeader::try_publish_log_pointer`'s CAS from null *is* the
/// re-check: if it fails, some other writer already published this cycle's
/// snapshot first and this thread's copy is simply discarded.
unsafe fn capture_pre_image(o: *mut ObjectHeader, type_desc: &TypeDescriptor, hdr: &ObjectHeader, gc: &GcLocalData) {
    let offsets = type_desc.managed_pointer_offsets;
    let mut snapshot = Vec::with_capacity(offsets.len());
    for &off in offsets {
        let field = (hdr.payload().add(off)) as *const AtomicPtr<u8>;
        snapshot.push((*field).load(Ordering::Relaxed) as usize);
    }
    let boxed = snapshot.into_boxed_slice();
    let ptr = boxed.as_ptr() as *mut u8;
    if hdr.try_publish_log_pointer(ptr) {
        gc.log_buffer.lock().push(LogEntry { header: o as usize, snapshot: boxed });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagetable::HostPageSource;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;

    const OFFSETS: &[usize] = &[0];

    fn test_heap() -> Heap {
        let mut config = crate::config::Config::default();
        config.cpu_count = 2;
        config.heap_base = Some(0x0000_6300_0000_0000);
        Heap::init(config, Arc::new(HostPageSource::new())).unwrap()
    }

    fn make_object(heap: &Heap) -> *mut ObjectHeader {
        heap.alloc(8, Shade::Shade0).expect("alloc should succeed")
    }

    #[test]
    fn barrier_logs_pre_image_once_while_tracing_a_white_object() {
        let heap = test_heap();
        let scheduler = Scheduler::new();
        let tcb = scheduler.attach_current_thread();
        let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
        let obj = make_object(&heap);
        unsafe {
            (*obj).set_color(Shade::Shade0);
            tcb.gc.trace_on.store(true, Ordering::Release);

            let mut referent_a = 0u8;
            let mut referent_b = 0u8;

            gc_update(obj, &ty, 0, &mut referent_a as *mut u8, &tcb, Shade::Shade0, &heap);
            assert!(!(*obj).log_pointer().is_null());
            let logged_before = (*obj).log_pointer();

            gc_update(obj, &ty, 0, &mut referent_b as *mut u8, &tcb, Shade::Shade0, &heap);
            assert_eq!((*obj).log_pointer(), logged_before, "second barrier call must not republish");

            let field = ((*obj).payload()) as *const AtomicPtr<u8>;
            assert_eq!((*field).load(Ordering::Relaxed), &mut referent_b as *mut u8);
        }
    }

    #[test]
    fn barrier_does_not_log_when_tracing_is_off() {
        let heap = test_heap();
        let scheduler = Scheduler::new();
        let tcb = scheduler.attach_current_thread();
        let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
        let obj = make_object(&heap);
        unsafe {
            (*obj).set_color(Shade::Shade0);
            let mut referent = 0u8;
            gc_update(obj, &ty, 0, &mut referent as *mut u8, &tcb, Shade::Shade0, &heap);
            assert!((*obj).log_pointer().is_null());
        }
    }

    #[test]
    fn barrier_snoops_new_references_while_snoop_is_on() {
        let heap = test_heap();
        let scheduler = Scheduler::new();
        let tcb = scheduler.attach_current_thread();
        let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
        let obj = make_object(&heap);
        unsafe {
            tcb.gc.snoop.store(true, Ordering::Release);
            let mut referent = 0u8;
            let addr = &mut referent as *mut u8;
            gc_update(obj, &ty, 0, addr, &tcb, Shade::Shade0, &heap);
            assert!(tcb.gc.snooped.lock().contains(&(addr as usize)));
        }
    }

    #[test]
    fn barrier_dirties_the_objects_page_on_every_store() {
        let heap = test_heap();
        let scheduler = Scheduler::new();
        let tcb = scheduler.attach_current_thread();
        let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
        let obj = make_object(&heap);
        unsafe {
            (*obj).set_color(Shade::Shade0);
            let mut referent = 0u8;
            gc_update(obj, &ty, 0, &mut referent as *mut u8, &tcb, Shade::Shade0, &heap);
        }
        let mut seen = 0;
        heap.iterate_dirty_objects(|h| {
            assert_eq!(h, obj);
            seen += 1;
        });
        assert_eq!(seen, 1, "a live write outside any cycle must still land in the remembered set");
    }
}
