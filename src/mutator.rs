//! Mutator-facing facade: the one entry point managed
//! code and the JIT call through to allocate. Ties the heap, scheduler and
//! collector together as a thin per-thread view over the shared heap, not
//! a second allocator.

use crate::error::{PentagonError, Result};
use crate::gc::Collector;
use crate::globals;
use crate::header::{ObjectHeader, Shade};
use crate::heap::Heap;
use crate::scheduler::{disable_preemption, Scheduler, ThreadControlBlock};
use crate::types::TypeDescriptor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct Mutator {
    heap: Arc<Heap>,
    scheduler: Arc<Scheduler>,
    collector: Arc<Collector>,
    tcb: Arc<ThreadControlBlock>,
}

impl Mutator {
    /// Register the calling OS thread with the scheduler and return its
    /// mutator handle.
    pub fn attach(heap: Arc<Heap>, scheduler: Arc<Scheduler>, collector: Arc<Collector>) -> Self {
        let tcb = scheduler.attach_current_thread();
        Self { heap, scheduler, collector, tcb }
    }

    pub fn tcb(&self) -> &Arc<ThreadControlBlock> {
        &self.tcb
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Push a shadow-stack frame onto this thread's chain, for JIT-emitted
    /// method prologues.
    ///
    /// # Safety
    /// See [`crate::shadow_stack::push_frame`].
    pub unsafe fn push_shadow_frame(&self, frame: *mut crate::shadow_stack::ShadowFrame) {
        crate::shadow_stack::push_frame(&self.tcb.shadow_stack, frame);
    }

    /// Pop a shadow-stack frame, for JIT-emitted method epilogues.
    ///
    /// # Safety
    /// See [`crate::shadow_stack::pop_frame`].
    pub unsafe fn pop_shadow_frame(&self, frame: *mut crate::shadow_stack::ShadowFrame) {
        crate::shadow_stack::pop_frame(&self.tcb.shadow_stack, frame);
    }

    /// `throw(exception)`: unwind this thread's shadow stack looking for a
    /// handler.
    ///
    /// # Safety
    /// See [`crate::exception::throw`].
    pub unsafe fn throw(&self, exception: *mut u8) -> Option<crate::exception::Handler> {
        crate::exception::throw(&self.tcb, exception)
    }

    fn alloc_color(&self) -> Shade {
        Shade::from_raw(self.tcb.gc.alloc_color.load(Ordering::Acquire))
    }

    /// Allocate `size` bytes stamped with `ty`, polling for a pending
    /// safepoint first. On OOM, request a GC cycle and
    /// wait for it, then retry exactly once -- a second miss is a genuine
    /// out-of-resources condition, not transient fragmentation.
    ///
    /// A request above `MAX_OBJECT_SIZE` is rejected up front, before any
    /// attempt to allocate: it can never succeed no matter how much the heap
    /// collects, so running a GC cycle for it first would only add the cost
    /// of a four-handshake stop-the-world to a request that was always
    /// going to fail.
    pub fn alloc(&self, size: usize, ty: *mut TypeDescriptor) -> Result<*mut ObjectHeader> {
        if size > globals::MAX_OBJECT_SIZE {
            return Err(PentagonError::InvalidArgument(format!(
                "allocation of {} bytes exceeds the maximum object size of {} bytes",
                size,
                globals::MAX_OBJECT_SIZE
            )));
        }

        if let Some(hdr) = self.try_alloc_once(size) {
            unsafe { (*hdr).set_type_ptr(ty) };
            return Ok(hdr);
        }

        self.collector.gc_wait(&self.tcb);

        self.try_alloc_once(size)
            .map(|hdr| {
                unsafe { (*hdr).set_type_ptr(ty) };
                hdr
            })
            .ok_or_else(|| PentagonError::OutOfResources(format!("no free slot for {} bytes after a GC cycle", size)))
    }

    fn try_alloc_once(&self, size: usize) -> Option<*mut ObjectHeader> {
        let _guard = disable_preemption();
        self.scheduler.safepoint.poll(&self.tcb);
        self.heap.alloc(size, self.alloc_color())
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.scheduler.drop_current();
    }
}
