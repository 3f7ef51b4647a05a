//! `throw(exception)`: the JIT's managed-exception entry point.
//!
//! Cross-frame unwinding walks the shadow-stack chain built by
//! [`crate::shadow_stack`] rather than any native exception machinery. Each
//! frame's `method_info` is the same opaque token the JIT already uses to
//! resolve everything else about a compiled method; this crate does not
//! parse or own a method's handler table, so `throw` asks a JIT-registered
//! [`HandlerLookup`] to turn that token (plus the thrown object) into a
//! handler program counter, one frame at a time, stopping at the first
//! frame that has one.

use crate::scheduler::ThreadControlBlock;
use crate::shadow_stack::{self, ShadowFrame};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::sync::Arc;

/// Resolves a frame's `method_info` token to a handler PC for the given
/// exception object, if that method has a matching `catch` clause active at
/// the point of the throw. Implemented by the JIT; this crate has no view
/// into compiled-code handler tables beyond this callback.
pub trait HandlerLookup: Send + Sync {
    fn find_handler(&self, method_info: usize, exception: *mut u8) -> Option<usize>;
}

lazy_static! {
    static ref HANDLER_LOOKUP: RwLock<Option<Arc<dyn HandlerLookup>>> = RwLock::new(None);
}

/// Install the JIT's handler-table lookup. Call once during startup, before
/// any managed code can throw.
pub fn register_handler_lookup(lookup: Arc<dyn HandlerLookup>) {
    *HANDLER_LOOKUP.write() = Some(lookup);
}

/// Where `throw` landed: the shadow frame whose method has a matching
/// handler, and the PC within that method to resume at.
pub struct Handler {
    pub frame: *mut ShadowFrame,
    pub handler_pc: usize,
}

/// Walk `tcb`'s shadow-stack chain innermost-first, asking the registered
/// [`HandlerLookup`] to resolve each frame's `method_info` against
/// `exception`. Every frame strictly above the handler has already run its
/// course, so it is popped off the chain as unwinding passes it; the
/// handler frame itself is left in place for the JIT to resume into.
/// Returns `None` if no frame on the chain handles it -- an unhandled
/// exception, left for the caller (typically the corelib's top-level
/// dispatch loop) to report.
///
/// # Safety
/// `exception` must be a live managed object allocated through
/// [`crate::mutator::Mutator::alloc`]. Must be called by the thread that
/// owns `tcb`, with no other thread concurrently pushing or popping frames
/// on its shadow stack.
pub unsafe fn throw(tcb: &ThreadControlBlock, exception: *mut u8) -> Option<Handler> {
    let lookup = HANDLER_LOOKUP.read().clone()?;
    loop {
        let frame = tcb.shadow_stack.get();
        if frame.is_null() {
            return None;
        }
        if let Some(handler_pc) = lookup.find_handler((*frame).method_info, exception) {
            return Some(Handler { frame, handler_pc });
        }
        shadow_stack::pop_frame(&tcb.shadow_stack, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    struct HandlesEverything;
    impl HandlerLookup for HandlesEverything {
        fn find_handler(&self, method_info: usize, _exception: *mut u8) -> Option<usize> {
            // Pretend method 2 has a `catch` and no other method does.
            if method_info == 2 {
                Some(0xC47C4)
            } else {
                None
            }
        }
    }

    struct HandlesNothing;
    impl HandlerLookup for HandlesNothing {
        fn find_handler(&self, _method_info: usize, _exception: *mut u8) -> Option<usize> {
            None
        }
    }

    fn push(top: &shadow_stack::ShadowStackTop, method_info: usize) -> *mut ShadowFrame {
        let backing = Box::leak(Box::new([0u8; ShadowFrame::HEADER_SIZE]));
        let frame = backing.as_mut_ptr() as *mut ShadowFrame;
        unsafe {
            ShadowFrame::init(frame, top.get(), method_info, 0);
            shadow_stack::push_frame(top, frame);
        }
        frame
    }

    #[test]
    fn throw_unwinds_to_the_first_frame_with_a_handler() {
        register_handler_lookup(Arc::new(HandlesEverything));
        let scheduler = Scheduler::new();
        let tcb = scheduler.attach_current_thread();

        let outer = push(&tcb.shadow_stack, 2);
        let inner = push(&tcb.shadow_stack, 1);

        let handled = unsafe { throw(&tcb, std::ptr::null_mut()) }.expect("method 2 handles it");
        assert_eq!(handled.frame, outer);
        assert_eq!(handled.handler_pc, 0xC47C4);
        // The unhandling inner frame was popped off the chain during unwind.
        assert_eq!(tcb.shadow_stack.get(), outer);

        unsafe { shadow_stack::pop_frame(&tcb.shadow_stack, outer) };
        let _ = inner;
    }

    #[test]
    fn throw_with_no_handler_anywhere_returns_none_and_empties_the_chain() {
        register_handler_lookup(Arc::new(HandlesNothing));
        let scheduler = Scheduler::new();
        let tcb = scheduler.attach_current_thread();
        push(&tcb.shadow_stack, 1);
        push(&tcb.shadow_stack, 2);

        let handled = unsafe { throw(&tcb, std::ptr::null_mut()) };
        assert!(handled.is_none());
        assert!(tcb.shadow_stack.get().is_null());
    }
}
