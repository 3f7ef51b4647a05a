//! Shadow stack: JIT-managed roots for reference-typed locals and temps.
//!
//! Every managed method that may throw or may hold object references in
//! locals/temps allocates a frame on entry with the fixed layout
//! `{prev, method_info, object_count, objects[object_count]}`, all object
//! slots zeroed, linked as the new top of the current thread's chain. Stack
//! walking for both GC rooting and exception unwinding reads this same
//! chain, so the layout is fixed offsets rather than a trait-object-rooted
//! design: the JIT emits direct stores into `objects[i]`, it has no vtable
//! to thread through.

use std::sync::atomic::{AtomicPtr, Ordering};

/// One frame. The JIT allocates these inline in the native stack frame of
/// the method being compiled; this type only describes the fixed header
/// every frame carries in front of its `objects[]` tail.
#[repr(C)]
pub struct ShadowFrame {
    pub prev: *mut ShadowFrame,
    /// Opaque token identifying the managed method this frame belongs to,
    /// consumed by exception unwinding to find a handler (the JIT owns
    /// the metadata behind the token).
    pub method_info: usize,
    pub object_count: usize,
    // `objects: [AtomicPtr<u8>; object_count]` follows immediately; accessed
    // through `objects()`/`objects_mut()` since the count is only known at
    // JIT-compile time, never as a const generic here.
}

impl ShadowFrame {
    pub const HEADER_SIZE: usize = std::mem::size_of::<ShadowFrame>();

    /// # Safety
    /// `at` must point to `Self::HEADER_SIZE + object_count * size_of::<*mut u8>()`
    /// writable bytes that outlive the frame's lifetime on the thread's
    /// shadow-stack chain, and must not alias any other live frame.
    pub unsafe fn init(at: *mut ShadowFrame, prev: *mut ShadowFrame, method_info: usize, object_count: usize) {
        (*at).prev = prev;
        (*at).method_info = method_info;
        (*at).object_count = object_count;
        let objects = Self::objects_ptr(at);
        for i in 0..object_count {
            (*objects.add(i)).store(std::ptr::null_mut(), Ordering::Relaxed);
        }
    }

    unsafe fn objects_ptr(at: *mut ShadowFrame) -> *mut AtomicPtr<u8> {
        (at as *mut u8).add(Self::HEADER_SIZE) as *mut AtomicPtr<u8>
    }

    /// # Safety
    /// `self` must have been initialised with `init` and `i < object_count`.
    pub unsafe fn object_slot(&self, i: usize) -> &AtomicPtr<u8> {
        debug_assert!(i < self.object_count);
        &*Self::objects_ptr(self as *const Self as *mut Self).add(i)
    }
}

/// Top-of-chain pointer, one per thread, carried on that thread's
/// [`crate::scheduler::ThreadControlBlock`] rather than in a `thread_local!`
/// -- the GC conductor is a *different* OS thread and must be able to read
/// a suspended mutator's chain while that mutator sits at a safepoint
///. A bare `thread_local!` is only
/// readable by its own thread, so it cannot serve that contract.
pub struct ShadowStackTop(AtomicPtr<ShadowFrame>);

impl ShadowStackTop {
    pub fn new() -> Self {
        Self(AtomicPtr::new(std::ptr::null_mut()))
    }

    pub fn get(&self) -> *mut ShadowFrame {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for ShadowStackTop {
    fn default() -> Self {
        Self::new()
    }
}

/// Link `frame` as the new top of `top`'s chain. Must be paired with
/// [`pop_frame`] before the method returns, LIFO, matching the native call
/// stack exactly.
///
/// # Safety
/// `frame` must already be initialised via `ShadowFrame::init` with `prev`
/// equal to `top.get()`, and `top` must belong to the calling thread.
pub unsafe fn push_frame(top: &ShadowStackTop, frame: *mut ShadowFrame) {
    if (*frame).prev != top.get() {
        crate::fatal!("shadow-frame mismatch: frame {:#x} was initialised with a stale `prev` link", frame as usize);
    }
    top.0.store(frame, Ordering::Release);
}

/// Unlink the current top frame, restoring its `prev` as the new top.
///
/// # Safety
/// Must be called with `frame` equal to `top.get()`, by the thread that
/// owns `top`.
pub unsafe fn pop_frame(top: &ShadowStackTop, frame: *mut ShadowFrame) {
    if frame != top.get() {
        crate::fatal!("shadow-frame mismatch: popped frame {:#x} is not the current top {:#x}", frame as usize, top.get() as usize);
    }
    top.0.store((*frame).prev, Ordering::Release);
}

/// Walk every frame on `top`'s chain, innermost first, for both GC rooting
/// and exception unwinding.
///
/// # Safety
/// Must only be called by the owning thread, or by the GC while that
/// thread is parked at a safepoint.
pub unsafe fn walk(top: &ShadowStackTop, mut visitor: impl FnMut(&ShadowFrame)) {
    let mut frame = top.get();
    while !frame.is_null() {
        visitor(&*frame);
        frame = (*frame).prev;
    }
}
