//! Type descriptor contract.
//!
//! This is deliberately a plain record, not a trait object or `dyn Trace`
//! abstraction: `managed_pointer_offsets` is already the GC's whole
//! dynamic-dispatch table, so there is nothing to gain from an extra
//! indirection layer here.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Consumed, never constructed by this crate: metadata is built upstream by
/// the CIL metadata parser.
#[repr(C)]
pub struct TypeDescriptor {
    pub base_type: *mut TypeDescriptor,
    pub element_type: *mut TypeDescriptor,
    /// Byte offsets, in ascending order, within an instance at which a
    /// managed object reference lives. The GC's sole map for tracing.
    pub managed_pointer_offsets: &'static [usize],
    pub stack_size: usize,
    pub managed_size: usize,
    pub managed_alignment: usize,
    pub is_value_type: bool,
    array_type: Mutex<AtomicPtr<TypeDescriptor>>,
}

impl TypeDescriptor {
    pub fn new(
        managed_size: usize,
        managed_alignment: usize,
        managed_pointer_offsets: &'static [usize],
        is_value_type: bool,
    ) -> Self {
        Self {
            base_type: std::ptr::null_mut(),
            element_type: std::ptr::null_mut(),
            managed_pointer_offsets,
            stack_size: managed_size,
            managed_size,
            managed_alignment,
            is_value_type,
            array_type: Mutex::new(AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    /// Lazily-computed array type for this element type, guarded by
    /// `array_type_mutex`.
    pub fn array_type(&self, compute: impl FnOnce() -> *mut TypeDescriptor) -> *mut TypeDescriptor {
        let guard = self.array_type.lock();
        let existing = guard.load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }
        let computed = compute();
        guard.store(computed, Ordering::Release);
        computed
    }
}

unsafe impl Send for TypeDescriptor {}
unsafe impl Sync for TypeDescriptor {}
