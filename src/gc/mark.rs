//! Mark phase.
//!
//! Pops addresses off a mark stack; a white object is traced either via its
//! live fields (no log pointer published yet this cycle) or via its
//! log-captured snapshot, then recoloured to this cycle's black. Black and
//! blue objects popped off the stack (pushed there by an earlier, looser
//! root harvest) are simply skipped -- idempotent, so duplicate pushes cost
//! wasted work, never correctness.

use crate::header::{ObjectHeader, Shade};
use crate::types::TypeDescriptor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::stats::GcStats;

pub fn run(mark_stack: &Mutex<Vec<usize>>, current_white: Shade, stats: &GcStats) {
    let mut marked = 0usize;
    loop {
        let addr = match mark_stack.lock().pop() {
            Some(a) => a,
            None => break,
        };
        if addr == 0 {
            continue;
        }
        unsafe {
            let hdr = &*(addr as *mut ObjectHeader);
            if hdr.color() != current_white {
                continue;
            }
            trace_one(hdr, current_white, mark_stack);
            hdr.set_color(current_white.other());
            marked += 1;
        }
    }
    stats.objects_marked.fetch_add(marked, Ordering::Relaxed);
}

unsafe fn trace_one(hdr: &ObjectHeader, current_white: Shade, mark_stack: &Mutex<Vec<usize>>) {
    let type_desc = &*hdr.type_ptr();
    let offsets = type_desc.managed_pointer_offsets;
    let log_pointer = hdr.log_pointer();
    if log_pointer.is_null() {
        for &off in offsets {
            let field = (hdr.payload().add(off)) as *const AtomicPtr<u8>;
            push_referent(mark_stack, (*field).load(Ordering::Relaxed), current_white);
        }
    } else {
        let snapshot = std::slice::from_raw_parts(log_pointer as *const usize, offsets.len());
        for &v in snapshot {
            push_referent(mark_stack, v as *mut u8, current_white);
        }
    }
}

unsafe fn push_referent(mark_stack: &Mutex<Vec<usize>>, referent: *mut u8, current_white: Shade) {
    if referent.is_null() {
        return;
    }
    let hdr = &*(referent as *mut ObjectHeader);
    if hdr.color() == current_white {
        mark_stack.lock().push(referent as usize);
    }
}
