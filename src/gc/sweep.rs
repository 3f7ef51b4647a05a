//! Sweep phase: thin colour-flip-aware wrapper
//! around [`crate::heap::Heap::sweep`], which already implements the
//! lock-free CAS-at-head-then-refind-on-contention excision. This module only supplies the "still white at this cycle's colour"
//! predicate and folds the freed count into [`super::stats::GcStats`].

use crate::globals;
use crate::header::Shade;
use crate::heap::Heap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::stats::GcStats;

pub fn run(heap: &Heap, current_white: Shade, stats: &GcStats) -> usize {
    let bytes = AtomicUsize::new(0);
    let freed = heap.sweep(|node| {
        let is_white = node.color() == current_white;
        if is_white {
            bytes.fetch_add(globals::pool_size_class(node.rank()), Ordering::Relaxed);
        }
        is_white
    });
    stats.objects_swept.fetch_add(freed, Ordering::Relaxed);
    stats.bytes_swept.fetch_add(bytes.load(Ordering::Relaxed), Ordering::Relaxed);
    freed
}
