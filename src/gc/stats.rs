//! GC cycle counters.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct GcStats {
    pub cycles: AtomicUsize,
    pub objects_marked: AtomicUsize,
    pub objects_swept: AtomicUsize,
    pub bytes_swept: AtomicUsize,
}

impl GcStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the cycle counter only. `mark::run`/`sweep::run` already fold
    /// their own counts into `objects_marked`/`objects_swept` as they go
    /// (so a long-running cycle's counters are visible before it finishes);
    /// the collector's end-of-cycle bookkeeping must not re-add them on top.
    pub fn complete_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            objects_marked: self.objects_marked.load(Ordering::Relaxed),
            objects_swept: self.objects_swept.load(Ordering::Relaxed),
            bytes_swept: self.bytes_swept.load(Ordering::Relaxed),
        }
    }
}

pub struct GcStatsSnapshot {
    pub cycles: usize,
    pub objects_marked: usize,
    pub objects_swept: usize,
    pub bytes_swept: usize,
}

struct FormattedSize(usize);

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kib = self.0 as f64 / 1024.0;
        if kib < 1.0 {
            return write!(f, "{}B", self.0);
        }
        let mib = kib / 1024.0;
        if mib < 1.0 {
            return write!(f, "{:.1}K", kib);
        }
        let gib = mib / 1024.0;
        if gib < 1.0 {
            write!(f, "{:.1}M", mib)
        } else {
            write!(f, "{:.1}G", gib)
        }
    }
}

impl std::fmt::Display for GcStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GC statistics:")?;
        writeln!(f, "  Cycles run: {}", self.cycles)?;
        writeln!(f, "  Objects marked (lifetime): {}", self.objects_marked)?;
        writeln!(f, "  Objects swept (lifetime): {}", self.objects_swept)?;
        writeln!(f, "  Bytes reclaimed (lifetime): {}", FormattedSize(self.bytes_swept))
    }
}
