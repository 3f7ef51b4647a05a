//! Pools, subpools and lock regions.

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::globals::{SUBPOOLS_PER_POOL, SUBPOOL_SIZE};

/// One spinlock guarding a consecutive run of subpools. Exactly `cpu_count`
/// regions exist per pool so a try-lock contends with at most one other
/// core, guaranteeing allocation progress without a blocking lock.
/// Cache-line padded: neighbouring regions are try-locked by different
/// cores at the same time, and without padding their spinlocks would
/// false-share a line.
pub struct LockRegion {
    pub lock: CachePadded<Mutex<()>>,
    pub subpools: Range<usize>,
}

impl LockRegion {
    pub fn subpool_base(&self, pool_base: usize, subpool_index: usize) -> usize {
        pool_base + subpool_index * SUBPOOL_SIZE
    }
}

pub struct Pool {
    pub index: usize,
    pub size_class: usize,
    pub base: usize,
    pub regions: Vec<LockRegion>,
    /// Rotates the region a core starts scanning from, so repeated
    /// allocations from the same core spread load across regions instead of
    /// hammering region 0.
    next_region_hint: AtomicUsize,
}

impl Pool {
    pub fn new(index: usize, size_class: usize, base: usize, cpu_count: usize) -> Self {
        let cpu_count = cpu_count.max(1);
        let per_region = (SUBPOOLS_PER_POOL / cpu_count).max(1);
        let mut regions = Vec::with_capacity(cpu_count);
        let mut start = 0usize;
        for i in 0..cpu_count {
            if start >= SUBPOOLS_PER_POOL {
                break;
            }
            let end = if i + 1 == cpu_count {
                SUBPOOLS_PER_POOL
            } else {
                (start + per_region).min(SUBPOOLS_PER_POOL)
            };
            regions.push(LockRegion {
                lock: CachePadded::new(Mutex::new(())),
                subpools: start..end,
            });
            start = end;
        }
        Self {
            index,
            size_class,
            base,
            regions,
            next_region_hint: AtomicUsize::new(0),
        }
    }

    pub fn start_region_hint(&self) -> usize {
        if self.regions.is_empty() {
            return 0;
        }
        self.next_region_hint.fetch_add(1, Ordering::Relaxed) % self.regions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_partition_all_subpools_with_no_gaps() {
        for cpu_count in [1usize, 2, 3, 4, 7, 16, 512] {
            let pool = Pool::new(0, 16, 0, cpu_count);
            let mut covered = 0usize;
            let mut prev_end = 0usize;
            for region in &pool.regions {
                assert_eq!(region.subpools.start, prev_end);
                covered += region.subpools.len();
                prev_end = region.subpools.end;
            }
            assert_eq!(covered, SUBPOOLS_PER_POOL);
            assert_eq!(prev_end, SUBPOOLS_PER_POOL);
        }
    }
}
