//! The managed object heap: a virtual-address-range
//! segregated-size-class allocator that exploits hardware page-table state
//! for lazy backing-store commit and as the GC's remembered set.

pub mod pool;

use crate::error::Result;
use crate::globals::{self, HUGE_OBJECT_CUTOFF};
use crate::header::{ObjectHeader, Shade};
use crate::pagetable::{Granularity, PageSource};
use crate::{Config, NUM_POOLS};
use pool::Pool;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct HeapStats {
    pub live_objects: AtomicUsize,
}

/// Segregated size-class heap. `alloc`/`find`/`iterate_objects`/
/// `iterate_dirty_objects` are the heap's whole public contract.
pub struct Heap {
    base: usize,
    page_source: Arc<dyn PageSource>,
    pools: Vec<Pool>,
    all_objects_head: AtomicPtr<ObjectHeader>,
    config: Config,
    pub stats: HeapStats,
}

impl Heap {
    /// Reserve the heap virtual range and install top-level page-table
    /// directories. Fails with `OutOfResources` if the
    /// physical-page allocator cannot satisfy directory pages.
    pub fn init(config: Config, page_source: Arc<dyn PageSource>) -> Result<Self> {
        let preferred = config.heap_base.unwrap_or(0x0000_1000_0000_0000);
        let base = page_source.reserve(preferred, globals::HEAP_SPAN)?;

        let mut pools = Vec::with_capacity(NUM_POOLS);
        for p in 0..NUM_POOLS {
            let size_class = globals::pool_size_class(p);
            let pool_base = base + p * globals::POOL_SIZE;
            pools.push(Pool::new(p, size_class, pool_base, config.cpu_count));
        }

        crate::log_if!(config.verbose, "heap initialised: base={:#x} span={:#x}", base, globals::HEAP_SPAN);

        Ok(Self {
            base,
            page_source,
            pools,
            all_objects_head: AtomicPtr::new(std::ptr::null_mut()),
            config,
            stats: HeapStats { live_objects: AtomicUsize::new(0) },
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Find a blue slot in the correct size class and recolour it to
    /// `alloc_color`; `None` on OOM. Preemption must be
    /// disabled by the caller for the whole call -- callers
    /// reach this only through `Mutator::alloc`, which holds the guard.
    pub fn alloc(&self, size: usize, alloc_color: Shade) -> Option<*mut ObjectHeader> {
        let aligned = globals::size_class_for(size)?;
        let pool_idx = globals::size_to_pool(aligned);
        let pool = &self.pools[pool_idx];
        if pool.regions.is_empty() {
            return None;
        }

        let start = pool.start_region_hint();
        let n = pool.regions.len();
        for i in 0..n {
            let region = &pool.regions[(start + i) % n];
            let _guard = match region.lock.try_lock() {
                Some(g) => g,
                None => continue,
            };
            if let Some(hdr) = self.scan_region_for_free_slot(pool, region, aligned, pool_idx) {
                unsafe {
                    ObjectHeader::init_free(hdr, pool_idx);
                    if !(*hdr).try_claim(alloc_color) {
                        crate::fatal!("heap invariant broken: slot {:#x} was claimed by a racing allocator despite its lock region being held", hdr as usize);
                    }
                }
                self.push_all_objects(hdr);
                self.stats.live_objects.fetch_add(1, Ordering::Relaxed);
                return Some(hdr);
            }
        }
        None
    }

    fn scan_region_for_free_slot(
        &self,
        pool: &Pool,
        region: &pool::LockRegion,
        size: usize,
        pool_idx: usize,
    ) -> Option<*mut ObjectHeader> {
        for subpool_idx in region.subpools.clone() {
            let subpool_base = region.subpool_base(pool.base, subpool_idx);
            if let Some(hdr) = self.scan_subpool(subpool_base, size, pool_idx) {
                return Some(hdr);
            }
        }
        None
    }

    fn scan_subpool(&self, subpool_base: usize, size: usize, pool_idx: usize) -> Option<*mut ObjectHeader> {
        let granularity = if size >= HUGE_OBJECT_CUTOFF {
            Granularity::Huge
        } else {
            Granularity::Small
        };
        let mut addr = subpool_base;
        let end = subpool_base + crate::globals::SUBPOOL_SIZE;
        while addr + size <= end {
            match self.ensure_object_backed(addr, size, granularity, pool_idx) {
                Ok(newly_backed) => {
                    if newly_backed {
                        // Freshly materialised: every slot is free by construction.
                        return Some(addr as *mut ObjectHeader);
                    }
                    let hdr = addr as *mut ObjectHeader;
                    if unsafe { (*hdr).is_free() } {
                        return Some(hdr);
                    }
                }
                Err(_) => {
                    // Backing-page OOM: this slot is unusable, try the next one
                    // in this subpool.
                }
            }
            addr += size;
        }
        None
    }

    /// Ensure every page covering `[addr, addr+size)` is present, rolling
    /// back on partial OOM. Returns `Ok(true)` if at least one page was
    /// freshly materialised, `Ok(false)` if everything was already backed.
    ///
    /// Header stamping is split on whether `size` fits inside one page.
    /// When it does (`size <= page_size`), a freshly materialised page holds
    /// several whole slots back to back, and since `size` always evenly
    /// divides `page_size` in that regime, every page boundary is also a
    /// slot boundary -- so every slot in the page is stamped free. When
    /// `size` spans more than one page, `page_size` evenly divides `size`
    /// instead: the object's own slot boundaries fall only at multiples of
    /// `size` from the subpool base, not at every page boundary inside it,
    /// so exactly one header is stamped, at `addr` itself, once all of its
    /// pages are confirmed backed.
    fn ensure_object_backed(
        &self,
        addr: usize,
        size: usize,
        granularity: Granularity,
        pool_idx: usize,
    ) -> Result<bool> {
        let page_size = granularity.page_size();
        let start_page = addr - addr % page_size;
        let end = addr + size;
        let mut acquired = Vec::new();
        let mut any_new = false;
        let mut page = start_page;
        while page < end {
            if !self.page_source.is_present(page, granularity) {
                if let Err(e) = self.page_source.ensure_present(page, granularity) {
                    for p in acquired.iter().rev() {
                        self.page_source.unmap(*p, granularity);
                    }
                    return Err(e);
                }
                acquired.push(page);
                any_new = true;
                if size <= page_size {
                    self.init_slots_in_page(page, page_size, size, pool_idx);
                }
            }
            page += page_size;
        }
        if any_new && size > page_size {
            unsafe {
                ObjectHeader::init_free(addr as *mut ObjectHeader, pool_idx);
            }
        }
        Ok(any_new)
    }

    fn init_slots_in_page(&self, page_base: usize, page_size: usize, size: usize, pool_idx: usize) {
        let mut slot = page_base;
        while slot < page_base + page_size {
            unsafe {
                ObjectHeader::init_free(slot as *mut ObjectHeader, pool_idx);
            }
            slot += size;
        }
    }

    fn push_all_objects(&self, hdr: *mut ObjectHeader) {
        let node = unsafe { &*hdr };
        loop {
            let head = self.all_objects_head.load(Ordering::Acquire);
            node.next.store(head, Ordering::Relaxed);
            if self
                .all_objects_head
                .compare_exchange_weak(head, hdr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Given an arbitrary pointer possibly into the heap, return the
    /// object whose slot contains it, or `None` if no backing page or
    /// outside heap range. Interior-pointer tolerant: used for stack
    /// scanning.
    pub fn find(&self, ptr: usize) -> Option<*mut ObjectHeader> {
        let pool_idx = globals::pool_index_of(self.base, ptr)?;
        let pool = self.pools.get(pool_idx)?;
        let size_class = pool.size_class;
        let granularity = if size_class >= HUGE_OBJECT_CUTOFF {
            Granularity::Huge
        } else {
            Granularity::Small
        };
        if !self.page_source.is_present(ptr, granularity) {
            return None;
        }
        let offset = ptr - pool.base;
        let slot_addr = pool.base + (offset / size_class) * size_class;
        let hdr = slot_addr as *mut ObjectHeader;
        if unsafe { (*hdr).is_free() } {
            return None;
        }
        Some(hdr)
    }

    /// Visit every live slot.
    pub fn iterate_objects(&self, mut cb: impl FnMut(*mut ObjectHeader)) {
        let mut cur = self.all_objects_head.load(Ordering::Acquire);
        while !cur.is_null() {
            cb(cur);
            cur = unsafe { (*cur).next.load(Ordering::Acquire) };
        }
    }

    /// Visit every slot on a dirty page, then clear that page's dirty bit.
    pub fn iterate_dirty_objects(&self, mut cb: impl FnMut(*mut ObjectHeader)) {
        let mut pending_clear: Vec<(usize, Granularity)> = Vec::new();
        self.iterate_objects(|hdr| {
            let addr = hdr as usize;
            let rank = unsafe { (*hdr).rank() };
            let size_class = globals::pool_size_class(rank);
            let granularity = if size_class >= HUGE_OBJECT_CUTOFF {
                Granularity::Huge
            } else {
                Granularity::Small
            };
            if self.page_source.is_dirty(addr, granularity) {
                cb(hdr);
                pending_clear.push((addr, granularity));
            }
        });
        for (addr, granularity) in pending_clear {
            self.page_source.clear_dirty(addr, granularity);
        }
    }

    /// Record a write to `hdr`'s page as dirtying it (the write barrier's
    /// store step goes through here on the hosted page source).
    pub fn mark_dirty(&self, hdr: *mut ObjectHeader) {
        let addr = hdr as usize;
        let rank = unsafe { (*hdr).rank() };
        let size_class = globals::pool_size_class(rank);
        let granularity = if size_class >= HUGE_OBJECT_CUTOFF {
            Granularity::Huge
        } else {
            Granularity::Small
        };
        self.page_source.touch(addr, granularity);
    }

    /// Walk the all-objects list, recolouring every still-white node to
    /// blue and unlinking it. Lock-free excision with CAS-at-head and
    /// re-find-on-contention.
    /// Caller must hold `lock_all_threads` (serialises sweep with
    /// thread creation only, not with concurrent allocation).
    pub fn sweep(&self, is_white: impl Fn(&ObjectHeader) -> bool) -> usize {
        let mut freed = 0usize;
        let mut prev: *const AtomicPtr<ObjectHeader> = &self.all_objects_head;
        loop {
            let cur = unsafe { (*prev).load(Ordering::Acquire) };
            if cur.is_null() {
                break;
            }
            let node = unsafe { &*cur };
            let next = node.next.load(Ordering::Acquire);
            if is_white(node) {
                loop {
                    match unsafe { (*prev).compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire) } {
                        Ok(_) => break,
                        Err(observed) => {
                            if observed == cur {
                                continue;
                            }
                            // A new node was prepended between `prev` and `cur`;
                            // it must be freshly allocated, so it is black and
                            // its `next` still points at `cur`. Re-anchor and
                            // retry the unlink through its `next` slot.
                            let new_node = unsafe { &*observed };
                            prev = &new_node.next;
                        }
                    }
                }
                node.set_color(Shade::Blue);
                freed += 1;
                self.stats.live_objects.fetch_sub(1, Ordering::Relaxed);
            } else {
                prev = &node.next;
            }
        }
        freed
    }

    pub fn page_source(&self) -> &Arc<dyn PageSource> {
        &self.page_source
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
