//! The physical-page allocator and four-level page tables live below this
//! crate: the heap *uses* `palloc`/`pfree` and hardware presence/dirty bits,
//! it does not implement them. This module is the trait boundary that
//! stands in for that collaborator, plus a hosted implementation so the
//! heap and GC algorithms can be exercised without a real kernel underneath
//! -- calling `mmap`/`madvise` rather than walking page-table entries
//! directly.
//!
//! Real Pentagon gets page-table presence and dirty bits from hardware for
//! free. Hosted here, a page is "present" once [`PageSource::ensure_present`]
//! has been called for it, and "dirty" once something has gone through
//! [`PageSource::touch`] for it -- the heap and GC call through this trait at
//! exactly the points the real kernel would consult silicon, so swapping in
//! a real four-level-page-table-backed implementation later changes nothing
//! above this module.
//!
//! Unlike the rest of this module's bookkeeping, `reserve`/`ensure_present`
//! genuinely have to back the address range with memory: the heap writes an
//! `ObjectHeader` straight through the slot pointer (`Heap::init_slots_in_page`),
//! so an address this trait calls "present" must actually be readable and
//! writable, not just recorded in a set. `HostPageSource` gets this from the
//! same reserve-then-commit `mmap`/`mprotect` pair any unix virtual-memory
//! wrapper reaches for.

use crate::error::{PentagonError, Result};
use crate::globals::{HUGE_PAGE_SIZE, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::os::raw::c_void;

/// Which hardware page-table level covers dirty tracking for a slot of this
/// size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Small,
    Huge,
}

impl Granularity {
    pub fn for_size_class(size: usize) -> Granularity {
        if size >= HUGE_PAGE_SIZE {
            Granularity::Huge
        } else {
            Granularity::Small
        }
    }

    pub fn page_size(self) -> usize {
        match self {
            Granularity::Small => PAGE_SIZE,
            Granularity::Huge => HUGE_PAGE_SIZE,
        }
    }
}

fn page_base(addr: usize, granularity: Granularity) -> usize {
    let page = granularity.page_size();
    addr - (addr % page)
}

/// Trait boundary standing in for `palloc`/`pfree` and four-level page-table
/// edits.
pub trait PageSource: Send + Sync {
    /// Reserve `size` bytes of virtual address space as close to `base` as
    /// the underlying address space allows, with no physical backing and
    /// all entries absent. Returns the address actually reserved -- equal
    /// to `base` whenever the hint can be honoured, which a hosted
    /// implementation cannot always guarantee the way a real kernel's
    /// caller-chosen heap base can. Fails with `OutOfResources` if no range
    /// of that size is available.
    fn reserve(&self, base: usize, size: usize) -> Result<usize>;

    /// True if the page-table entry covering `addr` at `granularity` is
    /// present (i.e. backed by a physical page). An unbacked slot is, by
    /// construction, free.
    fn is_present(&self, addr: usize, granularity: Granularity) -> bool;

    /// Materialise page-table entries (and back them with physical pages)
    /// for the page covering `addr`. Idempotent. Fails with
    /// `OutOfResources` if the physical-page allocator cannot satisfy the
    /// request; the caller must roll back any partially-backed huge object
    /// rather than leave a dead partially-mapped region.
    fn ensure_present(&self, addr: usize, granularity: Granularity) -> Result<()>;

    /// Unmap and mark absent again. Used only to roll back a partially
    /// backed huge allocation on OOM -- the heap never frees pages back to
    /// the system on an ordinary sweep.
    fn unmap(&self, addr: usize, granularity: Granularity);

    /// Record that `addr` was written through. Hardware sets the PML1/PML2
    /// dirty bit on any write to a page; this is the hosted stand-in for
    /// that.
    fn touch(&self, addr: usize, granularity: Granularity);

    /// True if the page covering `addr` has been written since the last
    /// `clear_dirty` for it.
    fn is_dirty(&self, addr: usize, granularity: Granularity) -> bool;

    /// Clear the dirty bit for the page covering `addr`. Must only be
    /// called after every dirty object on the page has been visited, never
    /// before.
    fn clear_dirty(&self, addr: usize, granularity: Granularity);
}

/// Hosted `PageSource`: a real `mmap`'d reservation kept `PROT_NONE` until
/// `ensure_present` commits a page with `mprotect`, plus ordinary locked
/// sets for the dirty tracking hardware would otherwise give for free.
/// Good enough to exercise every allocator and GC algorithm in this crate
/// on a workstation OS, against genuinely dereferenceable memory.
pub struct HostPageSource {
    reservations: Mutex<Vec<(usize, usize)>>,
    present: Mutex<HashSet<usize>>,
    dirty: Mutex<HashSet<usize>>,
}

impl HostPageSource {
    pub fn new() -> Self {
        Self {
            reservations: Mutex::new(Vec::new()),
            present: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    fn is_reserved(&self, addr: usize) -> bool {
        self.reservations
            .lock()
            .iter()
            .any(|&(base, size)| addr >= base && addr < base + size)
    }
}

impl Default for HostPageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for HostPageSource {
    fn reserve(&self, base: usize, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(PentagonError::InvalidArgument("reserve size must be non-zero".into()));
        }
        // `base` is a hint, not `MAP_FIXED`: a fixed mapping would silently
        // tear down whatever the kernel (or an earlier `HostPageSource`)
        // already has at that address, turning two independently reserving
        // heaps in the same process into silent corruption instead of an
        // `OutOfResources`. Letting the kernel place the mapping keeps the
        // non-overlap guarantee real `mmap` already provides.
        let mapped = unsafe {
            libc::mmap(base as *mut c_void, size, libc::PROT_NONE, libc::MAP_PRIVATE | libc::MAP_ANON, -1, 0)
        };
        if mapped == libc::MAP_FAILED {
            return Err(PentagonError::OutOfResources(format!(
                "mmap failed to reserve {:#x} bytes near {:#x}: {}",
                size,
                base,
                std::io::Error::last_os_error()
            )));
        }
        let actual = mapped as usize;
        self.reservations.lock().push((actual, size));
        Ok(actual)
    }

    fn is_present(&self, addr: usize, granularity: Granularity) -> bool {
        let base = page_base(addr, granularity);
        self.present.lock().contains(&base)
    }

    fn ensure_present(&self, addr: usize, granularity: Granularity) -> Result<()> {
        if !self.is_reserved(addr) {
            return Err(PentagonError::OutOfResources(format!(
                "address {:#x} is outside any reserved heap range",
                addr
            )));
        }
        let base = page_base(addr, granularity);
        let page_size = granularity.page_size();
        let rc = unsafe { libc::mprotect(base as *mut c_void, page_size, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            return Err(PentagonError::OutOfResources(format!(
                "mprotect failed to back page {:#x}: {}",
                base,
                std::io::Error::last_os_error()
            )));
        }
        self.present.lock().insert(base);
        Ok(())
    }

    fn unmap(&self, addr: usize, granularity: Granularity) {
        let base = page_base(addr, granularity);
        let page_size = granularity.page_size();
        unsafe {
            libc::mprotect(base as *mut c_void, page_size, libc::PROT_NONE);
        }
        self.present.lock().remove(&base);
        self.dirty.lock().remove(&base);
    }

    fn touch(&self, addr: usize, granularity: Granularity) {
        let base = page_base(addr, granularity);
        self.dirty.lock().insert(base);
    }

    fn is_dirty(&self, addr: usize, granularity: Granularity) -> bool {
        let base = page_base(addr, granularity);
        self.dirty.lock().contains(&base)
    }

    fn clear_dirty(&self, addr: usize, granularity: Granularity) {
        let base = page_base(addr, granularity);
        self.dirty.lock().remove(&base);
    }
}

impl Drop for HostPageSource {
    fn drop(&mut self) {
        for (base, size) in self.reservations.lock().drain(..) {
            unsafe {
                libc::munmap(base as *mut c_void, size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbacked_slot_is_absent_and_free() {
        let src = HostPageSource::new();
        let base = src.reserve(0x0000_2000_0000_0000, 1 << 20).unwrap();
        assert!(!src.is_present(base + 0x100, Granularity::Small));
        src.ensure_present(base + 0x100, Granularity::Small).unwrap();
        assert!(src.is_present(base + 0x100, Granularity::Small));
    }

    #[test]
    fn touch_then_clear_is_idempotent() {
        let src = HostPageSource::new();
        let base = src.reserve(0x0000_2100_0000_0000, 1 << 20).unwrap();
        src.ensure_present(base, Granularity::Small).unwrap();
        assert!(!src.is_dirty(base, Granularity::Small));
        src.touch(base + 0x10, Granularity::Small);
        assert!(src.is_dirty(base, Granularity::Small));
        src.clear_dirty(base, Granularity::Small);
        assert!(!src.is_dirty(base, Granularity::Small));
    }

    #[test]
    fn ensure_present_outside_reservation_is_out_of_resources() {
        let src = HostPageSource::new();
        assert!(src.ensure_present(0x0000_2200_0000_0000, Granularity::Small).is_err());
    }
}
