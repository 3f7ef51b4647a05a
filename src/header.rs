//! Object header.
//!
//! `+-----------------+-------------------------------------------------+`
//! `| type_ptr         | pointer to type descriptor; MUST be first word  |`
//! `| log_pointer      | pointer into owning thread's log buffer, or null|`
//! `| color_rank       | packed [color:2][rank:6]                        |`
//! `| next             | next in the global all-objects list (lock-free) |`
//! `| chunk_next       | intra-chunk free-list link                      |`
//! `+-----------------+-------------------------------------------------+`
//!
//! `color` and `rank` are bitpacked into one byte, the same way a
//! `size`/`marked` pair gets folded into one encoded byte elsewhere -- the
//! other fields stay full pointer width since they are genuinely pointers (the
//! first word must dereference as `*(type **)o`, so it cannot be
//! folded into a bitfield).

use crate::types::TypeDescriptor;
use modular_bitfield::prelude::*;
use std::mem::size_of;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// One of `black`/`white` (live-this-cycle bits, swapped each cycle) or
/// `blue` (slot is unallocated). Stored as a small integer so the GC's
/// colour flip at handshake 3 is a single atomic store, not a walk of every
/// object.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shade {
    /// Free slot -- returned to the heap's free pool.
    Blue = 0,
    Shade0 = 1,
    Shade1 = 2,
}

impl Shade {
    #[inline]
    pub fn from_raw(raw: u8) -> Shade {
        match raw {
            0 => Shade::Blue,
            1 => Shade::Shade0,
            2 => Shade::Shade1,
            _ => unreachable!("color_rank bitfield only ever stores 0..=2"),
        }
    }

    #[inline]
    pub fn other(self) -> Shade {
        match self {
            Shade::Shade0 => Shade::Shade1,
            Shade::Shade1 => Shade::Shade0,
            Shade::Blue => Shade::Blue,
        }
    }
}

#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
struct ColorRank {
    color: B2,
    rank: B6,
}

/// Maximum size-class rank a 6-bit field can encode; this heap uses 26
/// pools, well under this.
pub const MAX_RANK: usize = (1 << 6) - 1;

#[repr(C)]
pub struct ObjectHeader {
    /// Type descriptor pointer. Must stay the first field: the JIT and
    /// native code both dereference `*(type **)o` for dispatch.
    pub type_ptr: AtomicPtr<TypeDescriptor>,
    /// Pointer into the owning thread's log buffer. Non-null means this
    /// object is "dirty" -- its managed-pointer snapshot was captured this
    /// cycle. Published with release ordering by the write barrier and read
    /// with acquire ordering by tracing.
    log_pointer: AtomicPtr<u8>,
    color_rank: AtomicU8,
    /// Next link in the global all-objects singly linked list. Lock-free:
    /// pushed with a CAS on the list head, excised by sweep with
    /// CAS-at-head-then-refind-on-contention.
    pub next: AtomicPtr<ObjectHeader>,
    /// Next link in the intra-lock-region free list. Only ever touched while
    /// the owning lock region's spinlock is held, so a plain cell suffices.
    chunk_next: std::cell::UnsafeCell<*mut ObjectHeader>,
}

// `chunk_next` is only mutated under the owning heap lock region's spinlock;
// every other field is already safely shared via atomics.
unsafe impl Sync for ObjectHeader {}

impl ObjectHeader {
    pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();

    /// Initialise a header in place for a freshly-backed (but still unused)
    /// slot: colour blue, rank set, everything else cleared.
    ///
    /// # Safety
    /// `at` must point to at least `size_of::<ObjectHeader>()` writable
    /// bytes that outlive the slot's lifetime in the heap.
    pub unsafe fn init_free(at: *mut ObjectHeader, rank: usize) {
        debug_assert!(rank <= MAX_RANK);
        let mut cr = ColorRank::new();
        cr.set_color(Shade::Blue as u8);
        cr.set_rank(rank as u8);
        (*at).type_ptr = AtomicPtr::new(std::ptr::null_mut());
        (*at).log_pointer = AtomicPtr::new(std::ptr::null_mut());
        (*at).color_rank = AtomicU8::new(cr.into_bytes()[0]);
        (*at).next = AtomicPtr::new(std::ptr::null_mut());
        *(*at).chunk_next.get() = std::ptr::null_mut();
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + size_of::<Self>()) as *mut u8
    }

    #[inline(always)]
    pub fn from_payload(payload: *mut u8) -> *mut ObjectHeader {
        (payload as usize - size_of::<ObjectHeader>()) as *mut ObjectHeader
    }

    #[inline(always)]
    pub fn color(&self) -> Shade {
        let raw = self.color_rank.load(Ordering::Acquire);
        Shade::from_raw(ColorRank::from_bytes([raw]).color())
    }

    #[inline]
    pub fn set_color(&self, shade: Shade) {
        let rank = self.rank();
        let mut cr = ColorRank::new();
        cr.set_color(shade as u8);
        cr.set_rank(rank as u8);
        self.color_rank.store(cr.into_bytes()[0], Ordering::Release);
    }

    /// Atomically mark `blue` -> `shade` if and only if currently blue.
    /// Used by the allocator so two racing cores can never both claim the
    /// same slot.
    #[inline]
    pub fn try_claim(&self, shade: Shade) -> bool {
        let rank = self.rank();
        let mut from = ColorRank::new();
        from.set_color(Shade::Blue as u8);
        from.set_rank(rank as u8);
        let mut to = ColorRank::new();
        to.set_color(shade as u8);
        to.set_rank(rank as u8);
        self.color_rank
            .compare_exchange(
                from.into_bytes()[0],
                to.into_bytes()[0],
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline(always)]
    pub fn rank(&self) -> usize {
        let raw = self.color_rank.load(Ordering::Relaxed);
        ColorRank::from_bytes([raw]).rank() as usize
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.color() == Shade::Blue
    }

    #[inline(always)]
    pub fn log_pointer(&self) -> *mut u8 {
        self.log_pointer.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_log_pointer(&self, ptr: *mut u8) {
        self.log_pointer.store(ptr, Ordering::Release);
    }

    /// Double-checked compare-and-swap from null used by the write barrier
    ///: only the first writer for a given cycle actually
    /// publishes a log pointer for this object.
    #[inline(always)]
    pub fn try_publish_log_pointer(&self, ptr: *mut u8) -> bool {
        self.log_pointer
            .compare_exchange(std::ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline(always)]
    pub fn clear_log_pointer(&self) {
        self.log_pointer.store(std::ptr::null_mut(), Ordering::Release);
    }

    #[inline(always)]
    pub fn type_ptr(&self) -> *mut TypeDescriptor {
        self.type_ptr.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_type_ptr(&self, ty: *mut TypeDescriptor) {
        self.type_ptr.store(ty, Ordering::Release);
    }

    /// # Safety
    /// Caller must hold the owning lock region's spinlock.
    #[inline(always)]
    pub unsafe fn chunk_next(&self) -> *mut ObjectHeader {
        *self.chunk_next.get()
    }

    /// # Safety
    /// Caller must hold the owning lock region's spinlock.
    #[inline(always)]
    pub unsafe fn set_chunk_next(&self, next: *mut ObjectHeader) {
        *self.chunk_next.get() = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_rank_roundtrip() {
        let mut backing = [0u8; size_of::<ObjectHeader>()];
        let hdr = backing.as_mut_ptr() as *mut ObjectHeader;
        unsafe {
            ObjectHeader::init_free(hdr, 7);
            assert!((*hdr).is_free());
            assert_eq!((*hdr).rank(), 7);
            (*hdr).set_color(Shade::Shade0);
            assert_eq!((*hdr).color(), Shade::Shade0);
            assert_eq!((*hdr).rank(), 7, "set_color must not disturb rank");
        }
    }

    #[test]
    fn try_claim_only_succeeds_once() {
        let mut backing = [0u8; size_of::<ObjectHeader>()];
        let hdr = backing.as_mut_ptr() as *mut ObjectHeader;
        unsafe {
            ObjectHeader::init_free(hdr, 0);
            assert!((*hdr).try_claim(Shade::Shade1));
            assert!(!(*hdr).try_claim(Shade::Shade1));
            assert_eq!((*hdr).color(), Shade::Shade1);
        }
    }

    #[test]
    fn log_pointer_publishes_once() {
        let mut backing = [0u8; size_of::<ObjectHeader>()];
        let hdr = backing.as_mut_ptr() as *mut ObjectHeader;
        unsafe {
            ObjectHeader::init_free(hdr, 0);
            let mut a = 1u8;
            let mut b = 2u8;
            assert!((*hdr).try_publish_log_pointer(&mut a as *mut u8));
            assert!(!(*hdr).try_publish_log_pointer(&mut b as *mut u8));
            assert_eq!((*hdr).log_pointer(), &mut a as *mut u8);
        }
    }
}
