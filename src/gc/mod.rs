//! On-the-fly concurrent mark-and-sweep collector: colour
//! flip, write barrier, four handshakes, root snapshot, mark, sweep and the
//! conductor that sequences a cycle end to end.

pub mod barrier;
pub mod conductor;
pub mod mark;
pub mod stats;
pub mod sweep;

use crate::header::Shade;
use crate::heap::Heap;
use crate::scheduler::safepoint::ThreadState;
use crate::scheduler::{Scheduler, ThreadControlBlock};
use conductor::Conductor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use barrier::gc_update;

/// Runtime-global roots that exist outside any thread's shadow stack, such
/// as the corelib root handle, seeded into the mark stack at every cycle.
pub struct GlobalRoots {
    roots: Mutex<Vec<usize>>,
}

impl GlobalRoots {
    pub fn new() -> Self {
        Self { roots: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, object: usize) {
        self.roots.lock().push(object);
    }
}

impl Default for GlobalRoots {
    fn default() -> Self {
        Self::new()
    }
}

/// The collector: owns the colour-flip state, the mark stack, the
/// conductor gate and the cycle statistics. One instance per heap.
pub struct Collector {
    heap: Arc<Heap>,
    scheduler: Arc<Scheduler>,
    /// Which of `Shade0`/`Shade1` currently means "white" (unproven live
    /// this cycle). Flipped at handshake 3.
    white: AtomicU8,
    mark_stack: Mutex<Vec<usize>>,
    pub global_roots: GlobalRoots,
    pub stats: stats::GcStats,
    conductor: Conductor,
}

impl Collector {
    pub fn new(heap: Arc<Heap>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            heap,
            scheduler,
            white: AtomicU8::new(Shade::Shade1 as u8),
            mark_stack: Mutex::new(Vec::new()),
            global_roots: GlobalRoots::new(),
            stats: stats::GcStats::new(),
            conductor: Conductor::new(),
        })
    }

    /// The shade new allocations are stamped with right now -- "born black".
    pub fn current_black(&self) -> Shade {
        self.current_white().other()
    }

    pub fn current_white(&self) -> Shade {
        Shade::from_raw(self.white.load(Ordering::Acquire))
    }

    /// `gc_wake()`: ask for a cycle without waiting for it.
    pub fn gc_wake(&self) {
        self.conductor.wake();
    }

    /// `gc_wait()`: ask for a cycle and block until it (or a newer one) has
    /// completed. The caller is marked `Parked` for the duration: it is
    /// genuinely not touching the heap while blocked here, so a handshake
    /// that reaches it while it waits must treat it as already stopped
    /// rather than waiting on a `poll()` call this thread has no chance to
    /// make.
    pub fn gc_wait(&self, tcb: &Arc<ThreadControlBlock>) {
        let prior = tcb.state.swap(ThreadState::Parked, Ordering::AcqRel);
        self.conductor.wait();
        tcb.state.store(prior, Ordering::Release);
    }

    /// Spawn the dedicated collector thread: parks on `gc_wake`, runs one
    /// full cycle per wakeup, forever. The returned handle is owned by the
    /// caller (typically never joined -- the collector outlives every
    /// mutator).
    pub fn spawn_conductor_thread(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let collector = self.clone();
        std::thread::spawn(move || loop {
            collector.conductor.park_until_woken();
            collector.run_cycle();
            collector.conductor.finish_cycle();
        })
    }

    /// Run one full cycle: the four handshakes, mark, sweep, prepare. See
    /// `DESIGN.md` for the decision to keep the handshake count at four and
    /// on per-thread vs. bulk suspend/resume.
    fn run_cycle(&self) {
        let threshold = self.heap.config().handshake_stall_warn_threads;
        let threads = self.scheduler.thread_count();
        if threads > threshold {
            log::warn!(
                "gc: {} mutator threads to handshake this cycle (warn threshold {}); each handshake serialises on every thread in turn",
                threads,
                threshold
            );
        }

        self.handshake_start_snoop();
        self.handshake_start_tracing();
        self.handshake_harvest_snapshot();

        let white = self.current_white();
        mark::run(&self.mark_stack, white, &self.stats);

        self.handshake_stop_tracing();

        {
            // Sweep runs under `lock_all_threads`, serialising
            // only with thread creation -- concurrent allocation
            // is untouched, since the heap's all-objects list excision is
            // already lock-free.
            let _all_threads = self.scheduler.lock_all_threads();
            sweep::run(&self.heap, white, &self.stats);
        }
        self.stats.complete_cycle();

        self.prepare();
    }

    fn handshake_start_snoop(&self) {
        self.scheduler.for_each_thread(|t| {
            self.scheduler.suspend(t);
            t.gc.snoop.store(true, Ordering::Release);
            self.scheduler.resume(t);
        });
    }

    fn handshake_start_tracing(&self) {
        self.scheduler.for_each_thread(|t| {
            self.scheduler.suspend(t);
            t.gc.trace_on.store(true, Ordering::Release);
            self.scheduler.resume(t);
        });
    }

    fn handshake_harvest_snapshot(&self) {
        let old_white = self.current_white();
        let new_black = old_white;
        let new_white = old_white.other();
        self.white.store(new_white as u8, Ordering::Release);

        self.scheduler.for_each_thread(|t| {
            self.scheduler.suspend(t);
            t.gc.alloc_color.store(new_black as u8, Ordering::Release);
            t.gc.snoop.store(false, Ordering::Release);
            let drained: Vec<usize> = t.gc.snooped.lock().drain().collect();
            self.mark_stack.lock().extend(drained);

            // Walk this thread's shadow stack while it sits parked at the
            // safepoint: every non-null object slot across
            // every frame is a root, same as the snooped set above.
            let mut frame_roots = Vec::new();
            unsafe {
                crate::shadow_stack::walk(&t.shadow_stack, |frame| {
                    for i in 0..frame.object_count {
                        let slot = frame.object_slot(i).load(Ordering::Acquire);
                        if !slot.is_null() {
                            frame_roots.push(slot as usize);
                        }
                    }
                });
            }
            self.mark_stack.lock().extend(frame_roots);

            self.scheduler.resume(t);
        });

        let globals = self.global_roots.roots.lock().clone();
        self.mark_stack.lock().extend(globals);
    }

    fn handshake_stop_tracing(&self) {
        self.scheduler.for_each_thread(|t| {
            self.scheduler.suspend(t);
            t.gc.trace_on.store(false, Ordering::Release);
            self.scheduler.resume(t);
        });
    }

    /// Per-thread log buffer entries each refer to an object; clear the
    /// object's log pointer, then clear the buffer.
    /// No handshake needed here: `trace_on` is already false on every
    /// thread, so the write barrier cannot be mid-publish against a buffer
    /// this call is about to drain.
    fn prepare(&self) {
        self.scheduler.for_each_thread(|t| {
            let mut log = t.gc.log_buffer.lock();
            for entry in log.drain(..) {
                unsafe {
                    (&*(entry.header as *const crate::header::ObjectHeader)).clear_log_pointer();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::header::ObjectHeader;
    use crate::pagetable::HostPageSource;
    use crate::types::TypeDescriptor;
    use std::sync::atomic::AtomicPtr;

    const OFFSETS: &[usize] = &[0];

    fn test_collector() -> (Arc<Heap>, Arc<Scheduler>, Arc<Collector>) {
        let mut config = Config::default();
        config.cpu_count = 2;
        config.heap_base = Some(0x5000_0000_0000);
        let heap = Arc::new(Heap::init(config, Arc::new(HostPageSource::new())).unwrap());
        let scheduler = Arc::new(Scheduler::new());
        let collector = Collector::new(heap.clone(), scheduler.clone());
        (heap, scheduler, collector)
    }

    #[test]
    fn unreachable_object_is_collected_after_one_cycle() {
        let (heap, _scheduler, collector) = test_collector();
        let ty = TypeDescriptor::new(8, 8, OFFSETS, false);

        let garbage = heap.alloc(32, collector.current_black()).unwrap();
        unsafe { (*garbage).set_type_ptr(&ty as *const TypeDescriptor as *mut TypeDescriptor) };

        collector.run_cycle();

        unsafe {
            assert!((*garbage).is_free(), "unreachable object must be swept");
        }
    }

    #[test]
    fn rooted_object_and_its_referent_survive_a_cycle() {
        let (heap, _scheduler, collector) = test_collector();
        let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
        let ty_ptr = &ty as *const TypeDescriptor as *mut TypeDescriptor;

        let child = heap.alloc(32, collector.current_black()).unwrap();
        unsafe { (*child).set_type_ptr(ty_ptr) };

        let root = heap.alloc(32, collector.current_black()).unwrap();
        unsafe {
            (*root).set_type_ptr(ty_ptr);
            let field = ((*root).payload()) as *const AtomicPtr<u8>;
            (*field).store(child as *mut u8, Ordering::Relaxed);
        }
        collector.global_roots.register(root as usize);

        collector.run_cycle();

        unsafe {
            assert!(!(*root).is_free());
            assert!(!(*child).is_free(), "reachable referent must survive");
        }
    }

    #[test]
    fn write_barrier_pre_image_keeps_overwritten_referent_alive_through_the_cycle() {
        let (heap, scheduler, collector) = test_collector();
        // This thread plays the write-barrier-driving mutator, not the
        // collector -- it must not appear in the handshake loop below
        // (which this very test thread also drives), so unregister it
        // again right away while keeping its `ThreadControlBlock` to pass
        // into `gc_update` directly.
        let tcb = scheduler.attach_current_thread();
        scheduler.drop_current();
        let ty = TypeDescriptor::new(8, 8, OFFSETS, false);
        let ty_ptr = &ty as *const TypeDescriptor as *mut TypeDescriptor;

        let overwritten_child = heap.alloc(32, collector.current_black()).unwrap();
        unsafe { (*overwritten_child).set_type_ptr(ty_ptr) };

        let root = heap.alloc(32, collector.current_black()).unwrap();
        unsafe {
            (*root).set_type_ptr(ty_ptr);
            let field = ((*root).payload()) as *const AtomicPtr<u8>;
            (*field).store(overwritten_child as *mut u8, Ordering::Relaxed);
        }
        collector.global_roots.register(root as usize);

        // `tcb` was deliberately unregistered above so the handshake loops
        // (which this same thread drives) don't try to suspend themselves;
        // publish the flags the first two handshakes would have published
        // to it directly, then harvest the snapshot for real.
        tcb.gc.snoop.store(true, Ordering::Release);
        tcb.gc.trace_on.store(true, Ordering::Release);
        collector.handshake_harvest_snapshot();

        let white = collector.current_white();
        unsafe {
            gc_update(root, &ty, 0, std::ptr::null_mut(), &tcb, white, &heap);
        }

        mark::run(&collector.mark_stack, white, &collector.stats);
        collector.handshake_stop_tracing();
        sweep::run(&heap, white, &collector.stats);

        unsafe {
            assert!(
                !(*overwritten_child).is_free(),
                "object reachable only through the pre-mutation snapshot must survive"
            );
        }
    }
}
