//! Cooperative scheduler.
//!
//! Pentagon's scheduler multiplexes managed goroutines onto a small number
//! of OS threads. This hosted crate keeps the documented contract --
//! `ready`/`park`/`yield_now`/`schedule`/`drop_current`/`suspend`/`resume`/
//! `wake_poller`, a nestable preemption-disable counter, and the four-
//! handshake safepoint protocol the GC drives -- but maps each scheduled
//! unit directly onto one OS thread rather than onto a stack-switching
//! green-thread runtime -- mutators are OS threads here too. Real stack
//! switching and the JIT-emitted safepoint checks belong to the JIT/runtime
//! glue component, out of scope.

pub mod safepoint;
pub mod semaphore;
pub mod mutex;

use crate::header::Shade;
use crate::shadow_stack::ShadowStackTop;
use parking_lot::{Condvar, Mutex as PMutex};
use safepoint::{GlobalSafepoint, ThreadState};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::Thread;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread control block: carries the
/// scheduler's bookkeeping plus the GC's `gc_local_data`.
pub struct ThreadControlBlock {
    pub id: u64,
    pub handle: Thread,
    pub state: safepoint::AtomicThreadState,
    preempt_disable: Cell<u32>,
    pub gc: GcLocalData,
    /// Top of this thread's shadow-stack chain. Lives on the
    /// TCB rather than a `thread_local!` so the GC conductor can walk it
    /// while this thread sits parked at a safepoint.
    pub shadow_stack: ShadowStackTop,
}

unsafe impl Sync for ThreadControlBlock {}

impl ThreadControlBlock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            handle: std::thread::current(),
            state: safepoint::AtomicThreadState::new(ThreadState::Running),
            preempt_disable: Cell::new(0),
            gc: GcLocalData::new(),
            shadow_stack: ShadowStackTop::new(),
        })
    }

    /// Nestable: true while any enclosing `disable_preemption` guard is
    /// live on this thread.
    pub fn preemption_disabled(&self) -> bool {
        self.preempt_disable.get() > 0
    }
}

/// One write-barrier log entry: the pre-image of an object's managed
/// pointer fields, captured before the mutation that triggered the
/// barrier.
pub struct LogEntry {
    pub header: usize,
    pub snapshot: Box<[usize]>,
}

/// The GC's per-thread state, carried on the `ThreadControlBlock`: the
/// thread's fields plus snooping and the write-barrier log.
pub struct GcLocalData {
    /// Colour this thread stamps onto objects it allocates this cycle
    /// (`Shade0`/`Shade1`, flipped at the harvest-snapshot handshake).
    pub alloc_color: std::sync::atomic::AtomicU8,
    /// True between the start-tracing and stop-tracing handshakes: the
    /// write barrier only logs while this is set.
    pub trace_on: std::sync::atomic::AtomicBool,
    /// True between the start-snoop and harvest-snapshot handshakes:
    /// roots read by this thread are snooped into `snooped` instead of
    /// being scanned directly off the native stack.
    pub snoop: std::sync::atomic::AtomicBool,
    pub log_buffer: PMutex<Vec<LogEntry>>,
    pub snooped: PMutex<std::collections::HashSet<usize>>,
}

impl GcLocalData {
    pub fn new() -> Self {
        Self {
            alloc_color: std::sync::atomic::AtomicU8::new(Shade::Shade0 as u8),
            trace_on: std::sync::atomic::AtomicBool::new(false),
            snoop: std::sync::atomic::AtomicBool::new(false),
            log_buffer: PMutex::new(Vec::new()),
            snooped: PMutex::new(std::collections::HashSet::new()),
        }
    }
}

impl Default for GcLocalData {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: Cell<Option<Arc<ThreadControlBlock>>> = Cell::new(None);
}

fn with_current_opt<R>(f: impl FnOnce(Option<&Arc<ThreadControlBlock>>) -> R) -> R {
    CURRENT.with(|c| {
        let taken = c.take();
        let result = f(taken.as_ref());
        c.set(taken);
        result
    })
}

/// RAII guard returned by [`disable_preemption`]: decrements the nestable
/// counter on drop.
pub struct PreemptionGuard {
    _private: (),
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        with_current_opt(|tcb| {
            if let Some(tcb) = tcb {
                let n = tcb.preempt_disable.get();
                debug_assert!(n > 0);
                tcb.preempt_disable.set(n - 1);
            }
        });
    }
}

/// Disable preemption on the current thread for the lifetime of the
/// returned guard. Must wrap every heap allocation, the entire write
/// barrier, and any page-table edit.
#[must_use]
pub fn disable_preemption() -> PreemptionGuard {
    with_current_opt(|tcb| {
        if let Some(tcb) = tcb {
            tcb.preempt_disable.set(tcb.preempt_disable.get() + 1);
        }
    });
    PreemptionGuard { _private: () }
}

/// The scheduler: thread registry and the safepoint machinery the GC
/// drives for its handshakes. Each managed unit maps onto one OS thread
/// (see the module doc comment), so there is no run queue to speak of --
/// `ready`/`schedule` reduce to exactly the OS primitive that scheduling
/// decision rides on: `Thread::unpark`/`yield_now`.
pub struct Scheduler {
    threads: PMutex<Vec<Arc<ThreadControlBlock>>>,
    pub safepoint: GlobalSafepoint,
    poller_cv: Condvar,
    poller_lock: PMutex<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            threads: PMutex::new(Vec::new()),
            safepoint: GlobalSafepoint::new(),
            poller_cv: Condvar::new(),
            poller_lock: PMutex::new(()),
        }
    }

    /// Register the calling OS thread as a new managed thread, created
    /// ready.
    pub fn attach_current_thread(&self) -> Arc<ThreadControlBlock> {
        let tcb = ThreadControlBlock::new();
        self.threads.lock().push(tcb.clone());
        CURRENT.with(|c| c.set(Some(tcb.clone())));
        tcb
    }

    pub fn current(&self) -> Option<Arc<ThreadControlBlock>> {
        with_current_opt(|tcb| tcb.cloned())
    }

    /// Transition `t` from parked to runnable and wake its OS thread.
    pub fn ready(&self, t: &Arc<ThreadControlBlock>) {
        t.state.store(ThreadState::Runnable, Ordering::Release);
        t.handle.unpark();
    }

    /// Park the current thread. If `release_lock` is provided it is
    /// dropped only after the thread is registered as parked, making
    /// park-then-unlock atomic the way the semaphore's acquire path needs it.
    pub fn park<T>(&self, release_lock: Option<T>) {
        if let Some(tcb) = self.current() {
            tcb.state.store(ThreadState::Parked, Ordering::Release);
        }
        drop(release_lock);
        std::thread::park();
        if let Some(tcb) = self.current() {
            tcb.state.store(ThreadState::Running, Ordering::Release);
        }
    }

    /// Cooperatively yield the rest of this time slice.
    pub fn yield_now(&self) {
        std::thread::yield_now();
    }

    /// Give up the rest of the current thread's time slice (used after a
    /// direct-handoff release so the woken waiter gets first crack at it).
    pub fn schedule(&self) {
        self.yield_now();
    }

    /// Thread exit: unregister and drop the TCB.
    pub fn drop_current(&self) {
        if let Some(tcb) = self.current() {
            self.threads.lock().retain(|t| t.id != tcb.id);
        }
        CURRENT.with(|c| c.set(None));
    }

    /// Block the caller until `t` reaches the next safepoint, returning a
    /// token `resume` needs. Used by the GC's four handshakes.
    pub fn suspend(&self, t: &Arc<ThreadControlBlock>) {
        self.safepoint.request_one(t);
    }

    pub fn resume(&self, t: &Arc<ThreadControlBlock>) {
        self.safepoint.release_one(t);
    }

    pub fn for_each_thread(&self, mut f: impl FnMut(&Arc<ThreadControlBlock>)) {
        for t in self.threads.lock().iter() {
            f(t);
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Hold the all-threads list lock for the duration of the guard. Sweep
    /// runs under this lock, which exists only to
    /// serialise sweep with thread creation (`attach_current_thread`/
    /// `drop_current` both take this same lock) -- not with concurrent
    /// allocation, which the heap's lock-free all-objects list already
    /// tolerates on its own.
    pub fn lock_all_threads(&self) -> parking_lot::MutexGuard<'_, Vec<Arc<ThreadControlBlock>>> {
        self.threads.lock()
    }

    /// Wake the timer-waitable poller so it can re-evaluate deadlines no
    /// later than `deadline_micros` from now.
    pub fn wake_poller(&self, _deadline_micros: u64) {
        let _g = self.poller_lock.lock();
        self.poller_cv.notify_all();
    }

    pub fn wait_poller(&self, timeout: std::time::Duration) {
        let mut g = self.poller_lock.lock();
        self.poller_cv.wait_for(&mut g, timeout);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
