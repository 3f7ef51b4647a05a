//! Managed-code wait-handle surface: `CreateWaitable`/`ReleaseWaitable`/`WaitableSend`/`WaitableWait`/
//! `WaitableSelect2`/`WaitableAfter`. Every managed `WaitHandle`, mutex and
//! condition variable binds to these six native symbols by name; they are
//! the only door between managed code and [`crate::scheduler::semaphore`].
//!
//! Handles are opaque `u64`s, not pointers -- the JIT passes them across the
//! managed/native boundary as plain integers, the usual shape for an
//! external-call table handing out handle-like resources.

use crate::config::Config;
use crate::scheduler::semaphore::Semaphore;
use crate::scheduler::Scheduler;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Whether a freshly created waitable queues its waiters LIFO instead of
/// FIFO (`Config::semaphore_lifo`). Process-wide rather than threaded
/// through every `CreateWaitable` call, because the corelib's handle table
/// is itself process-wide: one managed runtime instance picks one
/// wake-order policy for every `WaitHandle` it creates.
static DEFAULT_LIFO: AtomicBool = AtomicBool::new(false);

/// Apply a runtime [`Config`] to the corelib surface. Only `semaphore_lifo`
/// is consumed here; call once during startup, before any managed code
/// calls `CreateWaitable`.
pub fn configure(cfg: &Config) {
    DEFAULT_LIFO.store(cfg.semaphore_lifo, Ordering::Release);
}

/// `WaitableWait`/`WaitableSelect2` return codes. `WaitableWait`
/// and `WaitableSelect2` are independent native calls with independently
/// documented conventions, not a shared enum -- see the Open Questions note
/// in `DESIGN.md` for why `WaitableSelect2`'s third code means something
/// different from `WaitableWait`'s.
pub const WAIT_CLOSED: i32 = 0;
pub const WAIT_SPURIOUS: i32 = 1;
pub const WAIT_RECEIVED: i32 = 2;

struct Waitable {
    sem: Semaphore,
    closed: AtomicBool,
}

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<u64, Arc<Waitable>>> = Mutex::new(HashMap::new());
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn lookup(handle: u64) -> Option<Arc<Waitable>> {
    REGISTRY.lock().get(&handle).cloned()
}

/// `CreateWaitable(count) -> u64`: a counted semaphore with `count` permits
/// already available.
pub fn create_waitable(count: isize) -> u64 {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    let waitable = Arc::new(Waitable {
        sem: Semaphore::new(count, DEFAULT_LIFO.load(Ordering::Acquire)),
        closed: AtomicBool::new(false),
    });
    REGISTRY.lock().insert(handle, waitable);
    handle
}

/// `ReleaseWaitable(u64)`: close the handle. Every thread currently blocked
/// in `WaitableWait` on it wakes with [`WAIT_CLOSED`]; the handle itself is
/// dropped from the registry once the last reference (a blocked waiter may
/// still hold its own `Arc`) goes away.
pub fn release_waitable(handle: u64) {
    if let Some(w) = REGISTRY.lock().remove(&handle) {
        w.closed.store(true, Ordering::Release);
        w.sem.release_all();
    }
}

/// `WaitableSend(handle, block) -> bool`: deliver one permit. The semaphore
/// is unbounded, so a send can only fail if the handle has already been
/// closed; `block` is accepted for ABI parity with the native symbol table
/// but never actually blocks.
pub fn waitable_send(handle: u64, _block: bool) -> bool {
    match lookup(handle) {
        Some(w) if !w.closed.load(Ordering::Acquire) => {
            w.sem.release();
            true
        }
        _ => false,
    }
}

/// `WaitableWait(handle, block) -> int`.
pub fn waitable_wait(handle: u64, block: bool, scheduler: &Scheduler) -> i32 {
    let w = match lookup(handle) {
        Some(w) => w,
        None => return WAIT_CLOSED,
    };
    if w.closed.load(Ordering::Acquire) {
        return WAIT_CLOSED;
    }
    if block {
        w.sem.acquire(scheduler);
    } else if !w.sem.try_acquire() {
        return WAIT_SPURIOUS;
    }
    if w.closed.load(Ordering::Acquire) {
        WAIT_CLOSED
    } else {
        WAIT_RECEIVED
    }
}

/// `WaitableSelect2(a, b, block) -> int`: wait on whichever of two handles
/// is ready first. Implemented by polling both with `try_acquire` -- there
/// being no single OS primitive to wait on two semaphores at once, this is
/// the same compromise a userspace `select()` over counting semaphores
/// always makes. Returns `0` if `a` fired, `1` if `b` fired, `2` if neither
/// was ready and `block` was false.
pub fn waitable_select2(a: u64, b: u64, block: bool, scheduler: &Scheduler) -> i32 {
    loop {
        if let Some(w) = lookup(a) {
            if w.closed.load(Ordering::Acquire) || w.sem.try_acquire() {
                return 0;
            }
        }
        if let Some(w) = lookup(b) {
            if w.closed.load(Ordering::Acquire) || w.sem.try_acquire() {
                return 1;
            }
        }
        if !block {
            return 2;
        }
        scheduler.yield_now();
        std::thread::sleep(Duration::from_micros(50));
    }
}

struct PendingTimer {
    deadline: std::time::Instant,
    handle: u64,
}

/// The dedicated poller thread's own scheduler instance. It has no
/// mutators attached -- `wake_poller`/`wait_poller` are a self-contained
/// condvar pair on `Scheduler`, implementing `wake_poller(deadline)`'s
/// intent: timed waits are composed by a single poller
/// that re-evaluates its next wakeup whenever an earlier deadline is
/// registered, rather than one OS thread parked per timer.
struct Poller {
    scheduler: Scheduler,
    timers: Mutex<Vec<PendingTimer>>,
}

lazy_static! {
    static ref POLLER: Poller = {
        let poller = Poller { scheduler: Scheduler::new(), timers: Mutex::new(Vec::new()) };
        std::thread::spawn(poller_loop);
        poller
    };
}

/// Upper bound on how long the poller ever sleeps before re-checking its
/// timer list, even if a `wake_poller` notification is missed because it
/// landed before the poller had reached `wait_poller` for this round.
/// `wake_poller` only ever shortens the wait for a precise wakeup; this
/// cap is what keeps `WaitableAfter`'s latency bounded regardless of that
/// race.
const POLLER_MAX_WAIT: Duration = Duration::from_millis(50);

fn poller_loop() {
    loop {
        let now = std::time::Instant::now();
        let mut due = Vec::new();
        let wait_for = {
            let mut timers = POLLER.timers.lock();
            timers.retain(|t| {
                if t.deadline <= now {
                    due.push(t.handle);
                    false
                } else {
                    true
                }
            });
            timers.iter().map(|t| t.deadline - now).min()
        };
        for handle in due {
            waitable_send(handle, false);
        }
        POLLER.scheduler.wait_poller(wait_for.unwrap_or(POLLER_MAX_WAIT).min(POLLER_MAX_WAIT));
    }
}

/// `WaitableAfter(micros) -> u64`: a single-send waitable that delivers
/// exactly once, at or after `micros` microseconds from now.
pub fn waitable_after(micros: u64) -> u64 {
    let handle = create_waitable(0);
    let deadline = std::time::Instant::now() + Duration::from_micros(micros);
    POLLER.timers.lock().push(PendingTimer { deadline, handle });
    // Wake the poller in case it is currently sleeping on a later
    // deadline than the one just registered.
    POLLER.scheduler.wake_poller(micros);
    handle
}
