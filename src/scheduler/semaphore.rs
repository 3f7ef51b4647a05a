//! Go-style semaphore: the single primitive every mutex,
//! condition variable and wait-handle in this crate is built from.
//!
//! Modelled on Go's `runtime/sema.go`: an atomic counter for the
//! uncontended fast path, and a contended path that parks the caller on an
//! explicit wait queue rather than spinning or busy-polling. Unlike a
//! textbook counting semaphore, a release does not simply increment the
//! counter for the next acquirer to observe -- it hands the token directly
//! to one waiter (FIFO or LIFO, `Config::semaphore_lifo`), which is what
//! gives the mutex built on top of this its livelock-free guarantee via
//! direct handoff.

use crate::scheduler::{Scheduler, ThreadControlBlock};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

struct Waiter {
    thread: Arc<ThreadControlBlock>,
    woken: Arc<std::sync::atomic::AtomicBool>,
}

/// A counting semaphore with direct ticket handoff and selectable wake
/// order.
pub struct Semaphore {
    value: AtomicIsize,
    lifo: bool,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl Semaphore {
    pub fn new(initial: isize, lifo: bool) -> Self {
        Self {
            value: AtomicIsize::new(initial),
            lifo,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Fast path: if a token is available, take it without touching the
    /// wait queue at all.
    fn try_acquire_fast(&self) -> bool {
        loop {
            let v = self.value.load(Ordering::Acquire);
            if v <= 0 {
                return false;
            }
            if self
                .value
                .compare_exchange(v, v - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Acquire one token, parking the caller on `scheduler` if none is
    /// immediately available. Direct handoff means a released token is
    /// only ever consumed by the waiter it was handed to or by a fast-path
    /// `try_acquire` that raced it -- never silently dropped on the floor.
    pub fn acquire(&self, scheduler: &Scheduler) {
        if self.try_acquire_fast() {
            return;
        }
        let tcb = scheduler.current().expect("acquire called with no attached thread");
        let woken = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let mut q = self.waiters.lock();
            // Re-check under the queue lock: a release may have landed
            // between the failed fast-path attempt and taking the lock.
            if self.try_acquire_fast() {
                return;
            }
            q.push_back(Waiter { thread: tcb.clone(), woken: woken.clone() });
        }
        while !woken.load(Ordering::Acquire) {
            scheduler.park(None::<()>);
        }
    }

    /// Try to acquire without blocking.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_fast()
    }

    /// Release one token, handing it directly to the next queued waiter
    /// (per `lifo`) if there is one, rather than merely incrementing the
    /// counter.
    pub fn release(&self) {
        let handed_off = {
            let mut q = self.waiters.lock();
            let next = if self.lifo { q.pop_back() } else { q.pop_front() };
            match next {
                Some(w) => {
                    w.woken.store(true, Ordering::Release);
                    w.thread.handle.unpark();
                    true
                }
                None => false,
            }
        };
        if !handed_off {
            self.value.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn available(&self) -> isize {
        self.value.load(Ordering::Acquire)
    }

    /// Hand a token to every currently queued waiter. Used by `CondVar`'s
    /// `notify_all`, where "wake everyone waiting right now" is the
    /// intended semantics rather than the usual single-ticket handoff.
    pub fn release_all(&self) {
        let woken = {
            let mut q = self.waiters.lock();
            std::mem::take(&mut *q)
        };
        for w in woken {
            w.woken.store(true, Ordering::Release);
            w.thread.handle.unpark();
        }
    }
}
