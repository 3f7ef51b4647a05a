//! Safepoint handshake machinery backing the collector's four handshakes.
//!
//! Generalised from "stop every thread at once" to a per-thread
//! `suspend(t)`/`resume(t)` shape. Each mutator thread
//! polls its own state at the points the JIT would emit a safepoint check
//! (allocation, backward branches, external calls); this hosted crate adds
//! one such poll to [`crate::mutator::Mutator::alloc`], the one allocation
//! entry point the JIT actually calls through.

use super::ThreadControlBlock;
use atomic::Atomic;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Split into a running and a parked track so a suspend request can tell
/// which wakeup path applies.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Runnable,
    Parked,
    /// Running, but the GC has asked it to stop at its next poll.
    SafepointRequested,
    /// Parked, but the GC has asked it to stay parked until released.
    ParkedSafepointRequested,
    /// Has acknowledged the request and is blocked in `poll`.
    Safepoint,
}

pub type AtomicThreadState = Atomic<ThreadState>;

/// One GC handshake driver. Only a single GC conductor ever drives
/// handshakes, so this does not need to support concurrent
/// suspend rounds from multiple callers.
pub struct GlobalSafepoint {
    mutex: Mutex<()>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
        }
    }

    /// Called by a mutator at one of its own safepoint-check points.
    /// Blocks here until the GC's matching `release_one` call if (and only
    /// if) a suspend is pending for this thread.
    pub fn poll(&self, t: &Arc<ThreadControlBlock>) {
        let requested = t.state.load(Ordering::Acquire);
        if requested != ThreadState::SafepointRequested {
            return;
        }
        t.state.store(ThreadState::Safepoint, Ordering::Release);
        let mut guard = self.mutex.lock();
        self.cv_stopped.notify_all();
        while t.state.load(Ordering::Acquire) == ThreadState::Safepoint {
            self.cv_resume.wait(&mut guard);
        }
    }

    /// Request that `t` stop at its next poll (or treat it as already
    /// stopped if it is currently parked), and block until it has. One of
    /// the GC's four handshakes.
    pub fn request_one(&self, t: &Arc<ThreadControlBlock>) {
        loop {
            let current = t.state.load(Ordering::Acquire);
            let target = match current {
                ThreadState::Running | ThreadState::Runnable => ThreadState::SafepointRequested,
                ThreadState::Parked => ThreadState::ParkedSafepointRequested,
                // Already requested or already stopped by a previous call
                // in this round -- nothing to do.
                ThreadState::SafepointRequested
                | ThreadState::ParkedSafepointRequested
                | ThreadState::Safepoint => return,
            };
            if t.state
                .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if current == ThreadState::Parked {
                    // A parked thread cannot poll until it wakes; treat the
                    // request itself as the acknowledgement.
                    return;
                }
                break;
            }
        }
        let mut guard = self.mutex.lock();
        while t.state.load(Ordering::Acquire) == ThreadState::SafepointRequested {
            self.cv_stopped.wait(&mut guard);
        }
    }

    /// Release a thread suspended by `request_one`. The other of the GC's
    /// four handshakes.
    pub fn release_one(&self, t: &Arc<ThreadControlBlock>) {
        let current = t.state.load(Ordering::Acquire);
        let resumed = match current {
            ThreadState::Safepoint => ThreadState::Running,
            ThreadState::ParkedSafepointRequested => ThreadState::Parked,
            // Never actually stopped (e.g. it exited between request and
            // release) -- nothing to release.
            _ => return,
        };
        t.state.store(resumed, Ordering::Release);
        let _guard = self.mutex.lock();
        self.cv_resume.notify_all();
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}
