//! GC conductor gate: a single GC thread parks
//! on `gc_wake`; mutators call [`Conductor::wake`] (async request) or
//! [`Conductor::wait`] (synchronous: request, then block on `gc_done`).
//! `running` flag + mutex + two condition variables, the classic
//! one-producer/many-consumer gate, repurposed here for cycle sequencing
//! instead of thread suspension.

use parking_lot::{Condvar, Mutex};

struct State {
    wake_requested: bool,
    running: bool,
    generation: u64,
}

pub struct Conductor {
    state: Mutex<State>,
    cv_wake: Condvar,
    cv_done: Condvar,
}

impl Conductor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { wake_requested: false, running: false, generation: 0 }),
            cv_wake: Condvar::new(),
            cv_done: Condvar::new(),
        }
    }

    /// `gc_wake()`: request a cycle without waiting for it to finish.
    /// Idempotent -- a request arriving while one is already pending (or
    /// running) just collapses into that cycle.
    pub fn wake(&self) {
        let mut s = self.state.lock();
        s.wake_requested = true;
        self.cv_wake.notify_one();
    }

    /// `gc_wait()`: request a cycle and block until a cycle that started at
    /// or after this call has completed.
    pub fn wait(&self) {
        let mut s = self.state.lock();
        let target_generation = s.generation + 1;
        s.wake_requested = true;
        self.cv_wake.notify_one();
        while s.generation < target_generation {
            self.cv_done.wait(&mut s);
        }
    }

    /// Called only by the conductor thread: block until a cycle has been
    /// requested, then mark one running.
    pub fn park_until_woken(&self) {
        let mut s = self.state.lock();
        while !s.wake_requested {
            self.cv_wake.wait(&mut s);
        }
        s.wake_requested = false;
        s.running = true;
    }

    /// Called only by the conductor thread, after sweep and prepare.
    pub fn finish_cycle(&self) {
        let mut s = self.state.lock();
        s.running = false;
        s.generation += 1;
        self.cv_done.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

impl Default for Conductor {
    fn default() -> Self {
        Self::new()
    }
}
