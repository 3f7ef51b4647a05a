//! Mutex and condition variable built on [`super::semaphore::Semaphore`]:
//! every lock in the managed-code surface funnels through here rather than
//! through the host OS's own mutex primitives.

use super::semaphore::Semaphore;
use crate::scheduler::Scheduler;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;
const LOCKED_CONTENDED: usize = 2;

/// A mutex with a two-state CAS fast path (uncontended lock/unlock never
/// touches the semaphore) and a LIFO-queued contended path, the same split
/// Go's own `sync.Mutex` makes over its semaphore.
pub struct Mutex<T> {
    state: AtomicUsize,
    sem: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    scheduler: &'a Scheduler,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicUsize::new(UNLOCKED),
            sem: Semaphore::new(0, true),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock<'a>(&'a self, scheduler: &'a Scheduler) -> MutexGuard<'a, T> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended(scheduler);
        }
        MutexGuard { mutex: self, scheduler }
    }

    fn lock_contended(&self, scheduler: &Scheduler) {
        loop {
            let prev = self.state.swap(LOCKED_CONTENDED, Ordering::Acquire);
            if prev == UNLOCKED {
                return;
            }
            self.sem.acquire(scheduler);
        }
    }

    fn unlock(&self) {
        match self.state.swap(UNLOCKED, Ordering::Release) {
            LOCKED => {}
            LOCKED_CONTENDED => self.sem.release(),
            UNLOCKED => unreachable!("unlock called on an already-unlocked mutex"),
            _ => unreachable!(),
        }
    }

    pub fn try_lock<'a>(&'a self, scheduler: &'a Scheduler) -> Option<MutexGuard<'a, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { mutex: self, scheduler })
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

/// A condition variable queued on the same semaphore machinery, following
/// the classic "release the mutex, park, reacquire" shape.
pub struct CondVar {
    sem: Semaphore,
}

impl CondVar {
    pub fn new() -> Self {
        Self { sem: Semaphore::new(0, false) }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        let scheduler = guard.scheduler;
        drop(guard);
        self.sem.acquire(scheduler);
        mutex.lock(scheduler)
    }

    pub fn notify_one(&self) {
        self.sem.release();
    }

    pub fn notify_all(&self) {
        self.sem.release_all();
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn uncontended_lock_unlock_round_trips() {
        let scheduler = Scheduler::new();
        scheduler.attach_current_thread();
        let mutex = Mutex::new(5);
        {
            let mut g = mutex.lock(&scheduler);
            *g += 1;
        }
        assert_eq!(*mutex.lock(&scheduler), 6);
    }

    #[test]
    fn contended_lock_serialises_increments() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.attach_current_thread();
        let mutex = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            let mutex = mutex.clone();
            handles.push(std::thread::spawn(move || {
                scheduler.attach_current_thread();
                for _ in 0..1000 {
                    *mutex.lock(&scheduler) += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock(&scheduler), 8000);
    }
}
