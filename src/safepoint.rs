//! Stop-the-world coordination.
//!
//! Mutators enter Busy through a seq-cst increment of the global busy
//! counter, re-checking the `stopping` flag after the increment; the
//! collector publishes `stopping` with a seq-cst store before waiting for
//! the counter to drain. The pairing forbids a thread slipping into Busy
//! unseen.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atomic::Atomic;
use parking_lot::{Condvar, Mutex};

use crate::mutator::ThreadState;

pub struct GlobalSafepoint {
    stopping: AtomicBool,
    busy: AtomicUsize,
    mutex: Mutex<()>,
    /// Collector waits here for the busy count to reach zero.
    cv_stopped: Condvar,
    /// Threads in Wait sleep here until the world resumes.
    cv_resume: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            stopping: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            mutex: Mutex::new(()),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
        }
    }

    #[inline(always)]
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Idle -> Busy. Backs out and parks in Wait while a stop is pending.
    pub fn enter_busy(&self, state: &Atomic<ThreadState>) {
        loop {
            self.busy.fetch_add(1, Ordering::SeqCst);
            if !self.stopping.load(Ordering::SeqCst) {
                state.store(ThreadState::Busy, Ordering::Release);
                return;
            }
            self.leave_and_notify();
            self.park(state);
        }
    }

    /// Busy -> Idle.
    pub fn exit_busy(&self, state: &Atomic<ThreadState>) {
        state.store(ThreadState::Idle, Ordering::Release);
        self.leave_and_notify();
    }

    /// Cooperative yield from inside Busy: hand the busy token back, wait
    /// for the resume broadcast, then re-enter.
    #[cold]
    pub fn yield_to_collector(&self, state: &Atomic<ThreadState>) {
        self.leave_and_notify();
        self.park(state);
        loop {
            self.busy.fetch_add(1, Ordering::SeqCst);
            if !self.stopping.load(Ordering::SeqCst) {
                state.store(ThreadState::Busy, Ordering::Release);
                return;
            }
            self.leave_and_notify();
            self.park(state);
        }
    }

    fn leave_and_notify(&self) {
        if self.busy.fetch_sub(1, Ordering::SeqCst) == 1 && self.stopping.load(Ordering::SeqCst) {
            let _g = self.mutex.lock();
            self.cv_stopped.notify_one();
        }
    }

    fn park(&self, state: &Atomic<ThreadState>) {
        let mut g = self.mutex.lock();
        state.store(ThreadState::Wait, Ordering::Release);
        while self.stopping.load(Ordering::SeqCst) {
            self.cv_resume.wait(&mut g);
        }
    }

    /// Collector side: request a stop and wait until no thread is Busy.
    pub fn stop_the_world(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut g = self.mutex.lock();
        while self.busy.load(Ordering::SeqCst) != 0 {
            self.cv_stopped.wait(&mut g);
        }
    }

    /// Collector side: release the stop and wake every parked thread.
    pub fn resume_the_world(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        let _g = self.mutex.lock();
        self.cv_resume.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }
}
