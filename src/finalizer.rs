//! The decref queue.
//!
//! Release callbacks for foreign buffers run on a dedicated worker, never on
//! a GC thread: user-supplied release code may take arbitrary time or locks.
//! The queue starts bounded and grows; producers never block beyond the
//! mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::cell::{Cell, Foreign, RefctFn, TAG_FOREIGN};

const INITIAL_QUEUE_CAP: usize = 256;

pub struct DecrefQueue {
    inner: Mutex<VecDeque<(RefctFn, *mut u8)>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

unsafe impl Send for DecrefQueue {}
unsafe impl Sync for DecrefQueue {}

impl DecrefQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(INITIAL_QUEUE_CAP)),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn push(&self, callback: RefctFn, arg: *mut u8) {
        let mut q = self.inner.lock();
        q.push_back((callback, arg));
        self.cv.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Worker body. Returns once shutdown is flagged and the queue drained.
    pub fn worker_loop(&self) {
        loop {
            let job = {
                let mut q = self.inner.lock();
                loop {
                    if let Some(job) = q.pop_front() {
                        break Some(job);
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    self.cv.wait(&mut q);
                }
            };
            match job {
                Some((callback, arg)) => unsafe { callback(arg, false) },
                None => return,
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _g = self.inner.lock();
        self.cv.notify_all();
    }
}

/// Take an extra reference on a foreign pin. Runs the callback inline.
///
/// # Safety
/// `pin` must be a live FOREIGN cell.
pub unsafe fn incref(pin: *mut Cell) {
    debug_assert_eq!((*pin).header.tag, TAG_FOREIGN);
    let f = pin as *mut Foreign;
    ((*f).release)((*f).ptr, true);
}

/// Drop a reference on a foreign pin. Always routed through the queue so
/// release code cannot reenter the caller.
///
/// # Safety
/// `pin` must be a live FOREIGN cell.
pub unsafe fn decref(queue: &DecrefQueue, pin: *mut Cell) {
    debug_assert_eq!((*pin).header.tag, TAG_FOREIGN);
    let f = pin as *mut Foreign;
    queue.push((*f).release, (*f).ptr);
}
