//! The runtime: owns the allocator, the coordination state, the collector
//! threads and the public mutator-facing contract.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::barrier::{roots_slot_write, SnapshotStack};
use crate::cell::{Cell, RootsFinalizer};
use crate::collector::{self, MarkerPool, Trigger};
use crate::finalizer::DecrefQueue;
use crate::global_allocator::GlobalAllocator;
use crate::globals::MAX_GC_WORKERS;
use crate::marking::BufferStack;
use crate::mutator::{Mutator, MutatorRef, ThreadState};
use crate::roots::{RootList, RootSet, ROOTS_END};
use crate::safepoint::GlobalSafepoint;
use crate::util::ncpus;
use crate::value::Value;

/// Built-in root cells: the config root and the globals root.
#[repr(C)]
struct BuiltinRootsRec {
    slots: [AtomicU64; 2],
}

static BUILTIN_OFFSETS: [u16; 3] = [0, 1, ROOTS_END];

pub struct Runtime {
    pub(crate) allocator: GlobalAllocator,
    pub(crate) safepoint: GlobalSafepoint,
    pub(crate) roots: RootList,
    pub(crate) threads: Mutex<Vec<*mut Mutator>>,
    pub(crate) snapshots: SnapshotStack,
    pub(crate) mark_queue: BufferStack,
    pub(crate) finalizable: Mutex<Vec<*mut Cell>>,
    pub(crate) decref_queue: DecrefQueue,
    pub(crate) pool: MarkerPool,
    pub(crate) trigger: Trigger,
    pub(crate) gc_lock: Mutex<()>,
    pub(crate) mark_idle: AtomicUsize,
    pub(crate) roots_at_last_cycle: AtomicUsize,

    marking: AtomicBool,
    polarity: AtomicBool,
    cycle: AtomicU64,
    shutdown: AtomicBool,

    builtin_rec: Box<BuiltinRootsRec>,
    builtin_roots: AtomicPtr<RootSet>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

impl Runtime {
    /// Bring up the runtime: the GC trigger thread, the marker pool and the
    /// decref worker all start here.
    pub fn new() -> Arc<Runtime> {
        let workers = configured_workers();
        let rt = Arc::new(Runtime {
            allocator: GlobalAllocator::new(),
            safepoint: GlobalSafepoint::new(),
            roots: RootList::new(),
            threads: Mutex::new(Vec::new()),
            snapshots: SnapshotStack::new(),
            mark_queue: BufferStack::new(),
            finalizable: Mutex::new(Vec::new()),
            decref_queue: DecrefQueue::new(),
            pool: MarkerPool::new(workers),
            trigger: Trigger::new(),
            gc_lock: Mutex::new(()),
            mark_idle: AtomicUsize::new(0),
            roots_at_last_cycle: AtomicUsize::new(0),
            marking: AtomicBool::new(false),
            polarity: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            builtin_rec: Box::new(BuiltinRootsRec {
                slots: [AtomicU64::new(0), AtomicU64::new(0)],
            }),
            builtin_roots: AtomicPtr::new(null_mut()),
            handles: Mutex::new(Vec::new()),
        });

        unsafe {
            let base = rt.builtin_rec.slots.as_ptr() as *mut u8;
            let node = RootSet::new(
                base,
                BUILTIN_OFFSETS.as_ptr(),
                None,
                rt.polarity(),
                rt.cycle(),
            );
            let raw = rt.roots.push(node);
            rt.builtin_roots.store(raw, Ordering::Release);
        }

        let mut handles = rt.handles.lock();
        for i in 0..workers {
            let worker_rt = rt.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("glas-gc-mark-{}", i))
                    .spawn(move || collector::worker_main(worker_rt))
                    .expect("spawning mark worker"),
            );
        }
        let gc_rt = rt.clone();
        handles.push(
            std::thread::Builder::new()
                .name("glas-gc".into())
                .spawn(move || collector::gc_thread_main(gc_rt))
                .expect("spawning gc thread"),
        );
        let decref_rt = rt.clone();
        handles.push(
            std::thread::Builder::new()
                .name("glas-decref".into())
                .spawn(move || decref_rt.decref_queue.worker_loop())
                .expect("spawning decref worker"),
        );
        drop(handles);
        log::debug!("runtime up: {} mark workers", workers);
        rt
    }

    // -- cycle state -------------------------------------------------------

    #[inline(always)]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Relaxed)
    }

    /// Current scan polarity: a slot bit equal to this is "scanned".
    #[inline(always)]
    pub fn polarity(&self) -> bool {
        self.polarity.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    /// Under stop-the-world: advance the cycle counter, flip the scan
    /// polarity (everything becomes unscanned), activate marking.
    pub(crate) fn begin_cycle(&self) -> (u64, bool) {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let polarity = !self.polarity.load(Ordering::SeqCst);
        self.polarity.store(polarity, Ordering::SeqCst);
        self.marking.store(true, Ordering::SeqCst);
        (cycle, polarity)
    }

    pub(crate) fn end_marking(&self) {
        self.marking.store(false, Ordering::SeqCst);
    }

    pub(crate) fn note_cycle_end(&self) {
        self.roots_at_last_cycle
            .store(self.roots.registered.load(Ordering::Relaxed), Ordering::Relaxed);
        self.allocator.pages_released.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // -- mutator-facing contract -------------------------------------------

    /// Attach the calling thread. Every thread talks to the heap through
    /// the returned handle; dropping it detaches.
    pub fn attach_thread(self: &Arc<Runtime>) -> MutatorRef {
        let raw = Box::into_raw(Box::new(Mutator::new(self.clone())));
        self.threads.lock().push(raw);
        MutatorRef::from_raw(raw)
    }

    pub(crate) fn detach_thread(&self, m: *mut Mutator) {
        unsafe {
            let mut threads = self.threads.lock();
            threads.retain(|&p| p != m);
            let pending = std::mem::take(&mut *(*m).finalizers.get());
            if !pending.is_empty() {
                self.finalizable.lock().extend(pending);
            }
            let page = (*m).page.get();
            if !page.is_null() {
                self.allocator.release_owned(page, self.cycle());
            }
            (*m).state.store(ThreadState::Done, Ordering::Release);
            drop(threads);
            drop(Box::from_raw(m));
        }
    }

    /// Register a root structure. Must be called while Busy.
    ///
    /// # Safety
    /// See `RootSet::new`: the record and its offset array must stay valid
    /// until the finalizer runs.
    pub unsafe fn register_roots(
        &self,
        m: &Mutator,
        base: *mut u8,
        offsets: *const u16,
        finalizer: Option<RootsFinalizer>,
    ) -> *mut RootSet {
        debug_assert!(m.is_busy());
        let node = RootSet::new(base, offsets, finalizer, self.polarity(), self.cycle());
        self.roots.push(node)
    }

    /// Request a collection; wakes the GC thread immediately.
    pub fn trigger_gc(&self, full: bool) {
        let mut g = self.trigger.state.lock();
        g.requested = true;
        g.full |= full;
        self.trigger.cv.notify_one();
    }

    /// Run one whole collection cycle on the calling thread (which must not
    /// be Busy). Primarily for tests and deterministic shutdown points.
    pub fn gc_now(&self, full: bool) {
        collector::collect_cycle(self, full);
    }

    /// Route a foreign pin's release through the decref queue.
    ///
    /// # Safety
    /// `pin` must be a live FOREIGN cell.
    pub unsafe fn decref(&self, pin: *mut Cell) {
        crate::finalizer::decref(&self.decref_queue, pin);
    }

    // -- built-in roots ----------------------------------------------------

    pub fn set_config_root(&self, m: &Mutator, v: Value) {
        unsafe { roots_slot_write(m, self.builtin_roots.load(Ordering::Acquire), 0, v) }
    }

    pub fn set_globals_root(&self, m: &Mutator, v: Value) {
        unsafe { roots_slot_write(m, self.builtin_roots.load(Ordering::Acquire), 1, v) }
    }

    pub fn config_root(&self) -> Value {
        Value(self.builtin_rec.slots[0].load(Ordering::Acquire))
    }

    pub fn globals_root(&self) -> Value {
        Value(self.builtin_rec.slots[1].load(Ordering::Acquire))
    }

    // -- probes ------------------------------------------------------------

    /// Cells set in the current "marked" bitmaps, across all pages. Includes
    /// newborn premarks; stable between idle cycles.
    pub fn live_cell_count(&self) -> usize {
        let mut n = 0;
        self.allocator.for_each_page(|p| n += unsafe { (*p).live_cells() });
        n
    }

    pub fn committed_pages(&self) -> usize {
        self.allocator.total_pages.load(Ordering::Relaxed)
    }

    pub fn avail_pages(&self) -> usize {
        self.allocator.avail.count()
    }

    pub fn awaiting_pages(&self) -> usize {
        self.allocator.awaiting.count()
    }

    /// Stop the collector threads and wait for them. The runtime stays
    /// usable for allocation-free reads afterwards; tests call this so no
    /// thread outlives the process harness.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.trigger.cv.notify_all();
        self.pool.shutdown();
        self.decref_queue.shutdown();
        let handles = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            let _ = h.join();
        }
    }
}

/// Worker count: `min(1 + ncpus/2, 8)`, overridable by GLAS_GC_THREADS.
/// Invalid values log and are ignored; values above ncpus clamp to ncpus.
fn configured_workers() -> usize {
    let cpus = ncpus();
    let mut workers = (1 + cpus / 2).min(MAX_GC_WORKERS);
    if let Ok(raw) = std::env::var("GLAS_GC_THREADS") {
        match raw.trim().parse::<usize>() {
            Ok(n) if n >= 1 => workers = n.min(cpus),
            _ => log::warn!("ignoring invalid GLAS_GC_THREADS={:?}", raw),
        }
    }
    workers
}

/// Per-page allocation capacity, re-exported for stress tests.
pub fn page_capacity() -> usize {
    crate::page::USABLE_CELLS
}
