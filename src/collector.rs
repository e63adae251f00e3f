//! The collection cycle and its threads.
//!
//! A dedicated trigger thread polls every ~10 ms (or wakes on an explicit
//! trigger) and starts a cycle when the heuristics say so. A cycle is:
//! stop the world, flip scan polarity and activate marking, hand off
//! per-thread finalizer lists, filter detached roots; resume; trace
//! concurrently with a persistent worker pool; stop again to drain the
//! residual write-barrier snapshots, swap every page's bitmaps and scan the
//! finalizer lists; resume; recycle pages and reset scan bitmaps.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::cell::{Foreign, Register, Snapshot, Tombstone, TAG_FOREIGN, TAG_REGISTER};
use crate::globals::{GC_POLL_INTERVAL, RELEASED_PAGES_TRIGGER, ROOT_GROWTH_TRIGGER};
use crate::marking::Tracer;
use crate::page::Page;
use crate::roots::RootSet;
use crate::runtime::Runtime;
use crate::value::{Value, VOID};

#[derive(Copy, Clone)]
pub(crate) struct MarkJob {
    pub roots_head: *mut RootSet,
    pub cycle: u64,
    pub polarity: bool,
    pub participants: usize,
}

pub(crate) struct PoolState {
    epoch: u64,
    running: usize,
    /// Workers still in their loop; a cycle only counts on these.
    alive: usize,
    shutdown: bool,
    job: Option<MarkJob>,
}

/// Persistent marking workers, woken once per cycle. The collector's main
/// thread participates as one more tracer.
pub(crate) struct MarkerPool {
    state: Mutex<PoolState>,
    cv_start: Condvar,
    cv_done: Condvar,
    pub nworkers: usize,
}

unsafe impl Send for MarkerPool {}
unsafe impl Sync for MarkerPool {}

impl MarkerPool {
    pub fn new(nworkers: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                epoch: 0,
                running: 0,
                alive: nworkers,
                shutdown: false,
                job: None,
            }),
            cv_start: Condvar::new(),
            cv_done: Condvar::new(),
            nworkers,
        }
    }

    pub fn shutdown(&self) {
        let mut g = self.state.lock();
        g.shutdown = true;
        self.cv_start.notify_all();
    }

    fn run_cycle(&self, rt: &Runtime, mut job: MarkJob) -> usize {
        {
            let mut g = self.state.lock();
            // a shutdown race may have retired workers; count only the live
            job.participants = g.alive + 1;
            g.epoch += 1;
            g.running = g.alive;
            g.job = Some(job);
        }
        self.cv_start.notify_all();
        let marked = mark_participant(rt, job);
        let mut g = self.state.lock();
        while g.running > 0 {
            self.cv_done.wait(&mut g);
        }
        marked
    }
}

pub(crate) fn worker_main(rt: Arc<Runtime>) {
    let mut seen_epoch = 0u64;
    loop {
        let job = {
            let mut g = rt.pool.state.lock();
            loop {
                // a pending epoch is served even during shutdown; both are
                // published under this mutex, so the order here is what
                // keeps run_cycle from waiting on retired workers
                if g.epoch != seen_epoch {
                    seen_epoch = g.epoch;
                    break g.job.expect("pool epoch advanced without a job");
                }
                if g.shutdown {
                    g.alive -= 1;
                    rt.pool.cv_done.notify_all();
                    return;
                }
                rt.pool.cv_start.wait(&mut g);
            }
        };
        mark_participant(&rt, job);
        let mut g = rt.pool.state.lock();
        g.running -= 1;
        if g.running == 0 {
            rt.pool.cv_done.notify_all();
        }
    }
}

/// One tracer's share of a cycle: race for unclaimed root structures, steal
/// mark buffers, and spin down only when every participant is idle with no
/// work in sight.
fn mark_participant(rt: &Runtime, job: MarkJob) -> usize {
    let mut tracer = Tracer::new(rt, job.polarity);
    loop {
        tracer.drain_local();
        if let Some(roots) = claim_root(job.roots_head, job.cycle) {
            unsafe { tracer.scan_roots(roots) };
            continue;
        }
        if let Some(buf) = rt.mark_queue.pop() {
            tracer.process_buffer(buf);
            continue;
        }
        rt.mark_idle.fetch_add(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        let mut finished = false;
        loop {
            if !rt.mark_queue.is_empty() || has_unclaimed_root(job.roots_head, job.cycle) {
                rt.mark_idle.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            if rt.mark_idle.load(Ordering::SeqCst) == job.participants {
                finished = true;
                break;
            }
            backoff.snooze();
        }
        if finished {
            return tracer.cells_marked;
        }
    }
}

fn claim_root(head: *mut RootSet, cycle: u64) -> Option<*mut RootSet> {
    let mut node = head;
    while !node.is_null() {
        unsafe {
            let tc = (*node).trace_cycle.load(Ordering::Acquire);
            if tc != cycle
                && (*node)
                    .trace_cycle
                    .compare_exchange(tc, cycle, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(node);
            }
            node = (*node).next.load(Ordering::Acquire);
        }
    }
    None
}

fn has_unclaimed_root(head: *mut RootSet, cycle: u64) -> bool {
    let mut node = head;
    while !node.is_null() {
        unsafe {
            if (*node).trace_cycle.load(Ordering::Acquire) != cycle {
                return true;
            }
            node = (*node).next.load(Ordering::Acquire);
        }
    }
    false
}

// -- trigger thread --------------------------------------------------------

pub(crate) struct Trigger {
    pub state: Mutex<TriggerState>,
    pub cv: Condvar,
}

#[derive(Default)]
pub(crate) struct TriggerState {
    pub requested: bool,
    pub full: bool,
}

impl Trigger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TriggerState::default()),
            cv: Condvar::new(),
        }
    }
}

pub(crate) fn gc_thread_main(rt: Arc<Runtime>) {
    loop {
        let (requested, full) = {
            let mut g = rt.trigger.state.lock();
            if !g.requested && !rt.is_shutdown() {
                rt.trigger.cv.wait_for(&mut g, GC_POLL_INTERVAL);
            }
            let out = (g.requested, g.full);
            g.requested = false;
            g.full = false;
            out
        };
        if rt.is_shutdown() {
            return;
        }
        if requested || should_collect(&rt) {
            collect_cycle(&rt, full);
        }
    }
}

fn should_collect(rt: &Runtime) -> bool {
    let alloc = &rt.allocator;
    let grown = rt
        .roots
        .registered
        .load(Ordering::Relaxed)
        .saturating_sub(rt.roots_at_last_cycle.load(Ordering::Relaxed));
    if grown > ROOT_GROWTH_TRIGGER {
        return true;
    }
    if alloc.pages_released.load(Ordering::Relaxed) >= RELEASED_PAGES_TRIGGER {
        return true;
    }
    let awaiting = alloc.awaiting.count();
    if awaiting >= 4 && alloc.avail.count() <= awaiting / 3 {
        return true;
    }
    false
}

// -- the cycle -------------------------------------------------------------

pub(crate) fn collect_cycle(rt: &Runtime, full: bool) {
    let _one_at_a_time = rt.gc_lock.lock();
    let started = Instant::now();
    let sp = &rt.safepoint;

    // flip phase
    sp.stop_the_world();
    let (cycle, polarity) = rt.begin_cycle();
    {
        // pending free bits become newborn cells of this cycle; premark
        // them, and take every thread's finalizer list
        let threads = rt.threads.lock();
        let mut fins = rt.finalizable.lock();
        for &m in threads.iter() {
            unsafe {
                let page = (*m).page.get();
                let bits = (*m).free_bits.get();
                if !page.is_null() && bits != 0 {
                    (*page).premark_word((*m).mark_word.get(), bits);
                }
                fins.append(&mut *(*m).finalizers.get());
            }
        }
    }
    unsafe { rt.roots.sweep_detached() };
    let roots_head = rt.roots.head();
    rt.mark_idle.store(0, Ordering::SeqCst);
    sp.resume_the_world();

    // concurrent trace
    let cells_marked = rt.pool.run_cycle(
        rt,
        MarkJob {
            roots_head,
            cycle,
            polarity,
            participants: rt.pool.nworkers + 1,
        },
    );

    // final drain: no mutator is Busy, so the snapshot stack can only
    // shrink; loop to a fixpoint while stopped
    sp.stop_the_world();
    {
        let mut tracer = Tracer::new(rt, polarity);
        loop {
            let mut node = rt.snapshots.drain();
            let had_snapshots = !node.is_null();
            while !node.is_null() {
                unsafe {
                    let snap = node as *mut Snapshot;
                    let captured = (*snap).captured;
                    node = (*snap).next;
                    if captured.is_cell() {
                        tracer.trace_children(captured.cell());
                    }
                }
            }
            tracer.drain_local();
            while let Some(buf) = rt.mark_queue.pop() {
                tracer.process_buffer(buf);
            }
            if !had_snapshots && rt.snapshots.is_empty() && rt.mark_queue.is_empty() {
                break;
            }
        }
    }
    rt.end_marking();
    rt.allocator.for_each_page(|p| unsafe { (*p).swap_bitmaps() });
    run_finalizers(rt);
    sp.resume_the_world();

    // reclamation
    rt.allocator.for_each_page(|p| unsafe { (*p).clear_marking() });
    let (recycled, deferred, returned) = recycle_pages(rt);
    rt.allocator.destroy_pristine_heaps();
    rt.note_cycle_end();

    log::debug!(
        "gc cycle {} ({}): {} cells marked, pages {} recycled / {} deferred / {} returned, {:?}",
        cycle,
        if full { "full" } else { "auto" },
        cells_marked,
        recycled,
        deferred,
        returned,
        started.elapsed()
    );
}

/// Scan the collected finalizer lists against the bitmaps that just became
/// "marked". Runs under stop-the-world: dead cells cannot be resurrected or
/// reallocated while we read them.
fn run_finalizers(rt: &Runtime) {
    let mut fins = rt.finalizable.lock();
    fins.retain(|&cell| unsafe {
        let page = Page::from_cell(cell);
        if (*page).marked_test(cell) {
            return true;
        }
        match (*cell).header.tag {
            TAG_FOREIGN => {
                let f = cell as *mut Foreign;
                rt.decref_queue.push((*f).release, (*f).ptr);
            }
            TAG_REGISTER => {
                let r = cell as *mut Register;
                let tomb = Value((*r).tombstone.load(Ordering::Relaxed));
                if tomb.is_cell() {
                    let t = tomb.cell() as *mut Tombstone;
                    (*t).weak.store(VOID.0, Ordering::Release);
                }
            }
            other => debug_assert!(false, "finalizable cell with tag {}", other),
        }
        false
    });
}

/// Re-file every page on `awaiting`: owned pages stay, empty pages go back
/// to the OS, dense pages wait out their defer count, the rest become
/// available for sweeping.
fn recycle_pages(rt: &Runtime) -> (usize, usize, usize) {
    let alloc = &rt.allocator;
    let mut recycled = 0;
    let mut deferred = 0;
    let mut returned = 0;
    let mut page = alloc.awaiting.drain();
    while !page.is_null() {
        unsafe {
            let next = (*page).next.load(Ordering::Relaxed);
            if (*page).is_owned() {
                alloc.awaiting.push(page);
            } else {
                (*page).record_utilization();
                if (*page).live_cells() == 0 {
                    alloc.return_to_heap(page);
                    returned += 1;
                } else if (*page).defer_reuse.load(Ordering::Relaxed) == 0 {
                    alloc.avail.push(page);
                    recycled += 1;
                } else {
                    (*page).defer_reuse.fetch_sub(1, Ordering::Relaxed);
                    alloc.awaiting.push(page);
                    deferred += 1;
                }
            }
            page = next;
        }
    }
    (recycled, deferred, returned)
}
