//! Mutator thread state and the lazy-sweep cell allocator.
//!
//! Each OS thread attaches once and gets a `MutatorRef`. All heap reads and
//! cell allocations happen inside Busy (re-entrant, depth-counted); long
//! computations call `safepoint()` so the collector can take the world. The
//! allocator owns one page at a time and sweeps it a mark word at a time:
//! the complement of the previous cycle's marked word is the free bitmap,
//! so sweeping is folded into allocation and there is no sweep phase.

use std::cell::{Cell as StdCell, UnsafeCell};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atomic::Atomic;

use crate::cell::*;
use crate::page::{Page, FIRST_CELL_WORD, LAST_CELL_WORD};
use crate::runtime::Runtime;
use crate::value::{Value, EMPTY_STEM32, VOID};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    Idle = 0,
    Busy = 1,
    Wait = 2,
    Done = 3,
}

/// Soft mutator errors, surfaced to the value layer as a bit set.
pub const ERR_UNDERFLOW: u32 = 1 << 0;
pub const ERR_LINEARITY: u32 = 1 << 1;

/// Stable ids for tombstones, process-global.
static TOMBSTONE_IDS: AtomicU64 = AtomicU64::new(1);

pub struct Mutator {
    pub(crate) state: Atomic<ThreadState>,
    busy_depth: StdCell<u32>,
    err_bits: StdCell<u32>,
    /// Owned allocation page and the sweep cursor within it.
    pub(crate) page: StdCell<*mut Page>,
    pub(crate) mark_word: StdCell<usize>,
    pub(crate) free_bits: StdCell<u64>,
    freed_cells: StdCell<usize>,
    /// Cells needing finalization, handed to the collector each cycle.
    pub(crate) finalizers: UnsafeCell<Vec<*mut Cell>>,
    rt: Arc<Runtime>,
}

unsafe impl Send for Mutator {}

impl Mutator {
    pub(crate) fn new(rt: Arc<Runtime>) -> Mutator {
        Mutator {
            state: Atomic::new(ThreadState::Idle),
            busy_depth: StdCell::new(0),
            err_bits: StdCell::new(0),
            page: StdCell::new(null_mut()),
            mark_word: StdCell::new(0),
            free_bits: StdCell::new(0),
            freed_cells: StdCell::new(0),
            finalizers: UnsafeCell::new(Vec::new()),
            rt,
        }
    }

    #[inline(always)]
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    #[inline(always)]
    pub fn is_busy(&self) -> bool {
        self.busy_depth.get() > 0
    }

    /// Idle -> Busy; re-entrant.
    pub fn enter_busy(&self) {
        let depth = self.busy_depth.get();
        if depth == 0 {
            self.rt.safepoint.enter_busy(&self.state);
        }
        self.busy_depth.set(depth + 1);
    }

    /// Busy -> Idle once the outermost scope unwinds.
    pub fn exit_busy(&self) {
        let depth = self.busy_depth.get();
        debug_assert!(depth > 0, "exit_busy underflow");
        self.busy_depth.set(depth - 1);
        if depth == 1 {
            self.rt.safepoint.exit_busy(&self.state);
        }
    }

    /// RAII Busy scope.
    pub fn busy(&self) -> BusyScope<'_> {
        self.enter_busy();
        BusyScope { mutator: self }
    }

    /// Cheap check for a pending stop; callable anywhere inside Busy. All
    /// non-root cell pointers held in locals are invalidated across it.
    #[inline(always)]
    pub fn safepoint(&self) {
        debug_assert!(self.is_busy());
        if self.rt.safepoint.stop_requested() {
            self.rt.safepoint.yield_to_collector(&self.state);
        }
    }

    pub fn set_error(&self, bits: u32) {
        self.err_bits.set(self.err_bits.get() | bits);
    }

    pub fn take_errors(&self) -> u32 {
        let e = self.err_bits.get();
        self.err_bits.set(0);
        e
    }

    // -- cell allocation ---------------------------------------------------

    /// Allocate one 32-byte cell. The header is initialized; body words are
    /// reset to VOID and belong to the caller until the cell is published.
    pub fn alloc_cell(&self, tag: CellTag, arg: u8, aggr: u8) -> *mut Cell {
        debug_assert!(self.is_busy(), "allocation outside Busy");
        let mut bits = self.free_bits.get();
        if bits == 0 {
            self.refill_free_bits();
            bits = self.free_bits.get();
        }
        let slot = bits.trailing_zeros();
        self.free_bits.set(bits & (bits - 1));
        let page = self.page.get();
        let cell = unsafe { (*page).cell_at(self.mark_word.get(), slot) };
        let gcbits = if self.rt.polarity() { 0b111 } else { 0 };
        unsafe {
            (*cell).header = CellHeader {
                tag,
                arg,
                aggr,
                gcbits,
                stem_hd: EMPTY_STEM32,
            };
            (*cell).body = [VOID.0; 3];
        }
        cell
    }

    /// Slow path: advance the sweep cursor, switching pages when the owned
    /// one is exhausted. While marking is active, freshly exposed free bits
    /// are premarked so this cycle cannot sweep the newborn cells.
    #[cold]
    fn refill_free_bits(&self) {
        let rt = &self.rt;
        loop {
            let page = self.page.get();
            if page.is_null() || self.mark_word.get() == LAST_CELL_WORD {
                if !page.is_null() {
                    rt.allocator.release_owned(page, rt.cycle());
                }
                let fresh = rt.allocator.acquire_page(rt.cycle());
                self.page.set(fresh);
                self.mark_word.set(FIRST_CELL_WORD);
                self.freed_cells.set(0);
            } else {
                self.mark_word.set(self.mark_word.get() + 1);
            }
            let page = self.page.get();
            let word = self.mark_word.get();
            let marked = unsafe { (*page).marked_words()[word].load(Ordering::Relaxed) };
            let free = !marked;
            if free == 0 {
                continue;
            }
            self.freed_cells
                .set(self.freed_cells.get() + free.count_ones() as usize);
            if rt.is_marking() {
                unsafe { (*page).premark_word(word, free) };
            }
            self.free_bits.set(free);
            return;
        }
    }

    /// Register a cell whose death requires a finalizer run.
    fn register_finalizable(&self, cell: *mut Cell) {
        unsafe { (*self.finalizers.get()).push(cell) };
    }

    // -- cell constructors -------------------------------------------------

    pub fn alloc_branch(
        &self,
        left_stem: u32,
        right_stem: u32,
        left: Value,
        right: Value,
    ) -> *mut Cell {
        let aggr = aggr_join(value_aggr(left), value_aggr(right));
        let cell = self.alloc_cell(TAG_BRANCH, 0, aggr);
        unsafe {
            let b = cell as *mut Branch;
            (*b).left_stem = left_stem;
            (*b).right_stem = right_stem;
            (*b).left = left;
            (*b).right = right;
        }
        cell
    }

    pub fn alloc_stem_cell(
        &self,
        stem_hd: u32,
        words: [u32; 4],
        nwords: u8,
        child: Value,
    ) -> *mut Cell {
        debug_assert!(nwords <= 4);
        let cell = self.alloc_cell(TAG_STEM, nwords, value_aggr(child));
        unsafe {
            (*cell).header.stem_hd = stem_hd;
            let s = cell as *mut Stem;
            (*s).words = words;
            (*s).child = child;
        }
        cell
    }

    pub fn alloc_small_bin(&self, bytes: &[u8]) -> *mut Cell {
        debug_assert!(bytes.len() <= 24);
        let cell = self.alloc_cell(TAG_SMALL_BIN, bytes.len() as u8, 0);
        unsafe {
            let b = cell as *mut SmallBin;
            (*b).data = [0; 24];
            (&mut (*b).data)[..bytes.len()].copy_from_slice(bytes);
        }
        cell
    }

    pub fn alloc_small_arr(&self, items: &[Value]) -> *mut Cell {
        debug_assert!(!items.is_empty() && items.len() <= 3);
        let mut aggr = 0;
        for &v in items {
            aggr = aggr_join(aggr, value_aggr(v));
        }
        let cell = self.alloc_cell(TAG_SMALL_ARR, items.len() as u8, aggr);
        unsafe {
            let a = cell as *mut SmallArr;
            for (i, &v) in items.iter().enumerate() {
                (*a).items[i] = v;
            }
        }
        cell
    }

    /// Wrap an external buffer. `pin` keeps the backing refcount alive.
    pub fn alloc_big_bin(&self, data: *const u8, len: u64, pin: Value) -> *mut Cell {
        let cell = self.alloc_cell(TAG_BIG_BIN, 0, value_aggr(pin));
        unsafe {
            let b = cell as *mut BigBin;
            (*b).data = data;
            (*b).len = len;
            (*b).pin = pin;
        }
        cell
    }

    pub fn alloc_big_arr(&self, data: *const Value, len: u64, pin: Value) -> *mut Cell {
        let cell = self.alloc_cell(TAG_BIG_ARR, 0, value_aggr(pin));
        unsafe {
            let a = cell as *mut BigArr;
            (*a).data = data;
            (*a).len = len;
            (*a).pin = pin;
        }
        cell
    }

    /// Foreign pointer with a release callback; joins the finalizer list.
    pub fn alloc_foreign(&self, ptr: *mut u8, release: RefctFn) -> *mut Cell {
        let aggr = TypeAggr::new()
            .with_abstracted(true)
            .with_ephemerality(EPH_RUNTIME)
            .byte();
        let cell = self.alloc_cell(TAG_FOREIGN, 0, aggr);
        unsafe {
            let f = cell as *mut Foreign;
            (*f).ptr = ptr;
            (*f).release = release;
            (*f).reserved = 0;
        }
        self.register_finalizable(cell);
        cell
    }

    pub fn alloc_take_concat(&self, left_len: u64, left: Value, right: Value) -> *mut Cell {
        let aggr = aggr_join(value_aggr(left), value_aggr(right));
        let cell = self.alloc_cell(TAG_TAKE_CONCAT, 0, aggr);
        unsafe {
            let t = cell as *mut TakeConcat;
            (*t).left_len = left_len;
            (*t).left = left;
            (*t).right = right;
        }
        cell
    }

    pub fn alloc_seal(&self, key: Value, data: Value, meta: Value) -> *mut Cell {
        let aggr = aggr_join(value_aggr(key), aggr_join(value_aggr(data), value_aggr(meta)));
        let cell = self.alloc_cell(TAG_SEAL, 0, aggr);
        unsafe {
            let s = cell as *mut Seal;
            (*s).key = key;
            (*s).data = data;
            (*s).meta = meta;
        }
        cell
    }

    /// Tombstone whose weak slot tracks `referent` until it is collected.
    pub fn alloc_tombstone(&self, referent: Value) -> *mut Cell {
        let cell = self.alloc_cell(TAG_TOMBSTONE, 0, 0);
        unsafe {
            let t = cell as *mut Tombstone;
            (*t).weak = AtomicU64::new(referent.0);
            (*t).id = TOMBSTONE_IDS.fetch_add(1, Ordering::Relaxed);
            (*t).reserved = 0;
        }
        cell
    }

    /// Register plus its identity tombstone; the register joins the
    /// finalizer list so death invalidates the tombstone.
    pub fn alloc_register(&self) -> *mut Cell {
        let cell = self.alloc_cell(TAG_REGISTER, 0, 0);
        let tomb = self.alloc_tombstone(Value::from_cell(cell));
        unsafe {
            let r = cell as *mut Register;
            (*r).version = AtomicU64::new(0);
            (*r).assoc_lhs = AtomicU64::new(VOID.0);
            (*r).tombstone = AtomicU64::new(Value::from_cell(tomb).0);
        }
        self.register_finalizable(cell);
        cell
    }

    pub(crate) fn alloc_snapshot_node(&self) -> *mut Cell {
        self.alloc_cell(TAG_SNAPSHOT, 0, 0)
    }

    pub fn freed_cells_this_page(&self) -> usize {
        self.freed_cells.get()
    }
}

pub struct BusyScope<'a> {
    mutator: &'a Mutator,
}

impl<'a> Drop for BusyScope<'a> {
    fn drop(&mut self) {
        self.mutator.exit_busy();
    }
}

/// Owning handle to an attached mutator; detaches on drop. One per thread.
pub struct MutatorRef {
    raw: *mut Mutator,
}

unsafe impl Send for MutatorRef {}

impl MutatorRef {
    pub(crate) fn from_raw(raw: *mut Mutator) -> MutatorRef {
        MutatorRef { raw }
    }
}

impl std::ops::Deref for MutatorRef {
    type Target = Mutator;
    fn deref(&self) -> &Mutator {
        unsafe { &*self.raw }
    }
}

impl Drop for MutatorRef {
    fn drop(&mut self) {
        unsafe {
            let m = &*self.raw;
            assert!(
                !m.is_busy(),
                "detaching a mutator that is still Busy"
            );
            let rt = m.rt.clone();
            rt.detach_thread(self.raw);
        }
    }
}
