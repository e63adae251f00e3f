//! Registration of mutator-owned root structures.
//!
//! A root structure is a contiguous record owned by the mutator; its value
//! slots sit at fixed 8-byte-granular offsets listed in a sentinel-terminated
//! u16 array. Registration initializes every listed slot to VOID, sizes a
//! per-slot SATB bitmap by the largest offset, and pushes the registry node
//! onto a lock-free global list. Nodes whose refcount reaches zero are
//! extracted under stop-the-world and their finalizer runs there.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::cell::RootsFinalizer;
use crate::value::{Value, VOID};

/// Terminates a slot-offset array.
pub const ROOTS_END: u16 = u16::MAX;

pub struct RootSet {
    pub(crate) next: AtomicPtr<RootSet>,
    base: *mut u8,
    offsets: *const u16,
    finalizer: Option<RootsFinalizer>,
    pub(crate) refcount: AtomicU32,
    /// Last cycle this record was claimed for scanning; claimed by CAS.
    pub(crate) trace_cycle: AtomicU64,
    max_offset: u16,
    root_count: u16,
    satb: Box<[AtomicU64]>,
}

unsafe impl Send for RootSet {}
unsafe impl Sync for RootSet {}

impl RootSet {
    /// Build a registry node. Slots listed in `offsets` are reset to VOID.
    ///
    /// # Safety
    /// `base` must point to a record whose listed 8-byte slots stay valid
    /// and fixed until the node's finalizer has run; `offsets` must be
    /// terminated by `ROOTS_END`.
    pub(crate) unsafe fn new(
        base: *mut u8,
        offsets: *const u16,
        finalizer: Option<RootsFinalizer>,
        polarity: bool,
        cycle: u64,
    ) -> Box<RootSet> {
        let mut max_offset = 0u16;
        let mut root_count = 0u16;
        let mut cursor = offsets;
        while *cursor != ROOTS_END {
            let off = *cursor;
            (*(base.add(off as usize * 8) as *mut AtomicU64)).store(VOID.0, Ordering::Relaxed);
            if off > max_offset {
                max_offset = off;
            }
            root_count += 1;
            cursor = cursor.add(1);
        }
        let words = max_offset as usize / 64 + 1;
        let fill = if polarity { !0u64 } else { 0 };
        let satb = (0..words)
            .map(|_| AtomicU64::new(fill))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(RootSet {
            next: AtomicPtr::new(null_mut()),
            base,
            offsets,
            finalizer,
            refcount: AtomicU32::new(1),
            trace_cycle: AtomicU64::new(cycle),
            max_offset,
            root_count,
            satb,
        })
    }

    #[inline]
    pub(crate) unsafe fn slot(&self, offset: u16) -> &AtomicU64 {
        debug_assert!(offset <= self.max_offset);
        &*(self.base.add(offset as usize * 8) as *const AtomicU64)
    }

    #[inline]
    pub(crate) fn satb_word(&self, offset: u16) -> (&AtomicU64, u64) {
        (&self.satb[offset as usize / 64], 1u64 << (offset % 64))
    }

    pub(crate) fn satb_words(&self) -> &[AtomicU64] {
        &self.satb
    }

    pub(crate) fn for_each_offset(&self, mut f: impl FnMut(u16)) {
        unsafe {
            let mut cursor = self.offsets;
            while *cursor != ROOTS_END {
                f(*cursor);
                cursor = cursor.add(1);
            }
        }
    }

    pub fn root_count(&self) -> u16 {
        self.root_count
    }

    pub(crate) unsafe fn finalize(&self) {
        if let Some(f) = self.finalizer {
            f(self.base);
        }
    }
}

/// Hold another reference to a registered record.
pub unsafe fn roots_incref(roots: *mut RootSet) {
    (*roots).refcount.fetch_add(1, Ordering::AcqRel);
}

/// Drop a reference. The record stays listed until the collector's next
/// stop-the-world filter notices the zero count.
pub unsafe fn roots_decref(roots: *mut RootSet) {
    let prev = (*roots).refcount.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "roots refcount underflow");
}

pub struct RootList {
    head: AtomicPtr<RootSet>,
    /// Registrations since startup; the trigger heuristic watches growth.
    pub registered: AtomicUsize,
}

impl RootList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
            registered: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, node: Box<RootSet>) -> *mut RootSet {
        let raw = Box::into_raw(node);
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe { (*raw).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.registered.fetch_add(1, Ordering::Relaxed);
                return raw;
            }
            backoff.spin();
        }
    }

    pub fn head(&self) -> *mut RootSet {
        self.head.load(Ordering::Acquire)
    }

    /// Unlink zero-refcount records and run their finalizers. Must run
    /// under stop-the-world: registration pushes race only with the head,
    /// which is re-read after the filter.
    pub unsafe fn sweep_detached(&self) {
        let mut prev: *mut RootSet = null_mut();
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            let next = (*node).next.load(Ordering::Relaxed);
            if (*node).refcount.load(Ordering::Acquire) == 0 {
                if prev.is_null() {
                    // nobody can push concurrently while the world is stopped
                    self.head.store(next, Ordering::Release);
                } else {
                    (*prev).next.store(next, Ordering::Relaxed);
                }
                (*node).finalize();
                drop(Box::from_raw(node));
            } else {
                prev = node;
            }
            node = next;
        }
    }

    /// Live records, counted for the trigger heuristic and invariants.
    pub fn live_count(&self) -> usize {
        let mut n = 0;
        let mut node = self.head();
        while !node.is_null() {
            n += 1;
            node = unsafe { (*node).next.load(Ordering::Acquire) };
        }
        n
    }
}

// Kept for callers that hold a record with interior slots.
pub type RootSlot = AtomicU64;

pub fn slot_read(slot: &RootSlot) -> Value {
    Value(slot.load(Ordering::Acquire))
}
