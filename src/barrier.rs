//! Snapshot-at-the-beginning write barrier.
//!
//! The only legal way to overwrite a pointer slot under GC. While marking is
//! active, the first overwrite of a slot per cycle records its pre-overwrite
//! value: the writer races to flip the slot's SATB bit to the scanned
//! polarity, and the winner marks the prior cell and hands it to the tracer
//! through a push-only snapshot stack. Snapshot nodes are cells carved from
//! the writing mutator's own page, so the barrier never takes a lock.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crate::cell::{Cell, Snapshot, TAG_SNAPSHOT};
use crate::mutator::Mutator;
use crate::page::Page;
use crate::roots::RootSet;
use crate::value::Value;

pub struct SnapshotStack {
    head: AtomicPtr<Cell>,
}

impl SnapshotStack {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
        }
    }

    pub fn push(&self, node: *mut Cell) {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe { (*(node as *mut Snapshot)).next = head };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Take everything pushed so far. Only called once pushes have ceased
    /// (the final stop-the-world), so a plain swap suffices.
    pub fn drain(&self) -> *mut Cell {
        self.head.swap(null_mut(), Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

/// Flip one bit of a root SATB word to the scanned polarity; true when this
/// call made the transition.
#[inline]
fn win_root_bit(word: &AtomicU64, mask: u64, polarity: bool) -> bool {
    if polarity {
        word.fetch_or(mask, Ordering::Release) & mask == 0
    } else {
        word.fetch_and(!mask, Ordering::Release) & mask != 0
    }
}

/// Same, for one of a cell's three per-slot gc bits.
#[inline]
pub(crate) fn win_gc_bit(gcbits: &AtomicU8, mask: u8, polarity: bool) -> bool {
    if polarity {
        gcbits.fetch_or(mask, Ordering::Release) & mask == 0
    } else {
        gcbits.fetch_and(!mask, Ordering::Release) & mask != 0
    }
}

/// Record `prior` for the tracer: mark its page bit, and if we won that
/// transition, push a single-entry snapshot so the value also gets traced.
#[inline]
unsafe fn capture_prior(m: &Mutator, prior: Value) {
    if !prior.is_cell() {
        return;
    }
    let cell = prior.cell();
    let page = Page::from_cell(cell);
    if (*page).marking_test_and_set(cell) {
        let node = m.alloc_snapshot_node();
        (*(node as *mut Snapshot)).captured = prior;
        debug_assert_eq!((*node).header.tag, TAG_SNAPSHOT);
        m.runtime().snapshots.push(node);
    }
}

/// Overwrite a registered root slot.
///
/// # Safety
/// The calling thread must be Busy and own the record behind `roots`;
/// `offset` must be one of the record's registered offsets.
pub unsafe fn roots_slot_write(m: &Mutator, roots: *mut RootSet, offset: u16, new_val: Value) {
    let rt = m.runtime();
    let slot = (*roots).slot(offset);
    // `marking` only changes under stop-the-world, which this thread is
    // not part of while Busy; no fence needed beyond the safepoint's.
    if !rt.is_marking() {
        slot.store(new_val.0, Ordering::Relaxed);
        return;
    }
    let prior = Value(slot.load(Ordering::Relaxed));
    let (word, mask) = (*roots).satb_word(offset);
    if win_root_bit(word, mask, rt.polarity()) {
        capture_prior(m, prior);
    }
    slot.store(new_val.0, Ordering::Relaxed);
}

/// Overwrite a traced body slot of a published cell.
///
/// # Safety
/// The calling thread must be Busy; `slot` must be a value slot for the
/// cell's type (see `value_slot_mask`).
pub unsafe fn cell_slot_write(m: &Mutator, cell: *mut Cell, slot: usize, new_val: Value) {
    debug_assert!(
        crate::cell::value_slot_mask((*cell).header.tag, (*cell).header.arg) & (1 << slot) != 0,
        "slot {} of tag {} is not a value slot",
        slot,
        (*cell).header.tag
    );
    let rt = m.runtime();
    let target = (*cell).slot_atomic(slot);
    if !rt.is_marking() {
        target.store(new_val.0, Ordering::Relaxed);
        return;
    }
    let prior = Value(target.load(Ordering::Relaxed));
    if win_gc_bit((*cell).gcbits_atomic(), 1 << slot, rt.polarity()) {
        capture_prior(m, prior);
    }
    target.store(new_val.0, Ordering::Relaxed);
}
