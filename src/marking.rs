//! Concurrent tracing: mark buffers, the shared work-stealing stack, and
//! the per-worker tracer.
//!
//! Marking is per-cell exactly-once: whoever makes a cell's 0->1 marking-bit
//! transition owns pushing it onto a buffer, and whoever pops it calls
//! `trace_children` once. Per-slot gc bits then arbitrate between the tracer
//! and the write barrier, so each slot contributes its snapshot value at
//! most once per cycle.

use std::ptr::{null, null_mut};
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::cell::{
    value_slot_mask, BigArr, Cell, Tombstone, TAG_BIG_ARR, TAG_SEAL, TAG_TOMBSTONE,
};
use crate::page::Page;
use crate::roots::RootSet;
use crate::runtime::Runtime;
use crate::value::{Value, VOID};

pub const MARK_BUFFER_CAP: usize = 248;
/// Big-array elements traced per visit before yielding back to cell work.
const DEFER_CHUNK: usize = 64;

#[repr(C)]
pub struct MarkBuffer {
    next: AtomicPtr<MarkBuffer>,
    len: usize,
    /// Pending large-array tail; traced lazily.
    deferred: *const Value,
    deferred_len: usize,
    cells: [*mut Cell; MARK_BUFFER_CAP],
}

impl MarkBuffer {
    pub fn boxed() -> *mut MarkBuffer {
        Box::into_raw(Box::new(MarkBuffer {
            next: AtomicPtr::new(null_mut()),
            len: 0,
            deferred: null(),
            deferred_len: 0,
            cells: [null_mut(); MARK_BUFFER_CAP],
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 && self.deferred.is_null()
    }
}

/// Shared overflow stack of mark buffers. Push is lock-free; pop takes a
/// mutex so a freed-and-reused buffer address cannot ABA a concurrent pop.
pub struct BufferStack {
    head: AtomicPtr<MarkBuffer>,
    pop_lock: Mutex<()>,
}

impl BufferStack {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
            pop_lock: Mutex::new(()),
        }
    }

    pub fn push(&self, buf: *mut MarkBuffer) {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe { (*buf).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, buf, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<*mut MarkBuffer> {
        let _g = self.pop_lock.lock();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

/// One tracing participant: a local buffer being filled/drained, a spare to
/// avoid churning the allocator, and the cycle's polarity.
pub struct Tracer<'a> {
    rt: &'a Runtime,
    polarity: bool,
    local: *mut MarkBuffer,
    spare: *mut MarkBuffer,
    pub cells_marked: usize,
}

impl<'a> Tracer<'a> {
    pub fn new(rt: &'a Runtime, polarity: bool) -> Self {
        Self {
            rt,
            polarity,
            local: MarkBuffer::boxed(),
            spare: null_mut(),
            cells_marked: 0,
        }
    }

    #[inline]
    pub fn mark_value(&mut self, v: Value) {
        if v.is_cell() {
            self.mark_cell(v.cell());
        }
    }

    #[inline]
    pub fn mark_cell(&mut self, cell: *mut Cell) {
        unsafe {
            let page = Page::from_cell(cell);
            if (*page).marking_test_and_set(cell) {
                self.cells_marked += 1;
                self.push_cell(cell);
            }
        }
    }

    fn push_cell(&mut self, cell: *mut Cell) {
        unsafe {
            if (*self.local).len == MARK_BUFFER_CAP {
                self.rt.mark_queue.push(self.local);
                self.local = if self.spare.is_null() {
                    MarkBuffer::boxed()
                } else {
                    std::mem::replace(&mut self.spare, null_mut())
                };
            }
            let len = (*self.local).len;
            (*self.local).cells[len] = cell;
            (*self.local).len = len + 1;
        }
    }

    /// Queue a big array's elements for lazy tracing. A buffer carries one
    /// pending slice; a second arrival overflows into a fresh buffer.
    pub fn defer_array(&mut self, data: *const Value, len: usize) {
        if len == 0 || data.is_null() {
            return;
        }
        unsafe {
            if (*self.local).deferred.is_null() {
                (*self.local).deferred = data;
                (*self.local).deferred_len = len;
            } else {
                let buf = MarkBuffer::boxed();
                (*buf).deferred = data;
                (*buf).deferred_len = len;
                self.rt.mark_queue.push(buf);
            }
        }
    }

    /// Claim the unscanned subset of `mask` in a cell's gc bits; returns
    /// the bits this call flipped to the scanned polarity.
    fn win_slots(&self, cell: *mut Cell, mask: u8) -> u8 {
        let gc = unsafe { (*cell).gcbits_atomic() };
        let pol = if self.polarity { 0b111u8 } else { 0 };
        loop {
            let old = gc.load(Ordering::Relaxed);
            let unscanned = (old ^ pol) & mask & 0b111;
            if unscanned == 0 {
                return 0;
            }
            if gc
                .compare_exchange_weak(old, old ^ unscanned, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return unscanned;
            }
        }
    }

    /// Trace the outgoing edges of a freshly marked cell. Runs exactly once
    /// per cell per cycle.
    pub unsafe fn trace_children(&mut self, cell: *mut Cell) {
        let tag = (*cell).header.tag;
        if tag == TAG_SEAL {
            return self.trace_seal(cell);
        }
        let mask = value_slot_mask(tag, (*cell).header.arg);
        if mask != 0 {
            let snap = [
                (*cell).slot_value(0),
                (*cell).slot_value(1),
                (*cell).slot_value(2),
            ];
            let won = self.win_slots(cell, mask);
            for i in 0..3 {
                if won & (1 << i) != 0 {
                    self.mark_value(snap[i]);
                }
            }
        }
        if tag == TAG_BIG_ARR {
            // the marking-bit win gating this call makes the defer
            // exactly-once; slot bits only guard the pin edge
            let arr = cell as *mut BigArr;
            self.defer_array((*arr).data, (*arr).len as usize);
        }
    }

    /// Ephemeron rule: a seal whose key is a dead tombstone has its data
    /// cleared instead of traced. The clear is an idempotent constant
    /// store; readers may observe either value until their next safepoint.
    unsafe fn trace_seal(&mut self, cell: *mut Cell) {
        let key = (*cell).slot_value(0);
        let key_dead = key.is_cell() && {
            let k = key.cell();
            (*k).header.tag == TAG_TOMBSTONE
                && Value((*(k as *mut Tombstone)).weak.load(Ordering::Acquire)).is_void()
        };
        if key_dead {
            (*cell).slot_atomic(1).store(VOID.0, Ordering::Release);
            let meta = (*cell).slot_value(2);
            let won = self.win_slots(cell, 0b111);
            if won & 0b001 != 0 {
                self.mark_value(key);
            }
            if won & 0b100 != 0 {
                self.mark_value(meta);
            }
        } else {
            let snap = [key, (*cell).slot_value(1), (*cell).slot_value(2)];
            let won = self.win_slots(cell, 0b111);
            for i in 0..3 {
                if won & (1 << i) != 0 {
                    self.mark_value(snap[i]);
                }
            }
        }
    }

    /// Process everything queued locally.
    pub fn drain_local(&mut self) {
        unsafe {
            loop {
                let len = (*self.local).len;
                if len > 0 {
                    (*self.local).len = len - 1;
                    let cell = (*self.local).cells[len - 1];
                    self.trace_children(cell);
                    continue;
                }
                if !(*self.local).deferred.is_null() {
                    self.trace_deferred_chunk(self.local);
                    continue;
                }
                return;
            }
        }
    }

    unsafe fn trace_deferred_chunk(&mut self, buf: *mut MarkBuffer) {
        let data = (*buf).deferred;
        let chunk = (*buf).deferred_len.min(DEFER_CHUNK);
        (*buf).deferred_len -= chunk;
        if (*buf).deferred_len == 0 {
            (*buf).deferred = null();
        } else {
            (*buf).deferred = data.add(chunk);
        }
        for i in 0..chunk {
            self.mark_value(*data.add(i));
        }
    }

    /// Drain a buffer stolen from the shared stack, then keep it as the
    /// spare (or free it if a spare is already held).
    pub fn process_buffer(&mut self, buf: *mut MarkBuffer) {
        unsafe {
            loop {
                let len = (*buf).len;
                if len > 0 {
                    (*buf).len = len - 1;
                    let cell = (*buf).cells[len - 1];
                    self.trace_children(cell);
                } else if !(*buf).deferred.is_null() {
                    self.trace_deferred_chunk(buf);
                } else {
                    break;
                }
                self.drain_local();
            }
            if self.spare.is_null() {
                (*buf).next.store(null_mut(), Ordering::Relaxed);
                self.spare = buf;
            } else {
                drop(Box::from_raw(buf));
            }
        }
    }

    /// Scan one claimed root structure: per SATB word, snapshot the slot
    /// values, flip the whole word to the scanned polarity, then mark the
    /// snapshots whose bits this flip won.
    pub unsafe fn scan_roots(&mut self, roots: *mut RootSet) {
        let pol_word = if self.polarity { !0u64 } else { 0 };
        let satb = (*roots).satb_words();
        for w in 0..satb.len() {
            let mut snaps = [(0u16, 0u64); 64];
            let mut n = 0usize;
            (*roots).for_each_offset(|off| {
                if off as usize / 64 == w {
                    snaps[n] = (off, (*roots).slot(off).load(Ordering::Relaxed));
                    n += 1;
                }
            });
            if n == 0 {
                continue;
            }
            let old = satb[w].swap(pol_word, Ordering::AcqRel);
            for &(off, raw) in &snaps[..n] {
                let mask = 1u64 << (off % 64);
                let unscanned = if self.polarity {
                    old & mask == 0
                } else {
                    old & mask != 0
                };
                if unscanned {
                    self.mark_value(Value(raw));
                }
            }
        }
        self.drain_local();
    }

    pub fn has_local_work(&self) -> bool {
        unsafe { !(*self.local).is_empty() }
    }
}

impl<'a> Drop for Tracer<'a> {
    fn drop(&mut self) {
        unsafe {
            debug_assert!((*self.local).is_empty(), "tracer dropped with live work");
            drop(Box::from_raw(self.local));
            if !self.spare.is_null() {
                drop(Box::from_raw(self.spare));
            }
        }
    }
}
