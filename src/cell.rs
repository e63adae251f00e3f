//! 32-byte heap cells.
//!
//! A cell is a header word (type id, type argument, aggregate bits, gc bits),
//! a 32-bit primary stem field, and a 24-byte variant body. Cells never move;
//! variant views are `#[repr(C)]` structs cast from `*mut Cell`.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use modular_bitfield::prelude::*;

use crate::value::Value;

/// Release callback for foreign buffers: `(ptr, incref)`.
pub type RefctFn = unsafe fn(*mut u8, bool);

/// Finalizer callback for detached root structures.
pub type RootsFinalizer = unsafe fn(*mut u8);

// Type ids are plain constants, not an enum: the tracer must not rely on
// exhaustive matches surviving a corrupted header.
pub type CellTag = u8;

pub const TAG_BRANCH: CellTag = 1;
pub const TAG_STEM: CellTag = 2;
pub const TAG_SMALL_BIN: CellTag = 3;
pub const TAG_SMALL_ARR: CellTag = 4;
pub const TAG_BIG_BIN: CellTag = 5;
pub const TAG_BIG_ARR: CellTag = 6;
pub const TAG_FOREIGN: CellTag = 7;
pub const TAG_TAKE_CONCAT: CellTag = 8;
pub const TAG_SEAL: CellTag = 9;
pub const TAG_REGISTER: CellTag = 10;
pub const TAG_TOMBSTONE: CellTag = 11;
pub const TAG_EXTREF: CellTag = 12;
pub const TAG_THUNK: CellTag = 13;
/// Internal: single-entry write-barrier snapshot node carved from a page.
pub const TAG_SNAPSHOT: CellTag = 14;

pub const EPH_PLAIN: u8 = 0;
pub const EPH_DATABASE: u8 = 1;
pub const EPH_RUNTIME: u8 = 2;
pub const EPH_TRANSACTION: u8 = 3;

/// Aggregate type bits, `xxxx eeal`: max ephemerality, abstract, linear.
/// Composition joins with max/or.
#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
pub struct TypeAggr {
    pub linear: bool,
    pub abstracted: bool,
    pub ephemerality: B2,
    #[skip]
    __: B4,
}

impl TypeAggr {
    #[inline]
    pub fn byte(self) -> u8 {
        self.into_bytes()[0]
    }
    #[inline]
    pub fn from_byte(b: u8) -> TypeAggr {
        TypeAggr::from_bytes([b])
    }
}

#[inline]
pub fn aggr_join(a: u8, b: u8) -> u8 {
    let x = TypeAggr::from_byte(a);
    let y = TypeAggr::from_byte(b);
    TypeAggr::new()
        .with_linear(x.linear() | y.linear())
        .with_abstracted(x.abstracted() | y.abstracted())
        .with_ephemerality(x.ephemerality().max(y.ephemerality()))
        .byte()
}

/// Aggregate bits contributed by a value word. Pointers defer to the cell
/// header; abstract constants are always abstract and runtime-ephemeral.
pub fn value_aggr(v: Value) -> u8 {
    if v.is_cell() {
        unsafe { (*v.cell()).header.aggr }
    } else if v.is_abstract_const() {
        TypeAggr::new()
            .with_abstracted(true)
            .with_ephemerality(EPH_RUNTIME)
            .byte()
    } else {
        0
    }
}

/// Shared 8-byte prefix of every cell: header word plus the primary stem
/// field (0-31 inline bits, end-marker encoded).
#[repr(C)]
pub struct CellHeader {
    pub tag: CellTag,
    pub arg: u8,
    pub aggr: u8,
    pub gcbits: u8,
    pub stem_hd: u32,
}

#[repr(C, align(32))]
pub struct Cell {
    pub header: CellHeader,
    pub body: [u64; 3],
}

const _: () = assert!(size_of::<Cell>() == 32);

impl Cell {
    /// The gc bits are mutated concurrently by the tracer and the write
    /// barrier; all access goes through this view.
    #[inline(always)]
    pub fn gcbits_atomic(&self) -> &AtomicU8 {
        unsafe { &*(&self.header.gcbits as *const u8 as *const AtomicU8) }
    }

    /// Body word `i` as an atomic slot. Slots holding values are read by the
    /// tracer while mutators overwrite them through the barrier.
    #[inline(always)]
    pub fn slot_atomic(&self, i: usize) -> &AtomicU64 {
        debug_assert!(i < 3);
        unsafe { &*(&self.body[i] as *const u64 as *const AtomicU64) }
    }

    #[inline(always)]
    pub fn slot_value(&self, i: usize) -> Value {
        Value(self.slot_atomic(i).load(Ordering::Relaxed))
    }
}

/// Which body words of a cell hold traceable values, as a 3-bit mask
/// (bit i = body word i). The mask also indexes the per-slot gc bits.
#[inline]
pub fn value_slot_mask(tag: CellTag, arg: u8) -> u8 {
    match tag {
        TAG_BRANCH | TAG_TAKE_CONCAT | TAG_REGISTER | TAG_EXTREF => 0b110,
        TAG_STEM | TAG_BIG_BIN | TAG_BIG_ARR => 0b100,
        TAG_SMALL_ARR => match arg {
            0 => 0b000,
            1 => 0b001,
            2 => 0b011,
            _ => 0b111,
        },
        TAG_SEAL | TAG_THUNK => 0b111,
        _ => 0b000,
    }
}

// Variant views. Casting is the caller's responsibility; every view shares
// the CellHeader prefix and the 32-byte footprint.

/// Internal pair node with inline spine bits on both edges.
#[repr(C, align(32))]
pub struct Branch {
    pub header: CellHeader,
    pub left_stem: u32,
    pub right_stem: u32,
    pub left: Value,
    pub right: Value,
}

/// Long-bitstring extension: up to four full 32-bit stem words, then a
/// follow-on child.
#[repr(C, align(32))]
pub struct Stem {
    pub header: CellHeader,
    pub words: [u32; 4],
    pub child: Value,
}

/// Up to 24 inline bytes; length in `header.arg`.
#[repr(C, align(32))]
pub struct SmallBin {
    pub header: CellHeader,
    pub data: [u8; 24],
}

/// 1-3 children; length in `header.arg`.
#[repr(C, align(32))]
pub struct SmallArr {
    pub header: CellHeader,
    pub items: [Value; 3],
}

/// Slice over an externally malloc'd refcounted buffer.
#[repr(C, align(32))]
pub struct BigBin {
    pub header: CellHeader,
    pub data: *const u8,
    pub len: u64,
    pub pin: Value,
}

/// Slice over an externally malloc'd array of value words.
#[repr(C, align(32))]
pub struct BigArr {
    pub header: CellHeader,
    pub data: *const Value,
    pub len: u64,
    pub pin: Value,
}

/// Opaque pointer plus release callback; always abstract and
/// runtime-ephemeral, always on the finalizer list.
#[repr(C, align(32))]
pub struct Foreign {
    pub header: CellHeader,
    pub ptr: *mut u8,
    pub release: RefctFn,
    pub reserved: u64,
}

/// Rope node: length of the left side, then both halves.
#[repr(C, align(32))]
pub struct TakeConcat {
    pub header: CellHeader,
    pub left_len: u64,
    pub left: Value,
    pub right: Value,
}

/// Ephemeron: when `key` is a dead tombstone, `data` is cleared during
/// tracing instead of traced.
#[repr(C, align(32))]
pub struct Seal {
    pub header: CellHeader,
    pub key: Value,
    pub data: Value,
    pub meta: Value,
}

#[repr(C, align(32))]
pub struct Register {
    pub header: CellHeader,
    pub version: AtomicU64,
    pub assoc_lhs: AtomicU64,
    pub tombstone: AtomicU64,
}

/// Weak identity anchor: the weak slot is cleared when its referent is
/// collected; the id comes from a global counter and is stable for life.
#[repr(C, align(32))]
pub struct Tombstone {
    pub header: CellHeader,
    pub weak: AtomicU64,
    pub id: u64,
    pub reserved: u64,
}

#[repr(C, align(32))]
pub struct Extref {
    pub header: CellHeader,
    pub id: u64,
    pub value: Value,
    pub meta: Value,
}

#[repr(C, align(32))]
pub struct Thunk {
    pub header: CellHeader,
    pub code: Value,
    pub arg: Value,
    pub result: AtomicU64,
}

/// Write-barrier snapshot entry: intrusive stack link plus the captured
/// pre-overwrite pointer. Never reachable from user values.
#[repr(C, align(32))]
pub struct Snapshot {
    pub header: CellHeader,
    pub next: *mut Cell,
    pub captured: Value,
    pub reserved: u64,
}

const _: () = assert!(size_of::<Branch>() == 32);
const _: () = assert!(size_of::<Stem>() == 32);
const _: () = assert!(size_of::<SmallBin>() == 32);
const _: () = assert!(size_of::<SmallArr>() == 32);
const _: () = assert!(size_of::<BigBin>() == 32);
const _: () = assert!(size_of::<BigArr>() == 32);
const _: () = assert!(size_of::<Foreign>() == 32);
const _: () = assert!(size_of::<TakeConcat>() == 32);
const _: () = assert!(size_of::<Seal>() == 32);
const _: () = assert!(size_of::<Register>() == 32);
const _: () = assert!(size_of::<Tombstone>() == 32);
const _: () = assert!(size_of::<Extref>() == 32);
const _: () = assert!(size_of::<Thunk>() == 32);
const _: () = assert!(size_of::<Snapshot>() == 32);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::VOID;

    #[test]
    fn aggr_join_is_monoidal() {
        let plain = TypeAggr::new().byte();
        let lin = TypeAggr::new().with_linear(true).byte();
        let txn = TypeAggr::new().with_ephemerality(EPH_TRANSACTION).byte();
        assert_eq!(aggr_join(plain, plain), plain);
        assert_eq!(aggr_join(plain, lin), lin);
        assert_eq!(aggr_join(lin, txn), aggr_join(txn, lin));
        let j = TypeAggr::from_byte(aggr_join(lin, txn));
        assert!(j.linear());
        assert_eq!(j.ephemerality(), EPH_TRANSACTION);
    }

    #[test]
    fn abstract_const_aggr() {
        let a = TypeAggr::from_byte(value_aggr(VOID));
        assert!(a.abstracted());
        assert_eq!(a.ephemerality(), EPH_RUNTIME);
        assert!(!a.linear());
    }

    #[test]
    fn slot_masks() {
        assert_eq!(value_slot_mask(TAG_BRANCH, 0), 0b110);
        assert_eq!(value_slot_mask(TAG_STEM, 0), 0b100);
        assert_eq!(value_slot_mask(TAG_SMALL_ARR, 2), 0b011);
        assert_eq!(value_slot_mask(TAG_SEAL, 0), 0b111);
        assert_eq!(value_slot_mask(TAG_TOMBSTONE, 0), 0);
        assert_eq!(value_slot_mask(TAG_FOREIGN, 0), 0);
        assert_eq!(value_slot_mask(TAG_SNAPSHOT, 0), 0);
    }
}
