//! End-to-end scenarios: allocation storms across full collections,
//! foreign-pointer finalization through the decref queue, deep structures
//! surviving and then leaving the heap.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::barrier::roots_slot_write;
use crate::page::Page;
use crate::roots::{roots_decref, ROOTS_END};
use crate::runtime::{page_capacity, Runtime};
use crate::stem::StemCell;
use crate::value::{Value, EMPTY_STEM32, UNIT, VOID};

#[repr(C)]
struct TestRoots {
    slots: [AtomicU64; 4],
}

static TEST_OFFSETS: [u16; 5] = [0, 1, 2, 3, ROOTS_END];

fn new_test_roots() -> Box<TestRoots> {
    Box::new(TestRoots {
        slots: [
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
        ],
    })
}

#[test]
fn allocation_storm_is_stable_across_full_gcs() {
    let rt = Runtime::new();
    let m = rt.attach_thread();
    let mut counts = Vec::new();
    for _ in 0..10 {
        {
            let _b = m.busy();
            for _ in 0..10 * page_capacity() {
                m.alloc_small_bin(b"storm");
            }
        }
        rt.gc_now(true);
        counts.push(rt.live_cell_count());
    }
    // everything allocated was garbage; what remains is newborn premark
    // noise bounded by one mark word per thread
    let lo = *counts.iter().min().unwrap();
    let hi = *counts.iter().max().unwrap();
    assert!(
        hi - lo <= 128,
        "reachable-cell count drifted: {:?}",
        counts
    );
    drop(m);
    rt.shutdown();
}

static DECREFS: AtomicI64 = AtomicI64::new(0);

unsafe fn counting_refct(_ptr: *mut u8, incref: bool) {
    if incref {
        DECREFS.fetch_add(1, Ordering::SeqCst);
    } else {
        DECREFS.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn foreign_release_runs_exactly_once() {
    let rt = Runtime::new();
    let m = rt.attach_thread();
    let rec = new_test_roots();

    let roots = {
        let _b = m.busy();
        unsafe {
            rt.register_roots(
                &m,
                rec.slots.as_ptr() as *mut u8,
                TEST_OFFSETS.as_ptr(),
                None,
            )
        }
    };

    {
        let _b = m.busy();
        let pin = m.alloc_foreign(std::ptr::null_mut(), counting_refct);
        unsafe { roots_slot_write(&m, roots, 0, Value::from_cell(pin)) };
    }
    rt.gc_now(false);
    assert_eq!(DECREFS.load(Ordering::SeqCst), 0, "pinned foreign released early");

    {
        let _b = m.busy();
        unsafe { roots_slot_write(&m, roots, 0, VOID) };
    }
    rt.gc_now(false);

    // the release callback runs on the decref worker, not on a GC thread
    let deadline = Instant::now() + Duration::from_secs(2);
    while DECREFS.load(Ordering::SeqCst) != -1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(DECREFS.load(Ordering::SeqCst), -1);

    // a further cycle must not release it again
    rt.gc_now(false);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(DECREFS.load(Ordering::SeqCst), -1);

    unsafe { roots_decref(roots) };
    rt.gc_now(false);
    drop(m);
    rt.shutdown();
}

#[test]
fn sixteen_hundred_bitstrings_round_trip() {
    let rt = Runtime::new();
    let m = rt.attach_thread();
    {
        let _b = m.busy();
        let mut sc = StemCell::new();
        let mut expected = Vec::new();
        for n in 1u64..1600 {
            let width = 64 - n.leading_zeros();
            for j in 0..width {
                let bit = (n >> j) & 1 == 1;
                sc.push_bit(&m, bit);
                expected.push(bit);
            }
        }
        assert_eq!(sc.stem_len(), expected.len() as u64);
        for (i, &bit) in expected.iter().enumerate().rev() {
            assert_eq!(sc.pop_bit(&m), Some(bit), "bit index {}", i);
        }
        assert!(sc.is_empty());
    }
    drop(m);
    rt.shutdown();
}

#[test]
fn deep_branch_chain_survives_then_leaves() {
    const DEPTH: usize = 1000;
    let rt = Runtime::new();
    let m = rt.attach_thread();
    let rec = new_test_roots();

    let (roots, cells) = {
        let _b = m.busy();
        let roots = unsafe {
            rt.register_roots(
                &m,
                rec.slots.as_ptr() as *mut u8,
                TEST_OFFSETS.as_ptr(),
                None,
            )
        };
        // anchor keeps the page alive after the chain dies, so its mark
        // bits stay readable
        let anchor = m.alloc_small_bin(b"anchor");
        unsafe { roots_slot_write(&m, roots, 1, Value::from_cell(anchor)) };

        let mut cells = Vec::with_capacity(DEPTH);
        let mut chain = UNIT;
        for _ in 0..DEPTH {
            let node = m.alloc_branch(EMPTY_STEM32, EMPTY_STEM32, chain, UNIT);
            cells.push(node);
            chain = Value::from_cell(node);
        }
        unsafe { roots_slot_write(&m, roots, 0, chain) };
        (roots, cells)
    };

    rt.gc_now(false);
    unsafe {
        for &cell in &cells {
            let page = Page::from_cell(cell);
            assert!((*page).marked_test(cell), "live chain cell unmarked");
        }
    }

    {
        let _b = m.busy();
        unsafe { roots_slot_write(&m, roots, 0, VOID) };
    }
    rt.gc_now(false);
    unsafe {
        for &cell in &cells {
            let page = Page::from_cell(cell);
            assert!((*page).marked_test(cell) == false, "dead chain cell still marked");
        }
    }

    // with the chain dead, its pages flow back toward `avail`
    rt.gc_now(false);
    assert!(rt.avail_pages() + rt.awaiting_pages() == rt.committed_pages());

    unsafe { roots_decref(roots) };
    rt.gc_now(false);
    drop(m);
    rt.shutdown();
}

#[test]
fn idle_cycles_are_idempotent() {
    let rt = Runtime::new();
    let m = rt.attach_thread();
    {
        let _b = m.busy();
        for _ in 0..100 {
            m.alloc_small_bin(b"idle");
        }
    }
    rt.gc_now(true);
    let first = rt.live_cell_count();
    rt.gc_now(true);
    let second = rt.live_cell_count();
    assert_eq!(first, second, "idle cycle changed the reachable count");
    drop(m);
    rt.shutdown();
}

#[test]
fn allocations_are_cell_aligned_and_in_page() {
    let rt = Runtime::new();
    let m = rt.attach_thread();
    {
        let _b = m.busy();
        for _ in 0..10_000 {
            let cell = m.alloc_small_bin(b"align");
            assert_eq!(cell as usize & 0b1_1111, 0);
            let page = unsafe { Page::from_cell(cell) };
            // from_cell checks the magic word in debug builds; also make
            // sure the page accounts the cell inside its cell array
            let index = unsafe { (*page).cell_index(cell) };
            assert!(index >= crate::page::FIRST_CELL_WORD * 64);
        }
    }
    drop(m);
    rt.shutdown();
}

#[test]
fn page_accounting_holds_at_rest() {
    let rt = Runtime::new();
    let m = rt.attach_thread();
    {
        let _b = m.busy();
        for _ in 0..3 * page_capacity() {
            m.alloc_small_bin(b"pages");
        }
    }
    rt.gc_now(true);
    assert_eq!(
        rt.avail_pages() + rt.awaiting_pages(),
        rt.committed_pages(),
        "page lists out of balance"
    );
    drop(m);
    rt.shutdown();
}

#[test]
fn parallel_mutators_survive_collections() {
    let rt = Runtime::new();
    let mut joins = Vec::new();
    for t in 0..4 {
        let rt = rt.clone();
        joins.push(std::thread::spawn(move || {
            let m = rt.attach_thread();
            for round in 0..50 {
                let _b = m.busy();
                let mut chain = UNIT;
                for i in 0..500 {
                    let payload =
                        Value::from_small_u64((t * 1_000_000 + round * 1000 + i) as u64).unwrap();
                    let node = m.alloc_branch(EMPTY_STEM32, EMPTY_STEM32, payload, chain);
                    chain = Value::from_cell(node);
                    if i % 64 == 0 {
                        m.safepoint();
                    }
                }
            }
            drop(m);
        }));
    }
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(10));
        rt.trigger_gc(false);
    }
    for j in joins {
        j.join().unwrap();
    }
    assert_eq!(rt.safepoint.busy_count(), 0);
    rt.gc_now(true);
    rt.shutdown();
}

#[test]
fn seal_data_clears_after_key_dies() {
    use crate::cell::Register;

    let rt = Runtime::new();
    let m = rt.attach_thread();
    let rec = new_test_roots();

    let (roots, seal) = {
        let _b = m.busy();
        let roots = unsafe {
            rt.register_roots(
                &m,
                rec.slots.as_ptr() as *mut u8,
                TEST_OFFSETS.as_ptr(),
                None,
            )
        };
        let reg = m.alloc_register();
        let tomb = unsafe { Value((*(reg as *mut Register)).tombstone.load(Ordering::Relaxed)) };
        let payload = m.alloc_small_bin(b"sealed payload");
        let seal = m.alloc_seal(tomb, Value::from_cell(payload), UNIT);
        unsafe {
            roots_slot_write(&m, roots, 0, Value::from_cell(seal));
            roots_slot_write(&m, roots, 1, Value::from_cell(reg));
        }
        (roots, seal)
    };

    rt.gc_now(false);
    unsafe {
        assert!(
            (*seal).slot_value(1).is_cell(),
            "seal data cleared while its key register lives"
        );
    }

    // kill the register; its death invalidates the tombstone, and the
    // following trace applies the ephemeron rule
    {
        let _b = m.busy();
        unsafe { roots_slot_write(&m, roots, 1, VOID) };
    }
    rt.gc_now(false);
    rt.gc_now(false);
    unsafe {
        assert!(
            (*seal).slot_value(1).is_void(),
            "dead key left the sealed data reachable"
        );
    }

    unsafe { roots_decref(roots) };
    rt.gc_now(false);
    drop(m);
    rt.shutdown();
}

#[test]
fn cell_slot_write_replaces_children() {
    use crate::barrier::cell_slot_write;

    let rt = Runtime::new();
    let m = rt.attach_thread();
    let rec = new_test_roots();

    {
        let _b = m.busy();
        let roots = unsafe {
            rt.register_roots(
                &m,
                rec.slots.as_ptr() as *mut u8,
                TEST_OFFSETS.as_ptr(),
                None,
            )
        };
        let old = Value::from_small_u64(1).unwrap();
        let arr = m.alloc_small_arr(&[old, old]);
        unsafe { roots_slot_write(&m, roots, 0, Value::from_cell(arr)) };

        let fresh = Value::from_cell(m.alloc_small_bin(b"fresh"));
        unsafe { cell_slot_write(&m, arr, 0, fresh) };
        unsafe {
            assert_eq!((*arr).slot_value(0), fresh);
            assert_eq!((*arr).slot_value(1), old);
        }
        unsafe { roots_decref(roots) };
    }
    rt.gc_now(false);
    drop(m);
    rt.shutdown();
}

#[test]
fn register_death_clears_tombstone_weak_slot() {
    use crate::cell::{Register, Tombstone};

    let rt = Runtime::new();
    let m = rt.attach_thread();
    let rec = new_test_roots();

    let (roots, tomb) = {
        let _b = m.busy();
        let roots = unsafe {
            rt.register_roots(
                &m,
                rec.slots.as_ptr() as *mut u8,
                TEST_OFFSETS.as_ptr(),
                None,
            )
        };
        let reg = m.alloc_register();
        let tomb = unsafe { Value((*(reg as *mut Register)).tombstone.load(Ordering::Relaxed)) };
        // root the tombstone but not the register
        unsafe {
            roots_slot_write(&m, roots, 0, tomb);
            roots_slot_write(&m, roots, 1, Value::from_cell(reg));
        }
        (roots, tomb)
    };

    rt.gc_now(false);
    let tomb_cell = tomb.cell() as *mut Tombstone;
    unsafe {
        assert!(
            !Value((*tomb_cell).weak.load(Ordering::Acquire)).is_void(),
            "weak slot cleared while the register is alive"
        );
    }

    {
        let _b = m.busy();
        unsafe { roots_slot_write(&m, roots, 1, VOID) };
    }
    rt.gc_now(false);
    unsafe {
        assert!(
            Value((*tomb_cell).weak.load(Ordering::Acquire)).is_void(),
            "dead register left its tombstone intact"
        );
    }

    unsafe { roots_decref(roots) };
    rt.gc_now(false);
    drop(m);
    rt.shutdown();
}
