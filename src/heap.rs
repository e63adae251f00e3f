//! 128 MiB address-space reservations hosting up to 64 pages.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::globals::{HEAP_SIZE, PAGE_SIZE};
use crate::mmap::Mmap;
use crate::page::Page;
use crate::util::align_up;

pub struct Heap {
    map: Mmap,
    start: *mut u8,
    npages: usize,
    /// Bit set = page free to claim. The heap may be unmapped only when
    /// this equals its initial value again.
    free_mask: AtomicU64,
    initial_mask: u64,
    pub(crate) next: AtomicPtr<Heap>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Reserve a new heap. Alignment loss costs at most one page.
    pub fn try_reserve() -> Option<Box<Heap>> {
        let map = Mmap::reserve(HEAP_SIZE)?;
        let start = align_up(map.start() as usize, PAGE_SIZE);
        let npages = (map.start() as usize + HEAP_SIZE - start) / PAGE_SIZE;
        debug_assert!(npages >= 1 && npages <= 64);
        let mask = if npages == 64 { !0 } else { (1u64 << npages) - 1 };
        Some(Box::new(Heap {
            map,
            start: start as *mut u8,
            npages,
            free_mask: AtomicU64::new(mask),
            initial_mask: mask,
            next: AtomicPtr::new(null_mut()),
        }))
    }

    pub fn page_at(&self, index: usize) -> *mut Page {
        debug_assert!(index < self.npages);
        unsafe { self.start.add(index * PAGE_SIZE) as *mut Page }
    }

    pub fn contains(&self, p: *const u8) -> bool {
        let a = p as usize;
        a >= self.start as usize && a < self.start as usize + self.npages * PAGE_SIZE
    }

    /// Claim, commit and initialize one page, if any bit is free.
    pub fn claim_page(&self) -> Option<*mut Page> {
        let backoff = Backoff::new();
        loop {
            let mask = self.free_mask.load(Ordering::Relaxed);
            if mask == 0 {
                return None;
            }
            let bit = mask.trailing_zeros() as usize;
            if self
                .free_mask
                .compare_exchange_weak(
                    mask,
                    mask & !(1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let page = self.page_at(bit);
                self.map.commit(page as *mut u8, PAGE_SIZE);
                unsafe { Page::init(page, self as *const Heap as *mut Heap) };
                return Some(page);
            }
            backoff.spin();
        }
    }

    /// Return a page's physical memory to the OS and free its bit.
    pub fn release_page(&self, page: *mut Page) {
        debug_assert!(self.contains(page as *const u8));
        let bit = (page as usize - self.start as usize) / PAGE_SIZE;
        self.map.decommit(page as *mut u8, PAGE_SIZE);
        let prev = self.free_mask.fetch_or(1 << bit, Ordering::AcqRel);
        debug_assert!(prev & (1 << bit) == 0, "double release of page {:p}", page);
    }

    pub fn is_pristine(&self) -> bool {
        self.free_mask.load(Ordering::Acquire) == self.initial_mask
    }

    /// Visit every currently claimed page.
    pub fn for_each_claimed(&self, mut f: impl FnMut(*mut Page)) {
        let mask = self.free_mask.load(Ordering::Acquire);
        for bit in 0..self.npages {
            if mask & (1 << bit) == 0 {
                f(self.page_at(bit));
            }
        }
    }
}
