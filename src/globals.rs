use core::time::Duration;

pub const CELL_SIZE: usize = 32;
pub const CELL_ALIGN_BITS: usize = 5;

pub const PAGE_SIZE: usize = 2 * 1024 * 1024;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);
pub const CELLS_PER_PAGE: usize = PAGE_SIZE / CELL_SIZE;

/// One bit per cell, 64 cells per mark word.
pub const MARK_WORDS_PER_PAGE: usize = CELLS_PER_PAGE / 64;

pub const HEAP_SIZE: usize = 128 * 1024 * 1024;
pub const PAGES_PER_HEAP: usize = HEAP_SIZE / PAGE_SIZE;

/// Page headers are aligned to this "card" granularity.
pub const CARD_SIZE: usize = 128;

pub const MAX_GC_WORKERS: usize = 8;
pub const GC_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cycle trigger heuristics: root growth and released-page thresholds.
pub const ROOT_GROWTH_TRIGGER: usize = 1024;
pub const RELEASED_PAGES_TRIGGER: usize = 32;

/// Largest integer whose sign-prefixed bitstring fits the inline BITS tag.
pub const GLAS_PTR_MAX_INT: u64 = (1 << 61) - 1;
