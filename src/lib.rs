//! Runtime heap and concurrent mark-sweep collector for the glas data
//! language: 32-byte tree cells in 2 MiB pages, lazy sweep folded into
//! allocation, snapshot-at-the-beginning write barriers, and a worker pool
//! tracing concurrently with the mutators.

pub mod barrier;
pub mod cell;
pub mod collector;
pub mod finalizer;
pub mod global_allocator;
pub mod globals;
pub mod heap;
pub mod marking;
pub mod mmap;
pub mod mutator;
pub mod page;
pub mod roots;
pub mod runtime;
pub mod safepoint;
pub mod stem;
pub mod util;
pub mod value;

pub use barrier::{cell_slot_write, roots_slot_write};
pub use cell::{Cell, CellTag, RefctFn, TypeAggr};
pub use finalizer::incref;
pub use mutator::{Mutator, MutatorRef, ThreadState, ERR_LINEARITY, ERR_UNDERFLOW};
pub use roots::{roots_decref, roots_incref, RootSet, ROOTS_END};
pub use runtime::Runtime;
pub use stem::{pair, unpair, StemCell};
pub use value::{Value, UNIT, VOID};

#[cfg(test)]
mod tests;
