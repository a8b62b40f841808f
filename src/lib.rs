//! Concurrent, non-moving mark-sweep garbage collector with a
//! size-segregated span allocator.
//!
//! Memory comes from a single address-space reservation carved into 8 KiB
//! pages. Small objects are served from spans of one size class through a
//! per-thread cache, large objects get spans of their own. Marking runs
//! concurrently with the mutators behind an insertion write barrier
//! that greys every stored pointer, and spans are swept lazily as
//! allocation reaches them. A pacer starts cycles early enough to finish
//! before the heap reaches its goal, and a scavenger hands idle pages back
//! to the OS.
//!
//! ```no_run
//! use spangc::{Collector, GcOptions};
//!
//! let collector = Collector::new(GcOptions::default()).unwrap();
//! let mut mutator = collector.mutator();
//! let pair = mutator.alloc(16, true);
//! mutator.push_root(pair);
//! let leaf = mutator.alloc(64, false);
//! mutator.write_ptr(pair, 0, leaf);
//! mutator.gc();
//! assert!(collector.heap().is_allocated(leaf));
//! ```

pub mod base;
pub mod collector;
pub mod fatal;
pub mod heap;
pub mod sync;
pub mod utils;

pub use base::formatted_size;
pub use collector::Collector;
pub use heap::{
    finalizer::{Cleanup, SpecialError},
    heap::{GlobalRoot, Heap, RootSource},
    heap_bits::PointerLayout,
    mutator::Mutator,
    options::{DebugOptions, GcOptions},
    stats::{GcCause, MemStats},
    Address, GcPhase,
};

#[cfg(test)]
pub mod tests;
