//! Heap management and garbage collection for managed-object runtimes.
//!
//! The heap is a collection of spaces (free-list, bump pointer, region,
//! large object, plus immune image and zygote spaces) driven by one of four
//! collectors: mark sweep (optionally concurrent), semi space, mark compact
//! and concurrent copying. A card table and mod-union tables let partial and
//! sticky cycles skip the immune and old parts of the heap.
//!
//! Threads attach to the heap as [mutator::Mutator]s and allocate through
//! [mutator::MutatorRef::allocate]; on-stack references are rooted with
//! [letroot!].

pub mod api;
pub mod bitmap;
pub mod bump_pointer_space;
pub mod card_table;
pub mod collector;
pub mod freelist_space;
pub mod gcref;
pub mod heap;
pub mod image_space;
pub mod large_space;
pub mod mod_union_table;
pub mod mutator;
pub mod object_stack;
pub mod region_space;
pub mod safepoint;
pub mod shadow_stack;
pub mod space;
pub mod statistics;
pub mod task_processor;
pub mod tlab;
pub mod utils;
pub mod zygote_space;

#[cfg(test)]
mod tests;

pub use api::{Collectable, Gc, Trace, Visitor};
pub use collector::{CollectorType, GcType};
pub use gcref::{RefKind, WeakRef};
pub use heap::{Heap, HeapConfig, ProcessState};
pub use mutator::{JoinData, Mutator, MutatorRef};
pub use statistics::{GcCause, HeapStatistics};

// letroot! expands to trait object casts through mopa.
pub use mopa;
