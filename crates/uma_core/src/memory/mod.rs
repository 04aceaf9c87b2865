//! # Memory Management
//!
//! The defragmenting allocator and the pieces it is built from, leaf-first:
//!
//! 1. [`Arena`] - one fixed byte region obtained from a parent allocator
//! 2. [`BlockAllocator`] - first-fit free list with eager coalescing
//! 3. [`HandleTable`] - indirection slots with an embedded free list
//! 4. [`UaPtr`] - a handle-backed pointer that survives relocation
//! 5. [`DefragAllocator`] - the composition, plus on-demand compaction
//!
//! ## Design Philosophy
//!
//! The arena is allocated once. Clients never hold addresses, only handles,
//! so the allocator is free to slide live objects towards the arena start
//! whenever fragmentation gets in the way.

mod arena;
mod block;
mod defrag;
mod handle;
mod ptr;
mod relocate;
mod stats;

pub use arena::{Arena, ParentAllocator, SystemParent, ARENA_ALIGNMENT};
pub use block::{
    align_up, check_alignment, AllocationHeader, BlockAllocator, BlockInfo, FreeBlock,
    HEADER_SIZE, MAX_ALIGNMENT, MIN_BLOCK_SIZE,
};
pub use defrag::DefragAllocator;
pub use handle::{HandleIndex, HandleTable, TableId};
pub use ptr::UaPtr;
pub use relocate::{RelocationPath, Relocator};
pub use stats::AllocationStats;
