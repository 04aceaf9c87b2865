//! # UMA Core
//!
//! Defragmenting universal memory allocator.
//!
//! A general-purpose heap over one fixed arena that supports arbitrary-size,
//! arbitrary-order allocation and can compact its storage on demand without
//! invalidating the pointers clients hold.
//!
//! ## Architecture Rules
//!
//! 1. **One arena** - Memory comes from the parent allocator exactly once
//! 2. **Handles, not addresses** - Clients hold [`UaPtr`]s resolved on every access
//! 3. **Compaction is explicit** - Nothing moves unless `defragment*` is called
//! 4. **Single owner** - No internal locking; see [`SharedAllocator`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use uma_core::DefragAllocator;
//!
//! let mut heap = DefragAllocator::new(1024 * 1024, 4096)?;
//!
//! let mut scratch = heap.allocate_raw(512, 16)?;
//! let mesh = heap.allocate_with(256, |i| i as f32)?;
//!
//! heap.deallocate(&mut scratch)?;
//! heap.defragment();
//!
//! // `mesh` still resolves to the same data.
//! assert_eq!(heap.get_slice(&mesh).map(<[f32]>::len), Some(256));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::AllocatorConfig;
pub use error::{AllocError, AllocResult, ErrorKind};
pub use memory::{
    AllocationStats, Arena, BlockAllocator, DefragAllocator, HandleIndex, HandleTable,
    ParentAllocator, RelocationPath, SystemParent, UaPtr,
};
pub use sync::SharedAllocator;
