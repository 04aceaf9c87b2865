//! # Shared Access
//!
//! The allocator itself has no internal locking. Defragmentation rewrites
//! the address behind every handle it moves, so nothing may allocate, free
//! or dereference concurrently with it.
//!
//! ## Thread Safety Model
//!
//! ```text
//! Thread A ──┐
//! Thread B ──┼──> SharedAllocator (one mutex) ──> DefragAllocator
//! Thread C ──┘
//! ```
//!
//! Confine an allocator to one thread, or put every entry point behind the
//! one mutex provided here.

mod shared;

pub use shared::SharedAllocator;
