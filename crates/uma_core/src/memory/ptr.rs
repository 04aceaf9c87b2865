//! # Indirect Pointer
//!
//! A `(table, handle)` pair standing in for a raw pointer. Every access goes
//! through the owning allocator's handle table, so the object can move
//! during defragmentation without the pointer changing.
//!
//! ## Stale pointers
//!
//! Handles carry no generation counter. Copies of a pointer are not
//! invalidated when the allocation is freed through another copy, and once
//! the slot is reused by a later allocation of the same type they resolve to
//! the new occupant. Keep one owning copy and let `deallocate` invalidate it.

use std::marker::PhantomData;

use super::defrag::DefragAllocator;
use super::handle::{HandleIndex, TableId};

/// Handle-backed reference to `T` elements in a [`DefragAllocator`].
///
/// Does not own the pointee; copying is shallow.
pub struct UaPtr<T> {
    table: Option<TableId>,
    handle: HandleIndex,
    _marker: PhantomData<fn() -> T>,
}

// Manual implementations to avoid T: Copy/Clone bounds
impl<T> Copy for UaPtr<T> {}

impl<T> Clone for UaPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for UaPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.handle == other.handle
    }
}

impl<T> Eq for UaPtr<T> {}

impl<T> std::hash::Hash for UaPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.handle.hash(state);
    }
}

impl<T> std::fmt::Debug for UaPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaPtr")
            .field("table", &self.table)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T> Default for UaPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> UaPtr<T> {
    pub(crate) const fn new(table: TableId, handle: HandleIndex) -> Self {
        Self {
            table: Some(table),
            handle,
            _marker: PhantomData,
        }
    }

    /// A pointer that references nothing.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            table: None,
            handle: 0,
            _marker: PhantomData,
        }
    }

    /// True iff both the table reference and the handle are set.
    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.table.is_some() && self.handle != 0
    }

    /// Clears both fields. Does NOT free the allocation.
    #[inline]
    pub fn invalidate(&mut self) {
        self.table = None;
        self.handle = 0;
    }

    /// The handle slot index (0 when invalid).
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> HandleIndex {
        self.handle
    }

    /// The owning table, if any.
    #[inline]
    #[must_use]
    pub const fn table(&self) -> Option<TableId> {
        self.table
    }

    /// Reinterprets the pointee type, keeping the same handle.
    ///
    /// Unchecked here; dereferencing through the allocator only succeeds if
    /// `U` is the element type the allocation was made with.
    #[inline]
    #[must_use]
    pub const fn cast<U>(self) -> UaPtr<U> {
        UaPtr {
            table: self.table,
            handle: self.handle,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> UaPtr<T> {
    /// Resolves to the first element. Shorthand for [`DefragAllocator::get`].
    #[inline]
    #[must_use]
    pub fn get<'a>(&self, allocator: &'a DefragAllocator) -> Option<&'a T> {
        allocator.get(self)
    }

    /// Resolves to the first element mutably.
    #[inline]
    pub fn get_mut<'a>(&self, allocator: &'a mut DefragAllocator) -> Option<&'a mut T> {
        allocator.get_mut(self)
    }

    /// Resolves to element `index`.
    #[inline]
    #[must_use]
    pub fn at<'a>(&self, allocator: &'a DefragAllocator, index: usize) -> Option<&'a T> {
        allocator.get_slice(self)?.get(index)
    }
}
