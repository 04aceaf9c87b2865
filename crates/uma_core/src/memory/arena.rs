//! # Arena
//!
//! The single fixed-size byte region every allocation lives in.
//!
//! The arena is requested once from a [`ParentAllocator`] and returned to it
//! on drop. Everything above this module speaks in byte offsets; raw
//! addresses only appear at the public edge of the allocator.

// SAFETY: This module owns the raw arena pointer.
// Every access is bounds-checked against `capacity` before dereferencing.
#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use bytemuck::Pod;

use crate::error::{AllocError, AllocResult};

/// Alignment of the arena base. Equal to the largest supported allocation
/// alignment, so an offset's alignment is the address's alignment.
pub const ARENA_ALIGNMENT: usize = 128;

/// Source of the arena's backing memory.
///
/// Any allocator exposing a layout-based allocate/deallocate pair qualifies.
pub trait ParentAllocator: Send {
    /// Returns zero-filled memory for `layout`, or `None` if exhausted.
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns memory obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this parent with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// Parent backed by the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemParent;

impl ParentAllocator for SystemParent {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: Arena layouts always have a non-zero size.
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        dealloc(ptr.as_ptr(), layout);
    }
}

/// A fixed byte region owned by one allocator.
///
/// # Thread Safety
///
/// The arena is `Send` (it owns its bytes) but not `Sync`.
pub struct Arena {
    /// Base of the region.
    base: NonNull<u8>,
    /// Layout the region was requested with.
    layout: Layout,
    /// Where the region goes back to.
    parent: Box<dyn ParentAllocator>,
}

// SAFETY: The arena exclusively owns its region; the parent is `Send`.
unsafe impl Send for Arena {}

impl Arena {
    /// Requests `capacity` zeroed bytes from the global allocator.
    ///
    /// # Errors
    ///
    /// See [`with_parent`](Self::with_parent).
    pub fn new(capacity: usize) -> AllocResult<Self> {
        Self::with_parent(capacity, SystemParent)
    }

    /// Requests `capacity` zeroed bytes from `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] for a zero or unrepresentable
    /// capacity and [`AllocError::OutOfMemory`] if the parent refuses.
    pub fn with_parent<P>(capacity: usize, mut parent: P) -> AllocResult<Self>
    where
        P: ParentAllocator + 'static,
    {
        if capacity == 0 {
            return Err(AllocError::InvalidConfig("arena capacity must be > 0".into()));
        }
        let layout = Layout::from_size_align(capacity, ARENA_ALIGNMENT)
            .map_err(|e| AllocError::InvalidConfig(e.to_string()))?;
        let base = parent.allocate(layout).ok_or(AllocError::OutOfMemory {
            requested: capacity,
            alignment: ARENA_ALIGNMENT,
        })?;

        Ok(Self {
            base,
            layout,
            parent: Box::new(parent),
        })
    }

    /// Returns the total capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the base address of the region.
    #[inline]
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Returns the address of `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` lies past the end of the arena.
    #[inline]
    #[must_use]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.capacity(), "arena offset {offset} out of bounds");
        // SAFETY: offset <= capacity, so the result stays inside (or one past) the region.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Converts an address back into an offset, if it lies inside the arena.
    #[must_use]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let start = self.base.as_ptr() as usize;
        let address = ptr as usize;
        (address >= start && address < start + self.capacity()).then(|| address - start)
    }

    #[inline]
    fn check_range(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            end.is_some_and(|end| end <= self.capacity()),
            "arena range {offset}+{len} out of bounds (capacity {})",
            self.capacity()
        );
    }

    /// Reads a plain-data value stored (possibly unaligned) at `offset`.
    #[must_use]
    pub fn read<T: Pod>(&self, offset: usize) -> T {
        self.check_range(offset, std::mem::size_of::<T>());
        // SAFETY: Range checked above; `T: Pod` accepts any bit pattern.
        unsafe { self.base.as_ptr().add(offset).cast::<T>().read_unaligned() }
    }

    /// Writes a plain-data value (possibly unaligned) at `offset`.
    pub fn write<T: Pod>(&mut self, offset: usize, value: T) {
        self.check_range(offset, std::mem::size_of::<T>());
        // SAFETY: Range checked above and we hold `&mut self`.
        unsafe { self.base.as_ptr().add(offset).cast::<T>().write_unaligned(value) }
    }

    /// Fills `len` bytes at `offset` with zero.
    pub fn zero(&mut self, offset: usize, len: usize) {
        self.check_range(offset, len);
        // SAFETY: Range checked above and we hold `&mut self`.
        unsafe { std::ptr::write_bytes(self.base.as_ptr().add(offset), 0, len) }
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.check_range(src, len);
        self.check_range(dst, len);
        // SAFETY: Both ranges checked above; `copy` is memmove.
        unsafe {
            std::ptr::copy(
                self.base.as_ptr().add(src),
                self.base.as_ptr().add(dst),
                len,
            );
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: `base` came from `parent.allocate(self.layout)`.
        unsafe { self.parent.deallocate(self.base, self.layout) }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_arena_is_zeroed_and_aligned() {
        let arena = Arena::new(256).unwrap();
        assert_eq!(arena.capacity(), 256);
        assert_eq!(arena.base().as_ptr() as usize % ARENA_ALIGNMENT, 0);
        assert_eq!(arena.read::<u64>(0), 0);
        assert_eq!(arena.read::<u64>(248), 0);
    }

    #[test]
    fn test_read_write_unaligned() {
        let mut arena = Arena::new(64).unwrap();
        arena.write::<u64>(3, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(arena.read::<u64>(3), 0xDEAD_BEEF_CAFE_F00D);

        arena.zero(3, 8);
        assert_eq!(arena.read::<u64>(3), 0);
    }

    #[test]
    fn test_copy_within_overlapping() {
        let mut arena = Arena::new(64).unwrap();
        for i in 0..16u8 {
            arena.write::<u8>(8 + i as usize, i);
        }
        arena.copy_within(8, 4, 16);
        for i in 0..16u8 {
            assert_eq!(arena.read::<u8>(4 + i as usize), i);
        }
    }

    #[test]
    fn test_offset_of() {
        let arena = Arena::new(32).unwrap();
        let ptr = arena.ptr_at(10);
        assert_eq!(arena.offset_of(ptr.as_ptr()), Some(10));
        assert_eq!(arena.offset_of(std::ptr::null()), None);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_read_panics() {
        let arena = Arena::new(16).unwrap();
        let _ = arena.read::<u64>(12);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(Arena::new(0), Err(AllocError::InvalidConfig(_))));
    }

    struct CountingParent {
        live: Arc<AtomicUsize>,
    }

    impl ParentAllocator for CountingParent {
        fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
            self.live.fetch_add(1, Ordering::SeqCst);
            SystemParent.allocate(layout)
        }

        unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            SystemParent.deallocate(ptr, layout);
        }
    }

    #[test]
    fn test_arena_returns_memory_to_parent() {
        let live = Arc::new(AtomicUsize::new(0));
        let arena = Arena::with_parent(128, CountingParent { live: Arc::clone(&live) }).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(arena);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    struct RefusingParent;

    impl ParentAllocator for RefusingParent {
        fn allocate(&mut self, _layout: Layout) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&mut self, _ptr: NonNull<u8>, _layout: Layout) {}
    }

    #[test]
    fn test_refusing_parent() {
        assert!(matches!(
            Arena::with_parent(64, RefusingParent),
            Err(AllocError::OutOfMemory { requested: 64, .. })
        ));
    }
}
