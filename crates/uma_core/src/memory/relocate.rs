//! # Relocation Thunks
//!
//! Type-erased move and drop routines, one pair per allocated element type.
//!
//! Every used chunk carries a [`Relocator`] built for the type it was
//! allocated with, so the chunk list itself stays untyped while
//! defragmentation still moves objects with the right semantics.
//!
//! ## Move policy
//!
//! ```text
//! !needs_drop::<T>()          -> Bitwise   one memmove over the whole range
//! ranges disjoint             -> Disjoint  one non-overlapping bulk move
//! ranges overlap              -> Staged    element by element through a
//!                                          stack temporary, ascending
//! ```

// SAFETY: This module reads and writes typed values inside the arena.
// Callers guarantee offsets point at live, correctly typed elements.
#![allow(unsafe_code)]

use std::any::TypeId;
use std::mem::{self, MaybeUninit};
use std::ptr;

use super::arena::Arena;
use super::block::MAX_ALIGNMENT;

/// Which branch of the move policy a relocation took.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocationPath {
    /// Plain memmove: the type has no drop glue.
    Bitwise,
    /// Source and destination do not overlap.
    Disjoint,
    /// Overlapping ranges, moved one element at a time through a temporary.
    Staged,
}

/// Post-monomorphization check that `T` fits the one-byte header offset.
struct AlignmentCheck<T>(std::marker::PhantomData<T>);

impl<T> AlignmentCheck<T> {
    const OK: () = assert!(mem::align_of::<T>() <= MAX_ALIGNMENT, "alignment exceeds 128");
}

type MoveFn = unsafe fn(src: *mut u8, dst: *mut u8, count: usize) -> RelocationPath;
type DropFn = unsafe fn(ptr: *mut u8, count: usize);

/// Move and drop capability for one element type.
#[derive(Clone, Copy)]
pub struct Relocator {
    type_id: TypeId,
    type_name: &'static str,
    elem_size: usize,
    alignment: usize,
    move_fn: MoveFn,
    drop_fn: DropFn,
}

impl std::fmt::Debug for Relocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relocator")
            .field("type", &self.type_name)
            .field("elem_size", &self.elem_size)
            .field("alignment", &self.alignment)
            .finish_non_exhaustive()
    }
}

impl Relocator {
    /// Builds the relocator for `T`.
    ///
    /// Fails to compile when `align_of::<T>()` exceeds [`MAX_ALIGNMENT`].
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        let () = AlignmentCheck::<T>::OK;
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            elem_size: mem::size_of::<T>(),
            alignment: mem::align_of::<T>(),
            move_fn: move_elements::<T>,
            drop_fn: drop_elements::<T>,
        }
    }

    /// Builds the relocator for an untyped byte allocation.
    ///
    /// Bytes are viewed as `u8`, but the requested alignment is kept so a
    /// relocated payload stays as aligned as it was allocated.
    #[must_use]
    pub fn raw(alignment: usize) -> Self {
        Self {
            alignment,
            ..Self::of::<u8>()
        }
    }

    /// Whether the elements are of type `T`.
    #[inline]
    #[must_use]
    pub fn holds<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Name of the element type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Alignment the payload must keep when moved.
    #[inline]
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Moves `count` elements from `src` to `dst` (`dst < src`).
    ///
    /// # Safety
    ///
    /// `src` must hold `count` live elements of this relocator's type, and
    /// `dst..dst + count * elem_size` must lie inside the arena. After the
    /// call the source slots are logically uninitialized.
    pub unsafe fn relocate(&self, arena: &mut Arena, src: usize, dst: usize, count: usize) -> RelocationPath {
        debug_assert!(dst < src, "relocation must move towards the arena start");
        let len = count * self.elem_size;
        assert!(src + len <= arena.capacity(), "relocation source out of bounds");
        (self.move_fn)(arena.ptr_at(src).as_ptr(), arena.ptr_at(dst).as_ptr(), count)
    }

    /// Drops `count` elements in place.
    ///
    /// # Safety
    ///
    /// `offset` must hold `count` live elements of this relocator's type,
    /// which must not be used afterwards.
    pub unsafe fn drop_in_place(&self, arena: &mut Arena, offset: usize, count: usize) {
        (self.drop_fn)(arena.ptr_at(offset).as_ptr(), count);
    }
}

unsafe fn move_elements<T>(src: *mut u8, dst: *mut u8, count: usize) -> RelocationPath {
    let len = count * mem::size_of::<T>();
    if !mem::needs_drop::<T>() {
        ptr::copy(src, dst, len);
        return RelocationPath::Bitwise;
    }

    let src = src.cast::<T>();
    let dst = dst.cast::<T>();
    if (dst as usize) + len <= src as usize {
        ptr::copy_nonoverlapping(src, dst, count);
        return RelocationPath::Disjoint;
    }

    // Each source slot is dead once read into the temporary, so the write
    // below may clobber it. Ascending order never overwrites an unread slot.
    for i in 0..count {
        let mut staged = MaybeUninit::<T>::uninit();
        staged.write(src.add(i).read());
        dst.add(i).write(staged.assume_init());
    }
    RelocationPath::Staged
}

unsafe fn drop_elements<T>(ptr: *mut u8, count: usize) {
    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr.cast::<T>(), count));
}

/// Writes `count` values from `items` at `offset`.
///
/// On unwind, elements already written are dropped.
///
/// # Panics
///
/// Panics if the range leaves the arena or `items` runs short.
pub(crate) fn construct_from<T, I>(arena: &mut Arena, offset: usize, count: usize, items: I)
where
    I: Iterator<Item = T>,
{
    struct Partial<T> {
        base: *mut T,
        written: usize,
    }

    impl<T> Drop for Partial<T> {
        fn drop(&mut self) {
            // SAFETY: Exactly `written` elements were initialized.
            unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.base, self.written)) }
        }
    }

    assert!(
        offset + count * mem::size_of::<T>() <= arena.capacity(),
        "construction range out of bounds"
    );
    let base = arena.ptr_at(offset).as_ptr().cast::<T>();
    debug_assert_eq!(base as usize % mem::align_of::<T>(), 0);

    let mut partial = Partial { base, written: 0 };
    for item in items.take(count) {
        // SAFETY: In bounds (checked above), aligned, and not yet initialized.
        unsafe { base.add(partial.written).write(item) };
        partial.written += 1;
    }
    assert_eq!(partial.written, count, "iterator yielded fewer items than requested");
    mem::forget(partial);
}

/// Views `count` elements at `offset`.
///
/// # Safety
///
/// `offset` must hold `count` live, initialized `T`s that stay untouched
/// for the lifetime of the returned slice.
pub(crate) unsafe fn slice_at<T>(arena: &Arena, offset: usize, count: usize) -> &[T] {
    std::slice::from_raw_parts(arena.ptr_at(offset).as_ptr().cast::<T>(), count)
}

/// Mutable counterpart of [`slice_at`].
///
/// # Safety
///
/// Same as [`slice_at`], and no other reference to the range may exist.
pub(crate) unsafe fn slice_at_mut<T>(arena: &mut Arena, offset: usize, count: usize) -> &mut [T] {
    std::slice::from_raw_parts_mut(arena.ptr_at(offset).as_ptr().cast::<T>(), count)
}
