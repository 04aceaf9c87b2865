//! # Handle Table
//!
//! Fixed-capacity indirection slots mapping a small integer to a mutable
//! arena offset.
//!
//! Unused slots form a singly linked free list threaded through the slots
//! themselves: each free slot stores the index of the next free one.
//! Slot 0 is reserved as the invalid handle and is never issued.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{AllocError, AllocResult};

/// Index of a handle slot. `0` is the invalid handle.
pub type HandleIndex = u32;

/// Process-unique identity of a [`HandleTable`].
///
/// Lets a pointer detect that it is being resolved against the wrong table.
pub type TableId = NonZeroU32;

static NEXT_TABLE_ID: AtomicU32 = AtomicU32::new(1);

/// One indirection slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    /// Slot 0.
    Reserved,
    /// Holds the current offset of a live object.
    Live(usize),
    /// Unused; links to the next unused slot.
    Free(Option<HandleIndex>),
}

/// A table of `amount_of_handles` slots, `amount_of_handles - 1` usable.
///
/// # Thread Safety
///
/// NOT thread-safe. Owned by exactly one allocator.
///
/// # Example
///
/// ```rust,ignore
/// let mut table = HandleTable::new(8);
///
/// let handle = table.next_free_handle()?;
/// table.set(handle, 256);
/// assert_eq!(table.get(handle), Some(256));
///
/// table.free_handle(handle)?;
/// ```
#[derive(Debug)]
pub struct HandleTable {
    id: TableId,
    slots: Box<[Slot]>,
    /// Head of the embedded free list.
    free_head: Option<HandleIndex>,
    /// Number of live handles.
    live_count: usize,
}

impl HandleTable {
    /// Creates a table with every usable slot on the free list.
    ///
    /// # Panics
    ///
    /// Panics if `amount_of_handles < 2`.
    #[must_use]
    pub fn new(amount_of_handles: u32) -> Self {
        assert!(amount_of_handles >= 2, "Handle table needs at least one usable slot");

        let slots: Vec<Slot> = (0..amount_of_handles)
            .map(|index| match index {
                0 => Slot::Reserved,
                _ if index + 1 < amount_of_handles => Slot::Free(Some(index + 1)),
                _ => Slot::Free(None),
            })
            .collect();

        let raw_id = NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed);
        let id = NonZeroU32::new(raw_id).unwrap_or(NonZeroU32::MIN);

        Self {
            id,
            slots: slots.into_boxed_slice(),
            free_head: Some(1),
            live_count: 0,
        }
    }

    /// Returns this table's identity.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    /// Number of usable slots (`amount_of_handles - 1`).
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of live handles.
    #[inline]
    #[must_use]
    pub const fn live_count(&self) -> usize {
        self.live_count
    }

    /// Number of handles still available.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.capacity() - self.live_count
    }

    /// Pops the head of the free list.
    ///
    /// The slot becomes live at offset 0 until the owner writes the real
    /// offset with [`set`](Self::set).
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfHandles`] when every usable slot is live.
    pub fn next_free_handle(&mut self) -> AllocResult<HandleIndex> {
        let index = self.free_head.ok_or(AllocError::OutOfHandles {
            capacity: self.capacity(),
        })?;

        let slot = &mut self.slots[index as usize];
        let Slot::Free(next) = *slot else {
            panic!("handle free list corrupted: slot {index} is {slot:?}");
        };
        *slot = Slot::Live(0);
        self.free_head = next;
        self.live_count += 1;

        Ok(index)
    }

    /// Pushes a live slot back onto the front of the free list.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidPointer`] if `index` is not live.
    pub fn free_handle(&mut self, index: HandleIndex) -> AllocResult<()> {
        if !self.is_live(index) {
            return Err(AllocError::InvalidPointer);
        }

        self.slots[index as usize] = Slot::Free(self.free_head);
        self.free_head = Some(index);
        self.live_count -= 1;
        Ok(())
    }

    /// Whether `index` names a live slot.
    #[inline]
    #[must_use]
    pub fn is_live(&self, index: HandleIndex) -> bool {
        matches!(self.slots.get(index as usize), Some(Slot::Live(_)))
    }

    /// Reads the offset stored in a live slot.
    #[inline]
    #[must_use]
    pub fn get(&self, index: HandleIndex) -> Option<usize> {
        match self.slots.get(index as usize)? {
            Slot::Live(offset) => Some(*offset),
            Slot::Reserved | Slot::Free(_) => None,
        }
    }

    /// Mutable access to the offset stored in a live slot.
    #[inline]
    pub fn get_mut(&mut self, index: HandleIndex) -> Option<&mut usize> {
        match self.slots.get_mut(index as usize)? {
            Slot::Live(offset) => Some(offset),
            Slot::Reserved | Slot::Free(_) => None,
        }
    }

    /// Rewrites the offset of a live slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not live.
    pub fn set(&mut self, index: HandleIndex, offset: usize) {
        match self.get_mut(index) {
            Some(slot) => *slot = offset,
            None => panic!("handle {index} is not live"),
        }
    }

    /// Iterates over live handles and their offsets.
    pub fn iter_live(&self) -> impl Iterator<Item = (HandleIndex, usize)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Live(offset) => Some((index as HandleIndex, *offset)),
            Slot::Reserved | Slot::Free(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_issued_in_order() {
        let mut table = HandleTable::new(4);
        assert_eq!(table.capacity(), 3);
        assert_eq!(table.next_free_handle().unwrap(), 1);
        assert_eq!(table.next_free_handle().unwrap(), 2);
        assert_eq!(table.next_free_handle().unwrap(), 3);
        assert_eq!(table.free_count(), 0);
    }

    #[test]
    fn test_zero_never_issued() {
        let mut table = HandleTable::new(10);
        let mut issued = Vec::new();
        while let Ok(handle) = table.next_free_handle() {
            issued.push(handle);
        }
        assert_eq!(issued.len(), 9);
        assert!(!issued.contains(&0));
        assert_eq!(table.get(0), None);
        assert_eq!(table.free_handle(0), Err(AllocError::InvalidPointer));
    }

    #[test]
    fn test_exhaustion() {
        let mut table = HandleTable::new(2);
        let _ = table.next_free_handle().unwrap();
        assert_eq!(
            table.next_free_handle(),
            Err(AllocError::OutOfHandles { capacity: 1 })
        );
    }

    #[test]
    fn test_freed_handle_reused_first() {
        let mut table = HandleTable::new(8);
        let a = table.next_free_handle().unwrap();
        let b = table.next_free_handle().unwrap();
        table.free_handle(a).unwrap();
        assert_eq!(table.next_free_handle().unwrap(), a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_and_get() {
        let mut table = HandleTable::new(4);
        let handle = table.next_free_handle().unwrap();
        table.set(handle, 4096);
        assert_eq!(table.get(handle), Some(4096));

        *table.get_mut(handle).unwrap() = 128;
        assert_eq!(table.get(handle), Some(128));
        assert_eq!(table.iter_live().collect::<Vec<_>>(), vec![(handle, 128)]);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut table = HandleTable::new(4);
        let handle = table.next_free_handle().unwrap();
        table.free_handle(handle).unwrap();
        assert_eq!(table.free_handle(handle), Err(AllocError::InvalidPointer));
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_tables_have_distinct_ids() {
        assert_ne!(HandleTable::new(2).id(), HandleTable::new(2).id());
    }

    #[test]
    #[should_panic(expected = "at least one usable slot")]
    fn test_single_slot_table_rejected() {
        let _ = HandleTable::new(1);
    }
}
