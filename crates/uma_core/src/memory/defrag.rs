//! # Defragmenting Allocator
//!
//! Composes the [`BlockAllocator`] and [`HandleTable`] into a client-facing
//! heap that hands out [`UaPtr`]s and can compact its arena on demand.
//!
//! ## Compaction
//!
//! ```text
//! before:  [A][ free ][C][free][D][     free      ]
//! step 1:  [A][C][     free   ][D][     free      ]   C slides down
//! step 2:  [A][C][D][            free             ]   D slides down
//! ```
//!
//! Each step moves the first chunk (in address order) that has free space
//! directly before it, then rewrites its handle slot. Outstanding pointers
//! only hold the handle, so they stay valid.

// SAFETY: Typed views into the arena are created here.
// Each one is checked against the chunk's recorded element type and count.
#![allow(unsafe_code)]

use std::ptr::NonNull;

use bytemuck::Pod;

use super::arena::{Arena, ParentAllocator};
use super::block::{check_alignment, BlockAllocator};
use super::handle::{HandleIndex, HandleTable};
use super::ptr::UaPtr;
use super::relocate::{self, Relocator};
use super::stats::AllocationStats;
use crate::config::AllocatorConfig;
use crate::error::{AllocError, AllocResult};

/// Bookkeeping for one live allocation.
#[derive(Debug, Clone, Copy)]
struct UsedChunk {
    handle: HandleIndex,
    /// Payload bytes.
    size: usize,
    /// Number of elements.
    count: usize,
    relocator: Relocator,
}

/// A general-purpose heap whose allocations can be moved.
///
/// # Thread Safety
///
/// NOT thread-safe. Defragmentation rewrites every handle it moves, so all
/// access must be serialized; see [`SharedAllocator`](crate::SharedAllocator).
///
/// # Example
///
/// ```rust,ignore
/// let mut heap = DefragAllocator::new(64 * 1024, 256)?;
///
/// let mesh = heap.allocate_with(128, |i| Vertex::at(i))?;
/// heap.defragment();
///
/// // Still the same vertices, possibly at a new address.
/// let first = heap.get(&mesh);
/// ```
pub struct DefragAllocator {
    blocks: BlockAllocator,
    handles: HandleTable,
    /// Live allocations, ascending by payload offset.
    chunks: Vec<UsedChunk>,
    config: AllocatorConfig,
    stats: AllocationStats,
}

impl DefragAllocator {
    /// Creates an allocator with `arena_bytes` of storage and
    /// `handle_count` slots (`handle_count - 1` usable).
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidConfig`] for unusable sizes and
    /// [`AllocError::OutOfMemory`] if the arena cannot be obtained.
    pub fn new(arena_bytes: usize, handle_count: u32) -> AllocResult<Self> {
        Self::from_config(&AllocatorConfig::new(arena_bytes, handle_count))
    }

    /// Creates an allocator from a validated config.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn from_config(config: &AllocatorConfig) -> AllocResult<Self> {
        config.validate()?;
        Self::with_arena(config, Arena::new(config.arena_bytes)?)
    }

    /// Creates an allocator whose arena comes from `parent`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_parent<P>(config: &AllocatorConfig, parent: P) -> AllocResult<Self>
    where
        P: ParentAllocator + 'static,
    {
        config.validate()?;
        Self::with_arena(config, Arena::with_parent(config.arena_bytes, parent)?)
    }

    fn with_arena(config: &AllocatorConfig, arena: Arena) -> AllocResult<Self> {
        let mut blocks = BlockAllocator::new(arena);
        blocks.set_zero_on_free(config.zero_on_free);

        tracing::debug!(
            arena_bytes = config.arena_bytes,
            handle_count = config.handle_count,
            "defragmenting allocator created"
        );

        Ok(Self {
            blocks,
            handles: HandleTable::new(config.handle_count),
            chunks: Vec::new(),
            config: config.clone(),
            stats: AllocationStats::default(),
        })
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    /// Reserves `amount_of_bytes` zeroed bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfHandles`], [`AllocError::OutOfMemory`], or an
    /// invalid-operation error for a zero size or bad alignment. Nothing is
    /// reserved when an error is returned.
    pub fn allocate_raw(&mut self, amount_of_bytes: usize, alignment: usize) -> AllocResult<UaPtr<u8>> {
        check_alignment(alignment)?;
        self.ensure_handle_available()?;

        let offset = self
            .blocks
            .allocate(amount_of_bytes, alignment)
            .map_err(|e| self.note_failure(e))?;
        self.blocks.arena_mut().zero(offset, amount_of_bytes);

        Ok(self.register(offset, amount_of_bytes, amount_of_bytes, Relocator::raw(alignment)))
    }

    /// Reserves a raw allocation holding a copy of `bytes`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate_raw`](Self::allocate_raw).
    pub fn allocate_raw_from(&mut self, bytes: &[u8], alignment: usize) -> AllocResult<UaPtr<u8>> {
        let ptr = self.allocate_raw(bytes.len(), alignment)?;
        if let Some(dst) = self.raw_bytes_mut(&ptr) {
            dst.copy_from_slice(bytes);
        }
        Ok(ptr)
    }

    /// Moves `value` into the arena.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfHandles`] or [`AllocError::OutOfMemory`];
    /// [`AllocError::ZeroSizedAllocation`] for zero-sized `T`. On error
    /// `value` is dropped.
    pub fn allocate<T: Send + 'static>(&mut self, value: T) -> AllocResult<UaPtr<T>> {
        self.allocate_typed(1, std::iter::once(value))
    }

    /// Allocates `count` elements, building element `i` with `init(i)`.
    ///
    /// If `init` panics, elements built so far are dropped and the
    /// reservation is released before the panic propagates.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate); `count == 0` is rejected.
    pub fn allocate_with<T, F>(&mut self, count: usize, init: F) -> AllocResult<UaPtr<T>>
    where
        T: Send + 'static,
        F: FnMut(usize) -> T,
    {
        self.allocate_typed(count, (0..count).map(init))
    }

    /// Allocates a clone of every element of `items`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate_with`](Self::allocate_with).
    pub fn allocate_slice<T>(&mut self, items: &[T]) -> AllocResult<UaPtr<T>>
    where
        T: Clone + Send + 'static,
    {
        self.allocate_typed(items.len(), items.iter().cloned())
    }

    /// Allocates `count` default-constructed elements.
    ///
    /// # Errors
    ///
    /// Same as [`allocate_with`](Self::allocate_with).
    pub fn allocate_default<T>(&mut self, count: usize) -> AllocResult<UaPtr<T>>
    where
        T: Default + Send + 'static,
    {
        self.allocate_with(count, |_| T::default())
    }

    fn allocate_typed<T, I>(&mut self, count: usize, items: I) -> AllocResult<UaPtr<T>>
    where
        T: Send + 'static,
        I: Iterator<Item = T>,
    {
        let relocator = Relocator::of::<T>();
        self.ensure_handle_available()?;

        let offset = self
            .blocks
            .allocate_from(count, items)
            .map_err(|e| self.note_failure(e))?;

        Ok(self
            .register(offset, count * std::mem::size_of::<T>(), count, relocator)
            .cast())
    }

    fn ensure_handle_available(&mut self) -> AllocResult<()> {
        if self.handles.free_count() == 0 {
            return Err(self.note_failure(AllocError::OutOfHandles {
                capacity: self.handles.capacity(),
            }));
        }
        Ok(())
    }

    fn note_failure(&mut self, error: AllocError) -> AllocError {
        if error.is_recoverable() {
            self.stats.record_failure();
            tracing::warn!(%error, free_bytes = self.blocks.free_bytes(), "allocation failed");
        }
        error
    }

    /// Assigns a handle to a freshly reserved payload and records its chunk.
    fn register(&mut self, offset: usize, size: usize, count: usize, relocator: Relocator) -> UaPtr<u8> {
        let handle = match self.handles.next_free_handle() {
            Ok(handle) => handle,
            Err(error) => panic!("handle reserved before allocation vanished: {error}"),
        };
        self.handles.set(handle, offset);

        let position = self.chunks.partition_point(|c| self.handles.get(c.handle) < Some(offset));
        self.chunks.insert(
            position,
            UsedChunk {
                handle,
                size,
                count,
                relocator,
            },
        );

        self.stats.record_allocation(self.blocks.used_bytes());
        tracing::trace!(handle, offset, size, ty = relocator.type_name(), "allocated");

        UaPtr::new(self.handles.id(), handle)
    }

    // ========================================================================
    // DEALLOCATION
    // ========================================================================

    /// Drops the pointee, releases its memory and handle, and invalidates
    /// `ptr`.
    ///
    /// The destructor of the element type recorded at allocation runs,
    /// whatever `T` the pointer was cast to. Raw allocations have none.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidPointer`] if `ptr` is invalid, belongs to another
    /// allocator, or was already freed through a copy.
    pub fn deallocate<T>(&mut self, ptr: &mut UaPtr<T>) -> AllocResult<()> {
        let (index, offset) = self.locate(ptr).ok_or(AllocError::InvalidPointer)?;
        let chunk = self.chunks.remove(index);
        if let Err(error) = self.handles.free_handle(chunk.handle) {
            panic!("chunk handle {} not live in table: {error}", chunk.handle);
        }
        ptr.invalidate();
        self.stats.record_deallocation();
        tracing::trace!(handle = chunk.handle, offset, size = chunk.size, "deallocated");

        // Bookkeeping is already consistent, so a panicking destructor
        // unwinds through a heap that only has to release the block.
        let released = self.blocks.deallocate_after(offset, |arena| {
            // SAFETY: The chunk records `count` live elements of the
            // relocator's type at `offset`; it is unlinked from every table.
            unsafe { chunk.relocator.drop_in_place(arena, offset, chunk.count) }
        });
        if let Err(error) = released {
            panic!("block header for handle {} corrupted: {error}", chunk.handle);
        }
        Ok(())
    }

    /// Finds the chunk index and payload offset for a pointer.
    fn locate<T>(&self, ptr: &UaPtr<T>) -> Option<(usize, usize)> {
        if !ptr.is_valid() || ptr.table() != Some(self.handles.id()) {
            return None;
        }
        let offset = self.handles.get(ptr.handle())?;
        let index = self
            .chunks
            .binary_search_by_key(&offset, |c| self.chunk_offset(c))
            .unwrap_or_else(|_| panic!("live handle {} has no used chunk", ptr.handle()));
        assert_eq!(
            self.chunks[index].handle,
            ptr.handle(),
            "used chunk at offset {offset} belongs to another handle"
        );
        Some((index, offset))
    }

    fn chunk_offset(&self, chunk: &UsedChunk) -> usize {
        match self.handles.get(chunk.handle) {
            Some(offset) => offset,
            None => panic!("used chunk refers to dead handle {}", chunk.handle),
        }
    }

    // ========================================================================
    // ACCESS
    // ========================================================================

    /// Resolves `ptr` to its first element.
    ///
    /// Returns `None` if the pointer is invalid, stale, foreign, or `T` is
    /// not the element type it was allocated with.
    #[must_use]
    pub fn get<T: 'static>(&self, ptr: &UaPtr<T>) -> Option<&T> {
        self.get_slice(ptr)?.first()
    }

    /// Resolves `ptr` to its first element mutably.
    pub fn get_mut<T: 'static>(&mut self, ptr: &UaPtr<T>) -> Option<&mut T> {
        self.get_slice_mut(ptr)?.first_mut()
    }

    /// Resolves `ptr` to all of its elements.
    #[must_use]
    pub fn get_slice<T: 'static>(&self, ptr: &UaPtr<T>) -> Option<&[T]> {
        let (index, offset) = self.locate(ptr)?;
        let chunk = &self.chunks[index];
        if !chunk.relocator.holds::<T>() {
            return None;
        }
        // SAFETY: The chunk holds `count` live `T`s at `offset` (type checked
        // above) and `&self` keeps them from moving or being freed.
        Some(unsafe { relocate::slice_at(self.blocks.arena(), offset, chunk.count) })
    }

    /// Resolves `ptr` to all of its elements mutably.
    pub fn get_slice_mut<T: 'static>(&mut self, ptr: &UaPtr<T>) -> Option<&mut [T]> {
        let (index, offset) = self.locate(ptr)?;
        let chunk = self.chunks[index];
        if !chunk.relocator.holds::<T>() {
            return None;
        }
        // SAFETY: As in `get_slice`; `&mut self` makes the view exclusive.
        Some(unsafe { relocate::slice_at_mut(self.blocks.arena_mut(), offset, chunk.count) })
    }

    /// The bytes of a raw allocation.
    #[must_use]
    pub fn raw_bytes(&self, ptr: &UaPtr<u8>) -> Option<&[u8]> {
        self.get_slice(ptr)
    }

    /// The bytes of a raw allocation, mutably.
    pub fn raw_bytes_mut(&mut self, ptr: &UaPtr<u8>) -> Option<&mut [u8]> {
        self.get_slice_mut(ptr)
    }

    /// Views a raw allocation as plain-data values.
    ///
    /// `None` if the length or alignment does not fit `T`.
    #[must_use]
    pub fn view_pod<T: Pod>(&self, ptr: &UaPtr<u8>) -> Option<&[T]> {
        bytemuck::try_cast_slice(self.raw_bytes(ptr)?).ok()
    }

    /// Views a raw allocation as mutable plain-data values.
    pub fn view_pod_mut<T: Pod>(&mut self, ptr: &UaPtr<u8>) -> Option<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.raw_bytes_mut(ptr)?).ok()
    }

    /// Current arena offset of the pointee.
    #[must_use]
    pub fn offset_of<T>(&self, ptr: &UaPtr<T>) -> Option<usize> {
        self.locate(ptr).map(|(_, offset)| offset)
    }

    /// Current raw address of the pointee. Changes when it is relocated.
    #[must_use]
    pub fn address_of<T>(&self, ptr: &UaPtr<T>) -> Option<NonNull<u8>> {
        self.offset_of(ptr).map(|offset| self.blocks.arena().ptr_at(offset))
    }

    // ========================================================================
    // DEFRAGMENTATION
    // ========================================================================

    /// Whether some chunk has free space right before it that it can move into.
    #[must_use]
    pub fn can_be_defragmented(&self) -> bool {
        self.chunks.iter().any(|chunk| {
            self.blocks
                .relocation_target(self.chunk_offset(chunk), chunk.relocator.alignment())
                .is_some()
        })
    }

    /// Moves the first movable chunk (in address order) into the free
    /// space before it. Returns whether anything moved.
    pub fn defragment_once(&mut self) -> bool {
        for index in 0..self.chunks.len() {
            let chunk = self.chunks[index];
            let offset = self.chunk_offset(&chunk);
            let Some(target) = self
                .blocks
                .relocate_into_preceding_gap(offset, chunk.relocator.alignment())
            else {
                continue;
            };

            // SAFETY: `offset` holds the chunk's live elements; the block
            // allocator reserved `target..target + size` for them.
            let path = unsafe {
                chunk
                    .relocator
                    .relocate(self.blocks.arena_mut(), offset, target, chunk.count)
            };
            self.blocks.scrub_after_relocation(offset, target, chunk.size);
            self.handles.set(chunk.handle, target);
            self.stats.record_relocation(path, chunk.size);
            self.stats.record_usage(self.blocks.used_bytes());

            tracing::trace!(handle = chunk.handle, from = offset, to = target, ?path, "relocated");
            return true;
        }
        false
    }

    /// Compacts until no chunk can move. Returns the number of moves.
    pub fn defragment(&mut self) -> usize {
        let moves = self.defragment_budgeted(usize::MAX);
        self.stats.record_pass();

        tracing::debug!(
            moves,
            free_bytes = self.blocks.free_bytes(),
            largest_free = self.blocks.largest_free_block(),
            "defragmentation pass complete"
        );
        moves
    }

    /// Performs at most `max_moves` relocation steps, for spreading
    /// compaction across frames. Returns the number of moves.
    pub fn defragment_budgeted(&mut self, max_moves: usize) -> usize {
        let mut moves = 0;
        while moves < max_moves && self.defragment_once() {
            moves += 1;
        }
        moves
    }

    /// `1 - largest_free / total_free`; 0 when the free space is one block
    /// or there is none.
    #[must_use]
    pub fn fragmentation(&self) -> f32 {
        let free = self.blocks.free_bytes();
        if free == 0 {
            return 0.0;
        }
        1.0 - (self.blocks.largest_free_block() as f32 / free as f32)
    }

    /// Runs [`defragment`](Self::defragment) when fragmentation exceeds the
    /// configured threshold. Returns the number of moves.
    pub fn defragment_if_needed(&mut self) -> usize {
        if self.fragmentation() > self.config.fragmentation_threshold {
            self.defragment()
        } else {
            0
        }
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    /// The config this allocator was built from.
    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Counters collected so far.
    #[must_use]
    pub fn stats(&self) -> &AllocationStats {
        &self.stats
    }

    /// Clears all counters.
    pub fn reset_stats(&mut self) {
        self.stats = AllocationStats::default();
    }

    /// Arena size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blocks.capacity()
    }

    /// Free arena bytes.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.blocks.free_bytes()
    }

    /// Used arena bytes, headers and padding included.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.blocks.used_bytes()
    }

    /// Largest contiguous free run.
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        self.blocks.largest_free_block()
    }

    /// Number of free blocks.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.blocks.free_block_count()
    }

    /// Number of live allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.chunks.len()
    }

    /// Handles still available.
    #[must_use]
    pub fn free_handle_count(&self) -> usize {
        self.handles.free_count()
    }

    /// Usable handle slots.
    #[must_use]
    pub fn handle_capacity(&self) -> usize {
        self.handles.capacity()
    }

    /// Asserts every structural invariant: free list coalesced, used and
    /// free blocks tiling the arena without overlap, chunks sorted, and
    /// handle and chunk sets agreeing.
    ///
    /// # Panics
    ///
    /// Panics on any violation.
    pub fn check_integrity(&self) {
        self.blocks.check_free_list();
        assert_eq!(self.handles.live_count(), self.chunks.len(), "handle/chunk count mismatch");
        assert_eq!(self.blocks.live_blocks(), self.chunks.len(), "block/chunk count mismatch");

        let mut spans: Vec<(usize, usize, bool)> = self
            .blocks
            .free_blocks()
            .map(|b| (b.offset, b.end(), false))
            .collect();

        let mut previous = None;
        for chunk in &self.chunks {
            let offset = self.chunk_offset(chunk);
            assert!(previous < Some(offset), "used chunks out of address order");
            previous = Some(offset);

            let info = match self.blocks.block_info(offset) {
                Ok(info) => info,
                Err(error) => panic!("chunk {} has no live block: {error}", chunk.handle),
            };
            assert!(offset + chunk.size <= info.end(), "payload of {} overruns its block", chunk.handle);
            assert_eq!(offset % chunk.relocator.alignment(), 0, "payload of {} misaligned", chunk.handle);
            spans.push((info.start, info.end(), true));
        }

        spans.sort_unstable();
        let mut cursor = 0;
        for (start, end, _) in &spans {
            assert_eq!(*start, cursor, "arena gap or overlap at offset {cursor}");
            cursor = *end;
        }
        assert_eq!(cursor, self.capacity(), "blocks do not cover the arena");
    }
}

impl Drop for DefragAllocator {
    fn drop(&mut self) {
        for index in 0..self.chunks.len() {
            let chunk = self.chunks[index];
            let offset = self.chunk_offset(&chunk);
            // SAFETY: Each live chunk holds `count` elements of its type;
            // the arena is released right after, so none is used again.
            unsafe {
                chunk
                    .relocator
                    .drop_in_place(self.blocks.arena_mut(), offset, chunk.count);
            }
        }
    }
}

impl std::fmt::Debug for DefragAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefragAllocator")
            .field("capacity", &self.capacity())
            .field("free_bytes", &self.free_bytes())
            .field("live_allocations", &self.live_allocations())
            .field("free_handles", &self.free_handle_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    #[repr(C, align(8))]
    struct Particle {
        position: [f32; 3],
        life: f32,
    }

    fn particle(seed: f32) -> Particle {
        Particle {
            position: [seed, seed * 2.0, seed * 3.0],
            life: 1.0,
        }
    }

    fn heap() -> DefragAllocator {
        DefragAllocator::new(1024, 16).unwrap()
    }

    #[test]
    fn test_allocate_and_get() {
        let mut heap = heap();
        let ptr = heap.allocate(particle(1.0)).unwrap();
        assert!(ptr.is_valid());
        assert_eq!(heap.get(&ptr), Some(&particle(1.0)));
        assert_eq!(ptr.get(&heap), Some(&particle(1.0)));

        heap.get_mut(&ptr).unwrap().life = 0.5;
        assert!((heap.get(&ptr).unwrap().life - 0.5).abs() < f32::EPSILON);
        heap.check_integrity();
    }

    #[test]
    fn test_allocate_with_indexes() {
        let mut heap = heap();
        let ptr = heap.allocate_with(5, |i| i as u32 * 10).unwrap();
        assert_eq!(heap.get_slice(&ptr), Some(&[0, 10, 20, 30, 40][..]));
        assert_eq!(ptr.at(&heap, 3), Some(&30));
        assert_eq!(ptr.at(&heap, 5), None);
    }

    #[test]
    fn test_wrong_type_does_not_resolve() {
        let mut heap = heap();
        let ptr = heap.allocate(7u64).unwrap();
        let as_u32: UaPtr<u32> = ptr.cast();
        assert_eq!(heap.get(&as_u32), None);
        assert_eq!(heap.get(&as_u32.cast::<u64>()), Some(&7));
    }

    #[test]
    fn test_raw_allocation_is_zeroed_and_aligned() {
        let mut heap = heap();
        let ptr = heap.allocate_raw(40, 64).unwrap();
        assert_eq!(heap.offset_of(&ptr).unwrap() % 64, 0);
        assert_eq!(heap.raw_bytes(&ptr).unwrap(), &[0u8; 40][..]);

        heap.raw_bytes_mut(&ptr).unwrap()[0] = 9;
        assert_eq!(heap.raw_bytes(&ptr).unwrap()[0], 9);
    }

    #[test]
    fn test_view_pod() {
        let mut heap = heap();
        let bytes: Vec<u8> = [1u32, 2, 3].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let ptr = heap.allocate_raw_from(&bytes, 4).unwrap();
        assert_eq!(heap.view_pod::<u32>(&ptr), Some(&[1u32, 2, 3][..]));
        // 12 bytes do not divide into u64s.
        assert_eq!(heap.view_pod::<u64>(&ptr), None);

        heap.view_pod_mut::<u32>(&ptr).unwrap()[1] = 20;
        assert_eq!(heap.view_pod::<u32>(&ptr), Some(&[1u32, 20, 3][..]));
    }

    #[test]
    fn test_deallocate_invalidates_and_rejects_double_free() {
        let mut heap = heap();
        let mut ptr = heap.allocate(5u32).unwrap();
        let mut copy = ptr;

        heap.deallocate(&mut ptr).unwrap();
        assert!(!ptr.is_valid());
        assert_eq!(heap.deallocate(&mut ptr), Err(AllocError::InvalidPointer));
        // The copy still names a freed slot, which is detected until reused.
        assert_eq!(heap.deallocate(&mut copy), Err(AllocError::InvalidPointer));
        assert_eq!(heap.get(&copy), None);
        heap.check_integrity();
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let mut a = heap();
        let mut b = heap();
        let mut ptr = a.allocate(1u8).unwrap();
        assert_eq!(b.get(&ptr), None);
        assert_eq!(b.deallocate(&mut ptr), Err(AllocError::InvalidPointer));
        assert!(ptr.is_valid());
    }

    #[test]
    fn test_invalid_requests() {
        let mut heap = heap();
        assert_eq!(heap.allocate_raw(0, 8), Err(AllocError::ZeroSizedAllocation));
        assert_eq!(heap.allocate_raw(8, 3), Err(AllocError::InvalidAlignment(3)));
        assert_eq!(
            heap.allocate_raw(8, 256),
            Err(AllocError::AlignmentTooLarge { alignment: 256 })
        );
        assert_eq!(heap.allocate_with(0, |i| i as u8), Err(AllocError::ZeroSizedAllocation));
        assert_eq!(heap.allocate(()), Err(AllocError::ZeroSizedAllocation));
        assert_eq!(heap.stats().failed_allocations, 0);
        assert_eq!(heap.free_handle_count(), 15);
    }

    #[test]
    fn test_destructors_run_on_deallocate_and_drop() {
        let alive = Arc::new(());
        let mut heap = heap();
        let mut first = heap.allocate(Arc::clone(&alive)).unwrap();
        let _second = heap.allocate_with(3, |_| Arc::clone(&alive)).unwrap();
        assert_eq!(Arc::strong_count(&alive), 5);

        heap.deallocate(&mut first).unwrap();
        assert_eq!(Arc::strong_count(&alive), 4);

        drop(heap);
        assert_eq!(Arc::strong_count(&alive), 1);
    }

    #[test]
    fn test_deallocate_through_cast_runs_real_destructor() {
        let alive = Arc::new(());
        let mut heap = heap();
        let ptr = heap.allocate(Arc::clone(&alive)).unwrap();
        let mut raw: UaPtr<u8> = ptr.cast();
        heap.deallocate(&mut raw).unwrap();
        assert_eq!(Arc::strong_count(&alive), 1);
    }

    #[test]
    fn test_defragment_moves_and_preserves_values() {
        let mut heap = heap();
        let a = heap.allocate(particle(1.0)).unwrap();
        let mut b = heap.allocate(particle(2.0)).unwrap();
        let c = heap.allocate(particle(3.0)).unwrap();
        let before = heap.address_of(&c).unwrap();

        heap.deallocate(&mut b).unwrap();
        assert!(heap.can_be_defragmented());
        assert!(heap.defragment_once());

        assert_ne!(heap.address_of(&c).unwrap(), before);
        assert_eq!(heap.get(&a), Some(&particle(1.0)));
        assert_eq!(heap.get(&c), Some(&particle(3.0)));
        assert!(!heap.can_be_defragmented());
        assert!(!heap.defragment_once());
        heap.check_integrity();
    }

    #[test]
    fn test_defragment_droppable_values_uses_move_policy() {
        let mut heap = DefragAllocator::new(4096, 16).unwrap();
        let mut gap = heap.allocate_with(2, |i| format!("gap-{i}")).unwrap();
        let names = heap.allocate_with(4, |i| format!("name-{i}")).unwrap();
        heap.deallocate(&mut gap).unwrap();

        assert_eq!(heap.defragment(), 1);
        let stats = heap.stats();
        assert_eq!(stats.relocations, 1);
        assert_eq!(stats.bitwise_moves, 0);
        assert_eq!(stats.disjoint_moves + stats.staged_moves, 1);

        let values: Vec<&str> = heap.get_slice(&names).unwrap().iter().map(String::as_str).collect();
        assert_eq!(values, vec!["name-0", "name-1", "name-2", "name-3"]);
        heap.check_integrity();
    }

    #[test]
    fn test_defragment_budgeted() {
        let mut heap = heap();
        let mut ptrs: Vec<_> = (0..6).map(|i| heap.allocate(i as u64).unwrap()).collect();
        for ptr in ptrs.iter_mut().step_by(2) {
            heap.deallocate(ptr).unwrap();
        }

        assert_eq!(heap.defragment_budgeted(1), 1);
        assert!(heap.can_be_defragmented());
        let rest = heap.defragment();
        assert!(rest >= 1);
        assert!(!heap.can_be_defragmented());

        for (i, ptr) in ptrs.iter().enumerate().filter(|(i, _)| i % 2 == 1) {
            assert_eq!(heap.get(ptr), Some(&(i as u64)));
        }
        heap.check_integrity();
    }

    #[test]
    fn test_fragmentation_and_threshold() {
        let mut heap = DefragAllocator::from_config(&AllocatorConfig {
            fragmentation_threshold: 0.1,
            ..AllocatorConfig::new(256, 16)
        })
        .unwrap();
        assert!(heap.fragmentation().abs() < f32::EPSILON);

        let mut ptrs: Vec<_> = (0..6).map(|i| heap.allocate(i as u64).unwrap()).collect();
        heap.deallocate(&mut ptrs[1]).unwrap();
        heap.deallocate(&mut ptrs[3]).unwrap();
        assert!(heap.fragmentation() > 0.1);

        assert!(heap.defragment_if_needed() > 0);
        assert!(heap.fragmentation().abs() < f32::EPSILON);
        assert_eq!(heap.defragment_if_needed(), 0);
    }

    #[test]
    fn test_out_of_handles_leaves_no_reservation() {
        let mut heap = DefragAllocator::new(1024, 3).unwrap();
        let _a = heap.allocate(1u32).unwrap();
        let _b = heap.allocate(2u32).unwrap();
        let free_before = heap.free_bytes();

        assert_eq!(heap.allocate(3u32), Err(AllocError::OutOfHandles { capacity: 2 }));
        assert_eq!(heap.free_bytes(), free_before);
        assert_eq!(heap.stats().failed_allocations, 1);
        heap.check_integrity();
    }

    #[test]
    fn test_panicking_constructor_leaves_no_trace() {
        let alive = Arc::new(());
        let mut heap = heap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            heap.allocate_with(4, |i| {
                assert!(i < 2, "constructor failed");
                Arc::clone(&alive)
            })
        }));
        assert!(result.is_err());
        assert_eq!(Arc::strong_count(&alive), 1);
        assert_eq!(heap.free_bytes(), heap.capacity());
        assert_eq!(heap.free_handle_count(), heap.handle_capacity());
        heap.check_integrity();
    }

    #[test]
    fn test_zero_on_free() {
        let mut heap = DefragAllocator::from_config(&AllocatorConfig {
            zero_on_free: true,
            ..AllocatorConfig::new(256, 8)
        })
        .unwrap();
        let mut ptr = heap.allocate(0xFFFF_FFFFu32).unwrap();
        let offset = heap.offset_of(&ptr).unwrap();
        heap.deallocate(&mut ptr).unwrap();
        assert_eq!(heap.blocks.arena().read::<u32>(offset), 0);
    }

    #[test]
    fn test_zero_on_free_after_relocation() {
        let mut heap = DefragAllocator::from_config(&AllocatorConfig {
            zero_on_free: true,
            ..AllocatorConfig::new(1024, 8)
        })
        .unwrap();
        let mut first = heap.allocate_raw_from(&[0x11u8; 64], 1).unwrap();
        let second = heap.allocate_raw_from(&[0xABu8; 64], 1).unwrap();
        let vacated_end = heap.offset_of(&second).unwrap() + 64;
        heap.deallocate(&mut first).unwrap();

        assert!(heap.defragment_once());
        let moved_end = heap.offset_of(&second).unwrap() + 64;
        assert!(moved_end < vacated_end);
        assert_eq!(heap.raw_bytes(&second).unwrap(), &[0xABu8; 64][..]);

        let arena = heap.blocks.arena();
        let leftovers = (moved_end..vacated_end).filter(|&o| arena.read::<u8>(o) != 0).count();
        assert_eq!(leftovers, 0);
        heap.check_integrity();
    }

    #[test]
    fn test_relocation_keeps_arena_when_not_scrubbing() {
        let mut heap = heap();
        let mut first = heap.allocate_raw_from(&[0x11u8; 32], 1).unwrap();
        let second = heap.allocate_raw_from(&[0xABu8; 32], 1).unwrap();
        let old_offset = heap.offset_of(&second).unwrap();
        heap.deallocate(&mut first).unwrap();

        assert!(heap.defragment_once());
        // The vacated payload is left as it was.
        assert_eq!(heap.blocks.arena().read::<u8>(old_offset + 31), 0xAB);
    }

    struct Bomb(u32);

    impl Drop for Bomb {
        fn drop(&mut self) {
            panic!("bomb {} went off", self.0);
        }
    }

    #[test]
    fn test_panicking_destructor_leaves_heap_consistent() {
        let mut heap = heap();
        let _before = heap.allocate(1u64).unwrap();
        let mut bomb = heap.allocate(Bomb(7)).unwrap();
        let copy = bomb;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            heap.deallocate(&mut bomb)
        }));
        assert!(result.is_err());

        assert!(!bomb.is_valid());
        assert_eq!(heap.offset_of(&copy), None);
        assert_eq!(heap.live_allocations(), 1);
        assert_eq!(heap.free_handle_count(), heap.handle_capacity() - 1);
        assert_eq!(heap.stats().outstanding(), 1);
        heap.check_integrity();

        let after = heap.allocate(2u64).unwrap();
        assert_eq!(heap.get(&after), Some(&2));
        assert_eq!(heap.defragment(), 0);
        heap.check_integrity();
    }

    #[test]
    fn test_relocation_raises_peak_usage() {
        let mut heap = heap();
        let mut gap = heap.allocate_raw(24, 1).unwrap();
        let aligned = heap.allocate_raw(32, 32).unwrap();
        heap.deallocate(&mut gap).unwrap();

        heap.reset_stats();
        let used_before = heap.used_bytes();
        assert!(heap.defragment_once());

        // Sliding down to a 32-aligned payload absorbs part of the gap.
        assert!(heap.used_bytes() > used_before);
        assert_eq!(heap.stats().peak_used_bytes, heap.used_bytes());
        assert_eq!(heap.offset_of(&aligned).map(|o| o % 32), Some(0));
        heap.check_integrity();
    }
}
