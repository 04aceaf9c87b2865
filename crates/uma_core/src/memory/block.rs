//! # Block Allocator
//!
//! First-fit free-list allocator over a fixed [`Arena`].
//!
//! ## Layout
//!
//! Used and free blocks tile the arena exactly. A used block is laid out as:
//!
//! ```text
//! block start                                   block end
//! |<- pad ->|<- AllocationHeader ->|<- payload ... (+ slack) ->|
//!                                  ^
//!                                  payload offset (aligned)
//! ```
//!
//! `pad` is recorded in the header as a single byte, which caps the
//! supported alignment at [`MAX_ALIGNMENT`].
//!
//! Free blocks are kept in a `Vec` sorted by offset and are coalesced with
//! their neighbours on every release, so two free blocks are never adjacent.

use bytemuck::{Pod, Zeroable};

use super::arena::Arena;
use super::relocate;
use crate::error::{AllocError, AllocResult};

/// Largest supported alignment.
pub const MAX_ALIGNMENT: usize = 128;

/// Bytes of bookkeeping stored in front of every payload.
pub const HEADER_SIZE: usize = std::mem::size_of::<AllocationHeader>();

/// Remainders smaller than this are absorbed into the allocation instead
/// of being split off as a free block.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 1;

const STATE_LIVE: u8 = 0xA5;
const STATE_FREED: u8 = 0x00;

/// Metadata written immediately before every payload.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocationHeader {
    /// Size of the whole block, padding and header included.
    pub block_size: u64,
    /// Padding between block start and header. Always `< MAX_ALIGNMENT`.
    pub align_offset: u8,
    /// Live marker, used to reject foreign or already-freed offsets.
    state: u8,
    _reserved: [u8; 6],
}

impl AllocationHeader {
    fn live(block_size: usize, align_offset: usize) -> Self {
        debug_assert!(align_offset < MAX_ALIGNMENT);
        Self {
            block_size: block_size as u64,
            align_offset: align_offset as u8,
            state: STATE_LIVE,
            _reserved: [0; 6],
        }
    }

    fn is_live(&self) -> bool {
        self.state == STATE_LIVE
    }
}

/// A contiguous run of free bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeBlock {
    /// Arena offset of the first free byte.
    pub offset: usize,
    /// Length of the run in bytes.
    pub size: usize,
}

impl FreeBlock {
    /// Offset one past the last free byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Placement of a live allocation inside the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block (including padding and header).
    pub start: usize,
    /// Size of the block in bytes.
    pub size: usize,
    /// Padding before the header.
    pub align_offset: usize,
    /// Offset of the payload.
    pub payload: usize,
}

impl BlockInfo {
    /// Offset one past the block.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Rejects alignments the header cannot represent.
///
/// # Errors
///
/// [`AllocError::InvalidAlignment`] for zero or non-power-of-two values and
/// [`AllocError::AlignmentTooLarge`] above [`MAX_ALIGNMENT`].
pub fn check_alignment(alignment: usize) -> AllocResult<()> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(AllocError::InvalidAlignment(alignment));
    }
    if alignment > MAX_ALIGNMENT {
        return Err(AllocError::AlignmentTooLarge { alignment });
    }
    Ok(())
}

/// First-fit allocator over an owned arena.
///
/// Returns payload offsets, never addresses.
///
/// # Thread Safety
///
/// NOT thread-safe. Serialize access externally.
#[derive(Debug)]
pub struct BlockAllocator {
    arena: Arena,
    /// Address-ordered free list.
    free: Vec<FreeBlock>,
    /// Sum of all live block sizes.
    used_bytes: usize,
    /// Number of live blocks.
    live_blocks: usize,
    /// Scrub payloads on release.
    zero_on_free: bool,
}

impl BlockAllocator {
    /// Creates an allocator whose single free block spans the whole arena.
    #[must_use]
    pub fn new(arena: Arena) -> Self {
        let capacity = arena.capacity();
        Self {
            arena,
            free: vec![FreeBlock { offset: 0, size: capacity }],
            used_bytes: 0,
            live_blocks: 0,
            zero_on_free: false,
        }
    }

    /// Creates an allocator over a fresh system-backed arena.
    ///
    /// # Errors
    ///
    /// Propagates arena creation failures.
    pub fn with_capacity(capacity: usize) -> AllocResult<Self> {
        Ok(Self::new(Arena::new(capacity)?))
    }

    /// Enables or disables scrubbing of released payloads.
    pub fn set_zero_on_free(&mut self, enabled: bool) {
        self.zero_on_free = enabled;
    }

    /// Returns the backing arena.
    #[inline]
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Returns the backing arena mutably.
    #[inline]
    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    /// Total arena size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Bytes held by live blocks, headers and padding included.
    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Bytes in the free list.
    #[inline]
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.capacity() - self.used_bytes
    }

    /// Number of live blocks.
    #[inline]
    #[must_use]
    pub const fn live_blocks(&self) -> usize {
        self.live_blocks
    }

    /// Number of free blocks.
    #[inline]
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free.len()
    }

    /// Size of the largest free block.
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        self.free.iter().map(|b| b.size).max().unwrap_or(0)
    }

    /// Iterates over free blocks in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlock> + '_ {
        self.free.iter().copied()
    }

    /// Reserves `size` bytes aligned to `alignment` and returns the payload offset.
    ///
    /// # Errors
    ///
    /// - [`AllocError::ZeroSizedAllocation`] when `size == 0`
    /// - [`AllocError::InvalidAlignment`] / [`AllocError::AlignmentTooLarge`]
    /// - [`AllocError::OutOfMemory`] when no free block fits
    pub fn allocate(&mut self, size: usize, alignment: usize) -> AllocResult<usize> {
        if size == 0 {
            return Err(AllocError::ZeroSizedAllocation);
        }
        check_alignment(alignment)?;

        let out_of_memory = AllocError::OutOfMemory {
            requested: size,
            alignment,
        };
        if size.checked_add(HEADER_SIZE).map_or(true, |n| n > self.capacity()) {
            return Err(out_of_memory);
        }

        // First fit in address order
        let found = self.free.iter().enumerate().find_map(|(index, block)| {
            let payload = align_up(block.offset + HEADER_SIZE, alignment);
            let needed = payload - block.offset + size;
            (needed <= block.size).then_some((index, payload, needed))
        });
        let Some((index, payload, needed)) = found else {
            return Err(out_of_memory);
        };

        let block = self.free[index];
        let block_size = if block.size - needed < MIN_BLOCK_SIZE {
            self.free.remove(index);
            block.size
        } else {
            let rest = &mut self.free[index];
            rest.offset += needed;
            rest.size -= needed;
            needed
        };

        let align_offset = payload - HEADER_SIZE - block.offset;
        self.arena
            .write(payload - HEADER_SIZE, AllocationHeader::live(block_size, align_offset));
        self.used_bytes += block_size;
        self.live_blocks += 1;

        Ok(payload)
    }

    /// Reserves room for `count` values of `T` and fills it from `items`.
    ///
    /// If `items` panics part way, the values already written are dropped
    /// and the block is released before the panic continues.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate). Zero-sized `T` or `count == 0`
    /// yield [`AllocError::ZeroSizedAllocation`].
    ///
    /// # Panics
    ///
    /// Panics if `items` yields fewer than `count` values.
    pub fn allocate_from<T, I>(&mut self, count: usize, items: I) -> AllocResult<usize>
    where
        I: Iterator<Item = T>,
    {
        let size = std::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(AllocError::OutOfMemory {
                requested: usize::MAX,
                alignment: std::mem::align_of::<T>(),
            })?;
        let offset = self.allocate(size, std::mem::align_of::<T>())?;

        let mut reservation = Reservation {
            blocks: self,
            offset,
            armed: true,
        };
        relocate::construct_from(&mut reservation.blocks.arena, offset, count, items);
        reservation.armed = false;

        Ok(offset)
    }

    /// Releases the block whose payload starts at `offset`.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidPointer`] if `offset` is not a live payload.
    ///
    /// # Panics
    ///
    /// Panics if the released range overlaps a free block (corruption).
    pub fn deallocate(&mut self, offset: usize) -> AllocResult<()> {
        let info = self.block_info(offset)?;

        let mut header: AllocationHeader = self.arena.read(offset - HEADER_SIZE);
        header.state = STATE_FREED;
        self.arena.write(offset - HEADER_SIZE, header);
        if self.zero_on_free {
            self.arena.zero(offset, info.end() - offset);
        }

        self.used_bytes -= info.size;
        self.live_blocks -= 1;
        self.release(info.start, info.size);
        Ok(())
    }

    /// Runs `drop_payload` on the arena, then releases the block at `offset`.
    ///
    /// The block is released even if `drop_payload` panics.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidPointer`] if `offset` is not a live payload. In
    /// that case `drop_payload` is not called.
    pub fn deallocate_after<F>(&mut self, offset: usize, drop_payload: F) -> AllocResult<()>
    where
        F: FnOnce(&mut Arena),
    {
        self.block_info(offset)?;

        let reservation = Reservation {
            blocks: self,
            offset,
            armed: true,
        };
        drop_payload(&mut reservation.blocks.arena);
        drop(reservation);
        Ok(())
    }

    /// Reports the block holding the live payload at `offset`.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidPointer`] if `offset` is not a live payload.
    pub fn block_info(&self, offset: usize) -> AllocResult<BlockInfo> {
        if offset < HEADER_SIZE || offset >= self.capacity() {
            return Err(AllocError::InvalidPointer);
        }
        let header: AllocationHeader = self.arena.read(offset - HEADER_SIZE);
        if !header.is_live() {
            return Err(AllocError::InvalidPointer);
        }

        let align_offset = usize::from(header.align_offset);
        let start = (offset - HEADER_SIZE)
            .checked_sub(align_offset)
            .ok_or(AllocError::InvalidPointer)?;
        let size = usize::try_from(header.block_size).map_err(|_| AllocError::InvalidPointer)?;
        if size < HEADER_SIZE || start + size > self.capacity() || start + size <= offset {
            return Err(AllocError::InvalidPointer);
        }

        Ok(BlockInfo {
            start,
            size,
            align_offset,
            payload: offset,
        })
    }

    /// Where the payload at `offset` would land if slid into the free block
    /// directly before it, or `None` if it is already packed.
    #[must_use]
    pub fn relocation_target(&self, offset: usize, alignment: usize) -> Option<usize> {
        let info = self.block_info(offset).ok()?;
        let gap = self.gap_before(info.start)?;
        let target = align_up(self.free[gap].offset + HEADER_SIZE, alignment);
        (target < offset).then_some(target)
    }

    /// Slides the block at `offset` down into the free block preceding it.
    ///
    /// Only bookkeeping happens here: the free list is updated and the new
    /// header is written. The caller moves the payload bytes afterwards.
    /// Returns the new payload offset, or `None` if the block is packed.
    pub fn relocate_into_preceding_gap(&mut self, offset: usize, alignment: usize) -> Option<usize> {
        let info = self.block_info(offset).ok()?;
        let gap_index = self.gap_before(info.start)?;
        let gap = self.free[gap_index];
        let target = align_up(gap.offset + HEADER_SIZE, alignment);
        if target >= offset {
            return None;
        }

        let shift = offset - target;
        let new_size = info.size + gap.size - shift;
        debug_assert_eq!(gap.offset + new_size, info.end() - shift);

        let mut old_header: AllocationHeader = self.arena.read(offset - HEADER_SIZE);
        old_header.state = STATE_FREED;
        self.arena.write(offset - HEADER_SIZE, old_header);
        self.arena.write(
            target - HEADER_SIZE,
            AllocationHeader::live(new_size, target - HEADER_SIZE - gap.offset),
        );

        self.used_bytes = self.used_bytes - info.size + new_size;
        self.free.remove(gap_index);
        self.release(info.end() - shift, shift);

        Some(target)
    }

    /// Scrubs what a relocation from `from` to `to` left behind, once the
    /// `len` payload bytes have been moved. No-op unless zero-on-free is set.
    ///
    /// Clears the slack after the moved payload and the tail released by
    /// [`relocate_into_preceding_gap`](Self::relocate_into_preceding_gap).
    pub fn scrub_after_relocation(&mut self, from: usize, to: usize, len: usize) {
        if !self.zero_on_free {
            return;
        }
        let Ok(info) = self.block_info(to) else {
            return;
        };
        let old_end = info.end() + (from - to);
        self.arena.zero(to + len, old_end - (to + len));
    }

    /// Index of the free block ending exactly at `start`.
    fn gap_before(&self, start: usize) -> Option<usize> {
        let index = self.free.partition_point(|b| b.offset < start);
        let prev = index.checked_sub(1)?;
        (self.free[prev].end() == start).then_some(prev)
    }

    /// Returns a range to the free list, merging with both neighbours.
    fn release(&mut self, offset: usize, size: usize) {
        let index = self.free.partition_point(|b| b.offset < offset);
        let end = offset + size;

        if let Some(prev) = index.checked_sub(1).map(|i| self.free[i]) {
            assert!(prev.end() <= offset, "free block overlap at offset {offset}");
        }
        if let Some(next) = self.free.get(index) {
            assert!(end <= next.offset, "free block overlap at offset {offset}");
        }

        let merges_prev = index > 0 && self.free[index - 1].end() == offset;
        let merges_next = index < self.free.len() && self.free[index].offset == end;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].size += size + next.size;
            }
            (true, false) => self.free[index - 1].size += size,
            (false, true) => {
                let next = &mut self.free[index];
                next.offset = offset;
                next.size += size;
            }
            (false, false) => self.free.insert(index, FreeBlock { offset, size }),
        }
    }

    /// Asserts the free list is sorted, in bounds, disjoint and coalesced.
    ///
    /// # Panics
    ///
    /// Panics on any violation.
    pub fn check_free_list(&self) {
        let mut total = 0;
        for pair in self.free.windows(2) {
            assert!(
                pair[0].end() < pair[1].offset,
                "free blocks {:?} and {:?} overlap or are not coalesced",
                pair[0],
                pair[1]
            );
        }
        for block in &self.free {
            assert!(block.size > 0, "empty free block at {}", block.offset);
            assert!(block.end() <= self.capacity(), "free block {block:?} out of bounds");
            total += block.size;
        }
        assert_eq!(total, self.free_bytes(), "free list does not match used byte count");
    }
}

/// Releases a block on drop unless disarmed.
struct Reservation<'a> {
    blocks: &'a mut BlockAllocator,
    offset: usize,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.blocks.deallocate(self.offset);
        }
    }
}
