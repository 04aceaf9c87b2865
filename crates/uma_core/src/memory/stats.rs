//! # Allocation Statistics
//!
//! Per-allocator counters. Owned by the allocator instance rather than
//! kept in process-wide state, so tests can inspect and reset them.

use super::relocate::RelocationPath;

/// Counters collected by one [`DefragAllocator`](crate::DefragAllocator).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Successful deallocations.
    pub deallocations: u64,
    /// Allocations rejected with an exhaustion error.
    pub failed_allocations: u64,
    /// Completed `defragment()` passes.
    pub defrag_passes: u64,
    /// Individual chunk moves.
    pub relocations: u64,
    /// Payload bytes moved by relocations.
    pub bytes_relocated: u64,
    /// Moves done with a plain memmove.
    pub bitwise_moves: u64,
    /// Moves of droppable types between disjoint ranges.
    pub disjoint_moves: u64,
    /// Moves of droppable types through a temporary.
    pub staged_moves: u64,
    /// High-water mark of used arena bytes.
    pub peak_used_bytes: usize,
}

impl AllocationStats {
    pub(crate) fn record_allocation(&mut self, used_bytes: usize) {
        self.allocations += 1;
        self.record_usage(used_bytes);
    }

    /// Raises the high-water mark to `used_bytes` if it is higher.
    pub(crate) fn record_usage(&mut self, used_bytes: usize) {
        self.peak_used_bytes = self.peak_used_bytes.max(used_bytes);
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed_allocations += 1;
    }

    pub(crate) fn record_deallocation(&mut self) {
        self.deallocations += 1;
    }

    pub(crate) fn record_relocation(&mut self, path: RelocationPath, bytes: usize) {
        self.relocations += 1;
        self.bytes_relocated += bytes as u64;
        match path {
            RelocationPath::Bitwise => self.bitwise_moves += 1,
            RelocationPath::Disjoint => self.disjoint_moves += 1,
            RelocationPath::Staged => self.staged_moves += 1,
        }
    }

    pub(crate) fn record_pass(&mut self) {
        self.defrag_passes += 1;
    }

    /// Allocations currently outstanding according to the counters.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.deallocations)
    }
}
