//! # Allocator Error Types
//!
//! All recoverable errors that can occur in the allocator.
//!
//! Internal corruption is never reported through this type: a broken
//! invariant is a bug in the allocator or its caller and panics.

use thiserror::Error;

/// Errors that can occur while allocating, freeing or configuring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// No free block can hold the request, even after alignment slack.
    #[error("out of memory: cannot fit {requested} bytes aligned to {alignment}")]
    OutOfMemory {
        /// Payload size that was requested.
        requested: usize,
        /// Alignment that was requested.
        alignment: usize,
    },

    /// Every usable handle slot is occupied.
    #[error("out of handles: all {capacity} usable handles are live")]
    OutOfHandles {
        /// Number of usable handle slots.
        capacity: usize,
    },

    /// Zero-byte allocations are rejected.
    #[error("zero-sized allocation requested")]
    ZeroSizedAllocation,

    /// Alignment was zero or not a power of two.
    #[error("invalid alignment {0}: must be a non-zero power of two")]
    InvalidAlignment(usize),

    /// Alignment exceeds what the one-byte header offset can encode.
    #[error("alignment {alignment} exceeds the supported maximum of 128")]
    AlignmentTooLarge {
        /// Alignment that was requested.
        alignment: usize,
    },

    /// The pointer is invalid, belongs to another allocator, or was already freed.
    #[error("invalid pointer: not a live allocation of this allocator")]
    InvalidPointer,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse classification of an [`AllocError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The arena has no room for the request.
    OutOfMemory,
    /// The handle table is exhausted.
    OutOfHandles,
    /// Contract violation by the caller.
    InvalidOperation,
    /// Rejected configuration.
    Config,
}

impl AllocError {
    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::OutOfHandles { .. } => ErrorKind::OutOfHandles,
            Self::ZeroSizedAllocation
            | Self::InvalidAlignment(_)
            | Self::AlignmentTooLarge { .. }
            | Self::InvalidPointer => ErrorKind::InvalidOperation,
            Self::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// True for exhaustion errors the caller is expected to handle
    /// (free something, defragment, or report up the chain).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::OutOfMemory | ErrorKind::OutOfHandles)
    }
}

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
