//! # Shared Allocator
//!
//! A cloneable handle serializing all access to one [`DefragAllocator`].

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::memory::DefragAllocator;

/// A [`DefragAllocator`] behind a single mutex.
///
/// Every clone refers to the same allocator. [`UaPtr`](crate::UaPtr)s
/// obtained through one clone resolve through any other.
///
/// # Example
///
/// ```rust,ignore
/// let shared = SharedAllocator::new(DefragAllocator::new(1 << 20, 1024)?);
///
/// let worker = shared.clone();
/// std::thread::spawn(move || {
///     let ptr = worker.lock().allocate(42u64);
/// });
///
/// // Compaction holds the lock for the whole pass.
/// shared.lock().defragment();
/// ```
#[derive(Clone)]
pub struct SharedAllocator {
    inner: Arc<Mutex<DefragAllocator>>,
}

impl SharedAllocator {
    /// Wraps `allocator` for shared use.
    #[must_use]
    pub fn new(allocator: DefragAllocator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    /// Blocks until the allocator is available.
    pub fn lock(&self) -> MutexGuard<'_, DefragAllocator> {
        self.inner.lock()
    }

    /// Returns the allocator if no other thread holds it.
    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, DefragAllocator>> {
        self.inner.try_lock()
    }

    /// Runs `f` with exclusive access.
    pub fn with<R>(&self, f: impl FnOnce(&mut DefragAllocator) -> R) -> R {
        f(&mut *self.inner.lock())
    }

    /// Runs one compaction step if the allocator is free right now.
    ///
    /// Returns `None` when another thread holds the lock, otherwise whether
    /// a chunk moved. Suits a per-frame maintenance tick.
    #[must_use]
    pub fn try_defragment_once(&self) -> Option<bool> {
        self.inner.try_lock().map(|mut heap| heap.defragment_once())
    }

    /// Unwraps the allocator if this is the last handle to it.
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged if other clones are alive.
    pub fn into_inner(self) -> Result<DefragAllocator, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

impl std::fmt::Debug for SharedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Some(heap) => f.debug_tuple("SharedAllocator").field(&*heap).finish(),
            None => f.debug_tuple("SharedAllocator").field(&"<locked>").finish(),
        }
    }
}
