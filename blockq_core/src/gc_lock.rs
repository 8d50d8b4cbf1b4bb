//! Readers-writer coordination between garbage collection and everything else.
//!
//! The exclusive "GC lock" is held while a collection or a block removal
//! checks pins and deletes. Ordinary block reads/writes and pin updates take
//! the shared lock. The lock is not reentrant: a thread holding the GC guard
//! must not call [`GcLocker::gc_lock`] again, and must not take the shared lock
//! either.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Coordinates exclusive GC sections with shared block access.
#[derive(Debug, Default)]
pub struct GcLocker {
    lock: RwLock<()>,
    gc_pending: AtomicUsize,
}

/// Exclusive GC section; released on drop.
#[must_use = "the GC lock is released as soon as the guard is dropped"]
pub struct GcGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    pending: &'a AtomicUsize,
}

impl Drop for GcGuard<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared section (block write, pin update); released on drop.
#[must_use = "the shared lock is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl GcLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock, blocking until every shared holder releases.
    pub fn gc_lock(&self) -> GcGuard<'_> {
        self.gc_pending.fetch_add(1, Ordering::SeqCst);
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        let guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("gc lock acquired");
        GcGuard {
            _guard: guard,
            pending: &self.gc_pending,
        }
    }

    /// Acquire the shared lock for a single block operation.
    pub fn shared_lock(&self) -> SharedGuard<'_> {
        SharedGuard {
            _guard: self.lock.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Acquire the shared lock for a pin update.
    pub fn pin_lock(&self) -> SharedGuard<'_> {
        self.shared_lock()
    }

    /// Whether a GC section is running or waiting to run.
    pub fn gc_requested(&self) -> bool {
        self.gc_pending.load(Ordering::SeqCst) > 0
    }
}
