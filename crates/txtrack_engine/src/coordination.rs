//! Primitives shared with the index commit component.

use crate::error::{TrackError, TrackResult};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fails with [`TrackError::Cancelled`] once `token` has fired.
pub(crate) fn check_cancelled(token: &CancellationToken) -> TrackResult<()> {
    if token.is_cancelled() {
        Err(TrackError::Cancelled)
    } else {
        Ok(())
    }
}

/// Serializes index bookkeeping with the commit component.
///
/// The tracker holds it only while writing transaction markers and moving
/// the cursor; fetching and node application run unlocked.
#[derive(Debug, Clone, Default)]
pub struct IndexWriteLock {
    inner: Arc<Mutex<()>>,
}

impl IndexWriteLock {
    /// Creates an unlocked write lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }

    /// Acquires the lock if it is free.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.inner.try_lock()
    }
}

/// Signals that uncommitted index work must be discarded.
///
/// Worker failures raise the flag; the commit component clears it once it
/// has rolled back.
#[derive(Debug, Clone, Default)]
pub struct RollbackFlag {
    inner: Arc<AtomicBool>,
}

impl RollbackFlag {
    /// Creates a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn request(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Returns true if a rollback is pending.
    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Lowers the flag, returning whether it was raised.
    pub fn clear(&self) -> bool {
        self.inner.swap(false, Ordering::SeqCst)
    }
}
