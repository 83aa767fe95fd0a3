//! Power locker for sequential operations
//!
//! Ensures that only one power operation (start, stop, restart, kill) can
//! happen at a time for a server.

use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};

#[derive(Debug, Error)]
pub enum LockerError {
    #[error("lock is currently held")]
    Busy,

    #[error("lock acquisition was cancelled")]
    Cancelled,
}

/// A sequential locker that ensures only one operation runs at a time.
///
/// Power actions on a single server must be totally ordered; concurrent
/// start/stop calls would otherwise race on container state.
pub struct Locker {
    semaphore: Semaphore,
}

impl Locker {
    pub fn new() -> Self {
        Self {
            // 1 permit = mutual exclusion
            semaphore: Semaphore::new(1),
        }
    }

    /// Acquire the lock, waiting indefinitely if needed.
    ///
    /// Returns a guard that releases the lock when dropped.
    pub async fn acquire(&self) -> Result<LockerGuard<'_>, LockerError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LockerError::Cancelled)?;

        Ok(LockerGuard { _permit: permit })
    }

    /// Try to acquire the lock immediately without waiting.
    pub fn try_acquire(&self) -> Result<LockerGuard<'_>, LockerError> {
        match self.semaphore.try_acquire() {
            Ok(permit) => Ok(LockerGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(LockerError::Busy),
            Err(TryAcquireError::Closed) => Err(LockerError::Cancelled),
        }
    }

    /// Check if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that releases the lock when dropped.
pub struct LockerGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let locker = Locker::new();

        assert!(!locker.is_locked());
        let guard = locker.acquire().await.unwrap();
        assert!(locker.is_locked());

        assert!(locker.try_acquire().is_err());

        drop(guard);
        assert!(!locker.is_locked());

        let _guard = locker.try_acquire().unwrap();
        assert!(locker.is_locked());
    }
}
