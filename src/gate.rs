//! Admission control for pooled acquisitions

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::errors::{PoolError, PoolResult};

/// Counting semaphore bounding how many pooled objects are lent out.
///
/// A permit returned by [`enter`](Self::enter) releases its slot when
/// dropped, so an abandoned acquisition never leaks capacity. Once an object
/// is handed to a caller the permit is forgotten and the slot is given back
/// through [`release`](Self::release).
pub(crate) struct AdmissionGate {
    semaphore: Semaphore,
    acquire_timeout: Option<Duration>,
    timeouts: AtomicU64,
}

impl AdmissionGate {
    pub(crate) fn new(capacity: usize, acquire_timeout: Option<Duration>) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            acquire_timeout,
            timeouts: AtomicU64::new(0),
        }
    }

    /// Wait for a slot, honoring the acquire timeout and `cancel`.
    pub(crate) async fn enter(&self, cancel: &CancellationToken) -> PoolResult<SemaphorePermit<'_>> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        match self.semaphore.try_acquire() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let acquired = match self.acquire_timeout {
            None => tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PoolError::Cancelled),
                acquired = self.semaphore.acquire() => acquired,
            },
            Some(timeout) => tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PoolError::Cancelled),
                acquired = tokio::time::timeout(timeout, self.semaphore.acquire()) => match acquired {
                    Ok(acquired) => acquired,
                    Err(_) => {
                        self.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(PoolError::Timeout(timeout));
                    }
                },
            },
        };

        acquired.map_err(|_| PoolError::Closed)
    }

    /// Wait for a slot without a deadline. Returns `None` once closed.
    pub(crate) async fn enter_unbounded(&self) -> Option<SemaphorePermit<'_>> {
        self.semaphore.acquire().await.ok()
    }

    /// Give back a slot whose permit was forgotten.
    pub(crate) fn release(&self) {
        self.semaphore.add_permits(1);
    }

    /// Wake every waiter with [`PoolError::Closed`] and refuse new ones.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub(crate) fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}
