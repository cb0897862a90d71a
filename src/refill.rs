//! Keeps the idle list topped up to `min_idle`

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Manager;
use crate::item::Entry;
use crate::pool::{PoolInner, PoolState};

/// One unit of capacity claimed for a background construction.
///
/// Created after `size` and `pending_idle` were bumped under the lock.
/// Settles exactly once: [`commit`](Self::commit) moves the new object into
/// the idle list, dropping an uncommitted ticket rolls both counters back.
struct Reservation<M: Manager> {
    pool: Arc<PoolInner<M>>,
    settled: bool,
}

impl<M: Manager> Reservation<M> {
    fn new(pool: Arc<PoolInner<M>>) -> Self {
        Self {
            pool,
            settled: false,
        }
    }

    fn commit(mut self, entry: Entry<M::Type>) {
        self.settled = true;
        let rejected = {
            let mut state = self.pool.state.lock();
            state.pending_idle -= 1;
            if state.closed {
                state.size = state.size.saturating_sub(1);
                Some(entry)
            } else {
                state.registry.push(entry.id);
                state.idle.push_back(entry);
                None
            }
        };
        if let Some(entry) = rejected {
            let _ = self.pool.close_value(entry);
        }
    }
}

impl<M: Manager> Drop for Reservation<M> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.pool.state.lock();
        state.pending_idle -= 1;
        state.size = state.size.saturating_sub(1);
    }
}

impl<M: Manager> PoolInner<M> {
    /// Claim capacity for enough background constructions to reach
    /// `min_idle`. Called with the lock held whenever the idle list shrinks
    /// or a pooled object goes away.
    pub(crate) fn reserve_refill(&self, state: &mut PoolState<M::Type>) -> usize {
        let min_idle = self.config.min_idle;
        if min_idle == 0 || state.closed {
            return 0;
        }

        let mut reserved = 0;
        while state.size < self.config.capacity && state.idle.len() + state.pending_idle < min_idle {
            state.size += 1;
            state.pending_idle += 1;
            reserved += 1;
        }
        reserved
    }

    /// Start one construction per reserved unit. Must be called after the
    /// lock is released.
    pub(crate) fn spawn_refill(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let reservation = Reservation::new(Arc::clone(self));
            match &self.runtime {
                Some(runtime) => {
                    runtime.spawn(fill(reservation, self.shutdown.child_token()));
                }
                // nothing to run on: the ticket rolls back right away
                None => drop(reservation),
            }
        }
    }
}

async fn fill<M: Manager>(reservation: Reservation<M>, cancel: CancellationToken) {
    match reservation.pool.create_entry(&cancel, true).await {
        Ok(entry) => {
            debug!(id = entry.id, "idle object created");
            reservation.commit(entry);
        }
        Err(err) => {
            debug!(error = %err, "idle refill failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Pool, PoolConfiguration, PoolError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("refused")]
    struct Refused;

    #[derive(Default)]
    struct Flaky {
        created: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Manager for Flaky {
        type Type = usize;
        type Error = Refused;

        async fn create(&self, _cancel: &CancellationToken) -> Result<usize, Refused> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Refused);
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn counters<M: Manager>(pool: &Pool<M>) -> (usize, usize, usize) {
        let state = pool.inner.state.lock();
        (state.size, state.idle.len(), state.pending_idle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fills_to_min_idle_on_start() {
        let pool = Pool::new(
            Flaky::default(),
            PoolConfiguration::new().with_capacity(4).with_min_idle(2),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(counters(&pool), (2, 2, 0));
        assert_eq!(pool.total_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refill_rolls_back() {
        let manager = Flaky::default();
        manager.failing.store(true, Ordering::SeqCst);
        let pool = Pool::new(
            manager,
            PoolConfiguration::new().with_capacity(4).with_min_idle(3),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(counters(&pool), (0, 0, 0));
        assert_eq!(pool.stats().creation_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_checkout() {
        let pool = Pool::new(
            Flaky::default(),
            PoolConfiguration::new().with_capacity(3).with_min_idle(1),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(counters(&pool), (1, 1, 0));

        let cancel = CancellationToken::new();
        let item = pool.get(&cancel).await.unwrap();
        assert_eq!(pool.stats().hits, 1);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(counters(&pool), (2, 1, 0));

        pool.put(item).unwrap();
        assert_eq!(counters(&pool), (2, 2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let pool = Pool::new(
            Flaky::default(),
            PoolConfiguration::new().with_capacity(2).with_min_idle(2),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let cancel = CancellationToken::new();
        let a = pool.get(&cancel).await.unwrap();
        let b = pool.get(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let (size, idle, pending) = counters(&pool);
        assert_eq!((size, idle, pending), (2, 0, 0));
        assert!(matches!(
            pool.get(&cancel).await,
            Err(PoolError::Timeout(_))
        ));
        drop((a, b));
    }
}
