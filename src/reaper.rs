//! Background eviction of stale idle objects

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::Manager;
use crate::pool::PoolInner;

/// Periodic task that evicts idle objects past their idle timeout or max
/// age, oldest first.
///
/// Holds only a weak reference to the pool and stops as soon as the pool is
/// closed or dropped.
pub(crate) struct StaleReaper<M: Manager> {
    pool: Weak<PoolInner<M>>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl<M: Manager> StaleReaper<M> {
    pub(crate) fn spawn(runtime: &Handle, pool: &Arc<PoolInner<M>>, interval: Duration) {
        let reaper = Self {
            pool: Arc::downgrade(pool),
            interval,
            shutdown: pool.shutdown.clone(),
        };
        runtime.spawn(reaper.run());
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(pool) = self.pool.upgrade() else {
                break;
            };
            // the tick and the shutdown can become ready together
            if pool.is_closed() {
                break;
            }

            let evicted = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                evicted = pool.reap_stale() => evicted,
            };
            if evicted > 0 {
                debug!(evicted, "reaped stale objects");
            }
        }

        trace!("stale reaper stopped");
    }
}

impl<M: Manager> PoolInner<M> {
    /// Evict stale objects from the front of the idle list until the front
    /// is fresh. Idle objects are ordered by release time, so the first
    /// fresh one means the rest are fresh too.
    pub(crate) async fn reap_stale(self: &Arc<Self>) -> usize {
        let mut evicted = 0;
        loop {
            let Some(permit) = self.gate.enter_unbounded().await else {
                break;
            };

            let (stale, refill) = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let front_is_stale = state
                    .idle
                    .front()
                    .is_some_and(|entry| self.is_stale(entry, now));
                match front_is_stale.then(|| state.idle.pop_front()).flatten() {
                    Some(entry) => {
                        let refill = self.unregister(&mut state, &entry);
                        (Some(entry), refill)
                    }
                    None => (None, 0),
                }
            };
            drop(permit);
            self.spawn_refill(refill);

            let Some(entry) = stale else {
                break;
            };
            if let Err(err) = self.close_value(entry) {
                debug!(error = %err, "stale object closed with an error");
            }
            evicted += 1;
        }

        self.metrics.record_stale(evicted as u64);
        evicted
    }
}

#[cfg(test)]
mod tests {
    use crate::{Manager, Pool, PoolConfiguration};
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Sockets {
        next: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Manager for Sockets {
        type Type = usize;
        type Error = Infallible;

        async fn create(&self, _cancel: &CancellationToken) -> Result<usize, Infallible> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn close(&self, _obj: usize) -> Result<(), Infallible> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_reap_stops_at_first_fresh_object() {
        let pool = Pool::new(
            Sockets::default(),
            PoolConfiguration::new()
                .with_capacity(3)
                .with_idle_timeout(10 * SECOND),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let first = pool.get(&cancel).await.unwrap();
        let second = pool.get(&cancel).await.unwrap();
        pool.put(first).unwrap();
        tokio::time::advance(6 * SECOND).await;
        pool.put(second).unwrap();
        tokio::time::advance(5 * SECOND).await;

        // only the object released first has been idle for 10s
        assert_eq!(pool.reap_stale_objects().await, 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.total_count(), 1);
        assert_eq!(pool.stats().stale_evictions, 1);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reaper_evicts() {
        let pool = Pool::new(
            Sockets::default(),
            PoolConfiguration::new()
                .with_capacity(2)
                .with_idle_timeout(SECOND)
                .with_reap_interval(SECOND / 2),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let item = pool.get(&cancel).await.unwrap();
        pool.put(item).unwrap();
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(3 * SECOND).await;

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_count(), 0);
        assert_eq!(pool.stats().stale_evictions, 1);
        assert_eq!(pool.stats().available_slots, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_exits_on_close() {
        let pool = Pool::new(
            Sockets::default(),
            PoolConfiguration::new()
                .with_idle_timeout(SECOND)
                .with_reap_interval(SECOND),
        )
        .unwrap();
        let weak = Arc::downgrade(&pool.inner);

        pool.close().unwrap();
        drop(pool);
        tokio::time::sleep(2 * SECOND).await;

        assert!(weak.upgrade().is_none());
    }
}
