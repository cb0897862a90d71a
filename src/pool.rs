//! Core object pool implementation

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Manager;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::EvictionPolicy;
use crate::gate::AdmissionGate;
use crate::item::{Entry, PoolItem};
use crate::metrics::{MetricsTracker, Occupancy, PoolStats};
use crate::reaper::StaleReaper;

/// Bookkeeping guarded by the pool lock.
pub(crate) struct PoolState<T> {
    /// Ids of every live object, pooled or not, in creation order.
    pub(crate) registry: Vec<u64>,
    /// Reuse pops from the back, reaping pops from the front.
    pub(crate) idle: VecDeque<Entry<T>>,
    /// Pooled objects counted against capacity, refill reservations included.
    pub(crate) size: usize,
    /// Refill reservations whose construction has not finished yet.
    pub(crate) pending_idle: usize,
    pub(crate) closed: bool,
}

pub(crate) struct PoolInner<M: Manager> {
    pub(crate) manager: M,
    pub(crate) config: PoolConfiguration,
    pub(crate) eviction: EvictionPolicy,
    pub(crate) gate: AdmissionGate,
    pub(crate) state: Mutex<PoolState<M::Type>>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) metrics: MetricsTracker,
    pub(crate) shutdown: CancellationToken,
    pub(crate) runtime: Option<Handle>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// Bounded async object pool.
///
/// Lends at most `capacity` pooled objects at a time, reuses idle objects
/// most-recently-released first, keeps `min_idle` objects warm and retires
/// stale ones in the background.
///
/// This struct can be cloned and transferred across thread boundaries; all
/// clones share the same pool.
///
/// # Examples
///
/// ```
/// use stale_pool::{Manager, Pool, PoolConfiguration};
/// use std::convert::Infallible;
/// use tokio_util::sync::CancellationToken;
///
/// struct Buffers;
///
/// #[async_trait::async_trait]
/// impl Manager for Buffers {
///     type Type = Vec<u8>;
///     type Error = Infallible;
///
///     async fn create(&self, _cancel: &CancellationToken) -> Result<Vec<u8>, Infallible> {
///         Ok(Vec::with_capacity(4096))
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), stale_pool::PoolError> {
/// let pool = Pool::new(Buffers, PoolConfiguration::new().with_capacity(2))?;
/// let cancel = CancellationToken::new();
///
/// let mut buffer = pool.get(&cancel).await?;
/// buffer.extend_from_slice(b"hello");
/// let id = buffer.id();
/// pool.put(buffer)?;
///
/// // the same buffer is handed out again
/// let buffer = pool.get(&cancel).await?;
/// assert_eq!(buffer.id(), id);
/// # Ok(())
/// # }
/// ```
pub struct Pool<M: Manager> {
    pub(crate) inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: Manager> Pool<M> {
    /// Create a new pool around `manager`.
    ///
    /// Starts filling the pool up to `min_idle` and, if both an idle timeout
    /// and a reap interval are configured, spawns the stale reaper.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfiguration`] if the configuration is
    /// inconsistent, or if background work is configured but no Tokio
    /// runtime is running.
    pub fn new(manager: M, config: PoolConfiguration) -> PoolResult<Self> {
        config.validate()?;
        let config = config.normalized();

        let runtime = Handle::try_current().ok();
        if runtime.is_none() && (config.min_idle > 0 || config.reaper_enabled()) {
            return Err(PoolError::InvalidConfiguration(
                "min_idle and the stale reaper require a running Tokio runtime".to_string(),
            ));
        }

        let capacity = config.capacity;
        let inner = Arc::new(PoolInner {
            eviction: EvictionPolicy::from_limits(config.max_object_age, config.idle_timeout),
            gate: AdmissionGate::new(capacity, config.acquire_timeout),
            state: Mutex::new(PoolState {
                registry: Vec::with_capacity(capacity),
                idle: VecDeque::with_capacity(capacity),
                size: 0,
                pending_idle: 0,
                closed: false,
            }),
            breaker: CircuitBreaker::new(capacity, config.circuit_breaker_cooldown),
            metrics: MetricsTracker::default(),
            shutdown: CancellationToken::new(),
            runtime,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            manager,
            config,
        });

        info!(
            capacity,
            min_idle = inner.config.min_idle,
            reaper = inner.config.reaper_enabled(),
            "object pool created"
        );

        let refill = inner.reserve_refill(&mut inner.state.lock());
        inner.spawn_refill(refill);

        if let (Some(runtime), Some(interval)) = (&inner.runtime, inner.config.reap_interval)
            && inner.config.reaper_enabled()
        {
            StaleReaper::spawn(runtime, &inner, interval);
        }

        Ok(Self { inner })
    }

    /// Retrieve an idle object or construct a new one.
    ///
    /// Waits for an admission slot first, up to the configured acquire
    /// timeout or until `cancel` fires. Stale idle objects met on the way
    /// are closed. `cancel` is also passed to the constructor.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`], [`PoolError::Timeout`], [`PoolError::Cancelled`]
    /// or [`PoolError::Construction`] (possibly the cached error of an open
    /// circuit breaker).
    pub async fn get(&self, cancel: &CancellationToken) -> PoolResult<PoolItem<M>> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = inner.gate.enter(cancel).await?;

        loop {
            let (entry, refill) = {
                let mut state = inner.state.lock();
                match state.idle.pop_back() {
                    Some(entry) => {
                        let refill = inner.reserve_refill(&mut state);
                        (Some(entry), refill)
                    }
                    None => (None, 0),
                }
            };
            inner.spawn_refill(refill);

            let Some(entry) = entry else {
                break;
            };
            if inner.is_stale(&entry, Instant::now()) {
                debug!(id = entry.id, "evicting stale object on get");
                inner.metrics.record_stale(1);
                if let Err(err) = inner.close_entry(entry) {
                    debug!(error = %err, "stale object closed with an error");
                }
                continue;
            }

            inner.metrics.record_hit();
            permit.forget();
            return Ok(PoolItem::new(entry, true, inner));
        }

        inner.metrics.record_miss();
        // on error the permit drops here and frees the slot
        let entry = inner.new_entry(cancel, true).await?;
        permit.forget();
        Ok(PoolItem::new(entry, true, inner))
    }

    /// Construct an unmanaged object.
    ///
    /// Bypasses admission control and does not count against capacity. The
    /// object is always closed on release, never reused.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] or [`PoolError::Construction`].
    pub async fn new_object(&self, cancel: &CancellationToken) -> PoolResult<PoolItem<M>> {
        let entry = self.inner.new_entry(cancel, false).await?;
        Ok(PoolItem::new(entry, false, &self.inner))
    }

    /// Return an object to the pool.
    ///
    /// The object is validated first; rejected, unmanaged and demoted
    /// objects are closed instead of becoming idle. The admission slot is
    /// released either way.
    ///
    /// # Errors
    ///
    /// [`PoolError::Validation`] if the validator rejected the object, or
    /// [`PoolError::Closed`] if the pool was closed. Both are informational:
    /// the object has already been disposed of.
    pub fn put(&self, item: PoolItem<M>) -> PoolResult<()> {
        if !item.belongs_to(&self.inner) {
            // released to the pool it came from
            drop(item);
            return Ok(());
        }
        match item.into_parts() {
            Some((entry, holds_slot)) => self.inner.release(entry, holds_slot),
            None => Ok(()),
        }
    }

    /// Discard an object: unregister it, free its slot and close it.
    ///
    /// `reason` is only logged. An item lent by another pool is discarded
    /// through that pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::Close`] if the closer failed.
    pub fn remove(&self, item: PoolItem<M>, reason: Option<&dyn StdError>) -> PoolResult<()> {
        let reason = reason.map_or_else(|| "removed by caller".to_string(), ToString::to_string);
        let owner = if item.belongs_to(&self.inner) {
            Arc::clone(&self.inner)
        } else {
            warn!(%reason, "removing an item that belongs to another pool");
            match item.owner() {
                Some(owner) => owner,
                // the owning pool is gone, nothing left to account for
                None => return Ok(()),
            }
        };
        match item.into_parts() {
            Some((entry, holds_slot)) => owner.discard(entry, holds_slot, &reason),
            None => Ok(()),
        }
    }

    /// Close the pool and every idle object.
    ///
    /// Waiting and future calls fail with [`PoolError::Closed`]. Objects
    /// still checked out are closed when they are released.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] if the pool was already closed, otherwise the
    /// first error reported by the closer. Every object is closed even if
    /// some fail.
    pub fn close(&self) -> PoolResult<()> {
        let inner = &self.inner;
        if inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PoolError::Closed);
        }

        inner.shutdown.cancel();
        inner.gate.close();

        let (drained, checked_out) = {
            let mut state = inner.state.lock();
            state.closed = true;
            let drained = std::mem::take(&mut state.idle);
            let checked_out = state.registry.len().saturating_sub(drained.len());
            state.registry.clear();
            state.size = 0;
            (drained, checked_out)
        };

        info!(idle = drained.len(), checked_out, "closing object pool");

        let mut first_error = None;
        for entry in drained {
            if let Err(err) = inner.close_value(entry) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of live objects, pooled or not.
    ///
    /// Reports 0 once the pool is closed, even while objects checked out
    /// before the close are still in use. Those are closed as they are
    /// released.
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// Number of objects in the idle list.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let occupancy = {
            let state = inner.state.lock();
            Occupancy {
                total: state.registry.len(),
                idle: state.idle.len(),
                size: state.size,
                capacity: inner.config.capacity,
                available: inner.gate.available(),
            }
        };
        inner.metrics.snapshot(inner.gate.timeouts(), occupancy)
    }

    /// Run one reaper pass now, returning how many objects were evicted.
    ///
    /// Waits for an admission slot before each check, like the background
    /// reaper.
    pub async fn reap_stale_objects(&self) -> usize {
        self.inner.reap_stale().await
    }

    /// Current state of the constructor circuit breaker.
    pub fn circuit_breaker_state(&self) -> CircuitBreakerState {
        self.inner.breaker.state()
    }

    /// Close the circuit breaker and forget the cached error.
    pub fn reset_circuit_breaker(&self) {
        self.inner.breaker.reset();
    }

    /// The manager this pool was built with.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// The effective configuration.
    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }
}

impl<M: Manager> PoolInner<M> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_stale(&self, entry: &Entry<M::Type>, now: Instant) -> bool {
        self.eviction
            .is_stale(entry.created_at, entry.last_used_at(), now)
    }

    /// Call the constructor unless the pool is closed or the circuit
    /// breaker is open.
    pub(crate) async fn create_entry(
        &self,
        cancel: &CancellationToken,
        pooled: bool,
    ) -> PoolResult<Entry<M::Type>> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        self.breaker.check().map_err(PoolError::Construction)?;

        match self.manager.create(cancel).await {
            Ok(value) => {
                self.breaker.record_success();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Ok(Entry::new(id, value, pooled))
            }
            Err(err) => {
                self.metrics.record_creation_failure();
                let err = PoolError::backend(err);
                if self.breaker.record_failure(err.clone()) {
                    warn!(error = %err, "constructor keeps failing, circuit breaker opened");
                } else {
                    warn!(error = %err, "failed to create object");
                }
                Err(PoolError::Construction(err))
            }
        }
    }

    /// Construct and register a new object.
    async fn new_entry(
        &self,
        cancel: &CancellationToken,
        pooled: bool,
    ) -> PoolResult<Entry<M::Type>> {
        let mut entry = self.create_entry(cancel, pooled).await?;

        let registered = {
            let mut state = self.state.lock();
            if state.closed {
                false
            } else {
                state.registry.push(entry.id);
                if pooled {
                    if state.size >= self.config.capacity {
                        // over capacity after a concurrent refill: close it
                        // on release instead of keeping it
                        entry.pooled = false;
                    } else {
                        state.size += 1;
                    }
                }
                true
            }
        };

        if !registered {
            let _ = self.close_value(entry);
            return Err(PoolError::Closed);
        }
        if pooled && !entry.pooled {
            debug!(id = entry.id, "pool over capacity, object demoted to unmanaged");
        }
        Ok(entry)
    }

    /// Put a released object back in the idle list, or discard it.
    pub(crate) fn release(
        self: &Arc<Self>,
        entry: Entry<M::Type>,
        holds_slot: bool,
    ) -> PoolResult<()> {
        if self.is_closed() {
            let _ = self.discard(entry, holds_slot, "pool closed");
            return Err(PoolError::Closed);
        }

        if let Err(err) = self.manager.validate(&entry.value) {
            self.metrics.record_validation_failure();
            let err = PoolError::Validation(PoolError::backend(err));
            let _ = self.discard(entry, holds_slot, &err.to_string());
            return Err(err);
        }

        if !entry.pooled {
            return self.discard(entry, holds_slot, "unmanaged object");
        }

        // visible to the reaper only after the timestamp is updated
        entry.touch();
        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(entry)
            } else {
                state.idle.push_back(entry);
                None
            }
        };

        match rejected {
            Some(entry) => {
                let _ = self.discard(entry, holds_slot, "pool closed");
                Err(PoolError::Closed)
            }
            None => {
                if holds_slot {
                    self.gate.release();
                }
                Ok(())
            }
        }
    }

    /// Unregister, free the slot if held, then close outside the lock.
    pub(crate) fn discard(
        self: &Arc<Self>,
        entry: Entry<M::Type>,
        holds_slot: bool,
        reason: &str,
    ) -> PoolResult<()> {
        debug!(id = entry.id, pooled = entry.pooled, reason, "discarding object");
        let refill = self.unregister(&mut self.state.lock(), &entry);
        self.spawn_refill(refill);
        if holds_slot {
            self.gate.release();
        }
        self.close_value(entry)
    }

    /// Unregister and close an object that holds no admission slot.
    pub(crate) fn close_entry(self: &Arc<Self>, entry: Entry<M::Type>) -> PoolResult<()> {
        let refill = self.unregister(&mut self.state.lock(), &entry);
        self.spawn_refill(refill);
        self.close_value(entry)
    }

    /// Forget an object without closing it.
    pub(crate) fn detach(self: &Arc<Self>, entry: &Entry<M::Type>, holds_slot: bool) {
        let refill = self.unregister(&mut self.state.lock(), entry);
        self.spawn_refill(refill);
        if holds_slot {
            self.gate.release();
        }
    }

    /// Drop `entry` from the registry. Returns the refill units reserved
    /// as a result.
    pub(crate) fn unregister(&self, state: &mut PoolState<M::Type>, entry: &Entry<M::Type>) -> usize {
        let Some(position) = state.registry.iter().position(|id| *id == entry.id) else {
            return 0;
        };
        state.registry.remove(position);
        if !entry.pooled {
            return 0;
        }
        state.size -= 1;
        self.reserve_refill(state)
    }

    pub(crate) fn close_value(&self, entry: Entry<M::Type>) -> PoolResult<()> {
        let id = entry.id;
        self.manager.close(entry.value).map_err(|err| {
            let err = PoolError::backend(err);
            warn!(id, error = %err, "failed to close object");
            PoolError::Close(err)
        })
    }
}

impl<M: Manager> Drop for PoolInner<M> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if self.is_closed() {
            return;
        }
        let idle = std::mem::take(&mut self.state.get_mut().idle);
        for entry in idle {
            let _ = self.close_value(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Numbers {
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Manager for Numbers {
        type Type = usize;
        type Error = Infallible;

        async fn create(&self, _cancel: &CancellationToken) -> Result<usize, Infallible> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        fn close(&self, _obj: usize) -> Result<(), Infallible> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(capacity: usize) -> Pool<Numbers> {
        Pool::new(Numbers::default(), PoolConfiguration::new().with_capacity(capacity)).unwrap()
    }

    #[tokio::test]
    async fn test_pool_basic() {
        let pool = pool(3);
        let cancel = CancellationToken::new();

        {
            let obj = pool.get(&cancel).await.unwrap();
            assert_eq!(*obj, 0);
        }

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.total_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_tracks_checked_out_and_idle() {
        let pool = pool(3);
        let cancel = CancellationToken::new();

        let a = pool.get(&cancel).await.unwrap();
        let b = pool.get(&cancel).await.unwrap();
        pool.put(a).unwrap();

        let state = pool.inner.state.lock();
        assert_eq!(state.registry.len(), 2);
        assert_eq!(state.idle.len(), 1);
        assert_eq!(state.size, 2);
        drop(state);
        drop(b);
    }

    #[tokio::test]
    async fn test_demoted_when_over_capacity() {
        let pool = pool(1);
        let cancel = CancellationToken::new();

        // simulate a concurrent refill having claimed the only unit
        pool.inner.state.lock().size = 1;
        let item = pool.get(&cancel).await.unwrap();
        assert!(!item.is_pooled());

        pool.put(item).unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().available_slots, 1);
    }

    #[tokio::test]
    async fn test_take_detaches_without_closing() {
        let pool = pool(2);
        let cancel = CancellationToken::new();

        let item = pool.get(&cancel).await.unwrap();
        let value = PoolItem::take(item);

        assert_eq!(value, 0);
        assert_eq!(pool.total_count(), 0);
        assert_eq!(pool.stats().size, 0);
        assert_eq!(pool.stats().available_slots, 2);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_closes_idle_objects() {
        let manager = Numbers::default();
        let closed = Arc::clone(&manager.closed);
        let pool = Pool::new(manager, PoolConfiguration::new().with_capacity(2)).unwrap();
        let cancel = CancellationToken::new();

        let kept = pool.get(&cancel).await.unwrap();
        let idle = pool.get(&cancel).await.unwrap();
        pool.put(idle).unwrap();

        drop(pool);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // the pool is gone, so the value is simply dropped
        drop(kept);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
