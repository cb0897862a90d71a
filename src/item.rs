//! Pooled objects and the handle callers hold

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use crossbeam::atomic::AtomicCell;
use tokio::time::Instant;
use tracing::debug;

use crate::Manager;
use crate::pool::PoolInner;

/// One resource plus its lifecycle timestamps.
///
/// Owned by exactly one side at a time: the idle list or a [`PoolItem`].
pub(crate) struct Entry<T> {
    pub(crate) id: u64,
    pub(crate) value: T,
    pub(crate) created_at: Instant,
    last_used_at: AtomicCell<Instant>,
    pub(crate) pooled: bool,
}

impl<T> Entry<T> {
    pub(crate) fn new(id: u64, value: T, pooled: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            value,
            created_at: now,
            last_used_at: AtomicCell::new(now),
            pooled,
        }
    }

    pub(crate) fn last_used_at(&self) -> Instant {
        self.last_used_at.load()
    }

    pub(crate) fn touch(&self) {
        self.last_used_at.store(Instant::now());
    }
}

/// An object lent out by a [`Pool`](crate::Pool).
///
/// Derefs to the managed resource. Hand it back with
/// [`Pool::put`](crate::Pool::put) or discard it with
/// [`Pool::remove`](crate::Pool::remove); dropping it has the same effect as
/// `put`.
pub struct PoolItem<M: Manager> {
    entry: Option<Entry<M::Type>>,
    holds_slot: bool,
    pool: Weak<PoolInner<M>>,
}

impl<M: Manager> PoolItem<M> {
    pub(crate) fn new(entry: Entry<M::Type>, holds_slot: bool, pool: &Arc<PoolInner<M>>) -> Self {
        Self {
            entry: Some(entry),
            holds_slot,
            pool: Arc::downgrade(pool),
        }
    }

    /// Hand the entry back to the pool, leaving this handle empty.
    pub(crate) fn into_parts(mut self) -> Option<(Entry<M::Type>, bool)> {
        self.entry.take().map(|entry| (entry, self.holds_slot))
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner<M>>) -> bool {
        Weak::ptr_eq(&self.pool, &Arc::downgrade(pool))
    }

    /// The pool this item was lent by, if it is still alive.
    pub(crate) fn owner(&self) -> Option<Arc<PoolInner<M>>> {
        self.pool.upgrade()
    }

    fn entry(&self) -> &Entry<M::Type> {
        // Only `into_parts`, `take` and `drop` empty the slot, and all of
        // them consume the handle.
        self.entry.as_ref().expect("pool item already released")
    }

    /// Identifier of this object, unique within its pool.
    pub fn id(&self) -> u64 {
        self.entry().id
    }

    /// When the object was constructed.
    pub fn created_at(&self) -> Instant {
        self.entry().created_at
    }

    /// When the object was last returned to the idle list (or created).
    pub fn last_used_at(&self) -> Instant {
        self.entry().last_used_at()
    }

    /// Whether the object counts against capacity and will be reused.
    ///
    /// Unmanaged objects and objects built while the pool was over
    /// capacity are closed on release instead.
    pub fn is_pooled(&self) -> bool {
        self.entry().pooled
    }

    /// Take the resource out of the pool permanently.
    ///
    /// The object is unregistered and its slot freed, but the closer is not
    /// called: the caller now owns the resource.
    pub fn take(this: Self) -> M::Type {
        let pool = this.pool.upgrade();
        let (entry, holds_slot) = match this.into_parts() {
            Some(parts) => parts,
            None => unreachable!("pool item already released"),
        };
        if let Some(pool) = pool {
            pool.detach(&entry, holds_slot);
        }
        entry.value
    }
}

impl<M: Manager> Deref for PoolItem<M> {
    type Target = M::Type;

    fn deref(&self) -> &Self::Target {
        &self.entry().value
    }
}

impl<M: Manager> DerefMut for PoolItem<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .entry
            .as_mut()
            .expect("pool item already released")
            .value
    }
}

impl<M: Manager> Drop for PoolItem<M> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade()
            && let Err(err) = pool.release(entry, self.holds_slot)
        {
            debug!(error = %err, "dropped pool item was discarded");
        }
    }
}

impl<M> fmt::Debug for PoolItem<M>
where
    M: Manager,
    M::Type: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PoolItem");
        if let Some(entry) = &self.entry {
            debug
                .field("id", &entry.id)
                .field("value", &entry.value)
                .field("pooled", &entry.pooled);
        }
        debug.field("holds_slot", &self.holds_slot).finish()
    }
}
