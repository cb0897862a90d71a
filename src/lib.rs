//! # stale_pool
//!
//! Bounded, thread-safe async object pool for expensive resources such as
//! connections, clients or large buffers.
//!
//! ## Features
//!
//! - Admission control: at most `capacity` pooled objects are lent out, and
//!   callers wait (with timeout and cancellation) for a free slot
//! - LIFO reuse of idle objects, validated on release
//! - Automatic return of objects via RAII (Drop trait)
//! - Background refill up to a minimum number of idle objects
//! - Background reaping of objects past their idle timeout or max age
//! - Circuit breaker around a failing constructor
//! - Statistics and Prometheus metrics export
//!
//! ## Quick Start
//!
//! ```rust
//! use stale_pool::{Manager, Pool, PoolConfiguration};
//! use std::convert::Infallible;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Connections;
//!
//! #[async_trait::async_trait]
//! impl Manager for Connections {
//!     type Type = String;
//!     type Error = Infallible;
//!
//!     async fn create(&self, _cancel: &CancellationToken) -> Result<String, Infallible> {
//!         Ok("connection".to_string())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = Pool::new(Connections, PoolConfiguration::default()).unwrap();
//! let cancel = CancellationToken::new();
//! {
//!     let conn = pool.get(&cancel).await.unwrap();
//!     println!("Got: {}", *conn);
//!     // Object automatically returned when `conn` goes out of scope
//! }
//! assert_eq!(pool.idle_count(), 1);
//! # }
//! ```

mod circuit_breaker;
mod config;
mod errors;
mod eviction;
mod gate;
mod item;
mod metrics;
mod pool;
mod reaper;
mod refill;

pub use circuit_breaker::CircuitBreakerState;
pub use config::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CAPACITY, PoolConfiguration};
pub use errors::{BackendError, PoolError, PoolResult};
pub use eviction::EvictionPolicy;
pub use item::PoolItem;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolStats;
pub use pool::Pool;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Manager responsible for creating, validating and closing the objects of
/// a [`Pool`].
///
/// None of these methods is ever called while the pool's internal lock is
/// held, so they may block or take as long as they need.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Type of the objects this manager creates.
    type Type: Send + 'static;

    /// Error reported by the manager.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new object.
    ///
    /// `cancel` is the token the caller passed to [`Pool::get`], or the
    /// pool's shutdown token for background refills.
    async fn create(&self, cancel: &CancellationToken) -> Result<Self::Type, Self::Error>;

    /// Releases the resources held by `obj`. Defaults to dropping it.
    fn close(&self, obj: Self::Type) -> Result<(), Self::Error> {
        drop(obj);
        Ok(())
    }

    /// Checks an object being returned to the pool. Rejected objects are
    /// closed instead of reused. Accepts everything by default.
    fn validate(&self, _obj: &Self::Type) -> Result<(), Self::Error> {
        Ok(())
    }
}
