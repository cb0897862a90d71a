//! Circuit breaker guarding the object constructor

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::errors::BackendError;

/// Circuit breaker state
///
/// # Examples
///
/// ```
/// use stale_pool::CircuitBreakerState;
///
/// assert_ne!(CircuitBreakerState::Closed, CircuitBreakerState::Open);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Circuit is closed - constructor is called normally
    Closed,

    /// Circuit is open - the cached error is returned without calling
    /// the constructor
    Open,

    /// Circuit is half-open - trial constructions are let through
    HalfOpen,
}

struct BreakerInner {
    state: CircuitBreakerState,
    failure_streak: usize,
    last_error: Option<BackendError>,
    opened_at: Option<Instant>,
}

/// Counts consecutive constructor failures and short-circuits once the
/// streak reaches the threshold.
pub(crate) struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: usize,
    cooldown: Option<Duration>,
}

impl CircuitBreaker {
    pub(crate) fn new(failure_threshold: usize, cooldown: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_streak: 0,
                last_error: None,
                opened_at: None,
            }),
            failure_threshold,
            cooldown,
        }
    }

    pub(crate) fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Returns the cached error if construction must be skipped.
    pub(crate) fn check(&self) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitBreakerState::Open {
            return Ok(());
        }

        if let (Some(cooldown), Some(opened_at)) = (self.cooldown, inner.opened_at)
            && opened_at.elapsed() >= cooldown
        {
            inner.state = CircuitBreakerState::HalfOpen;
            return Ok(());
        }

        match &inner.last_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::Closed;
        inner.failure_streak = 0;
        inner.opened_at = None;
    }

    /// Record a failed construction. Returns `true` if this failure opened
    /// the circuit.
    pub(crate) fn record_failure(&self, err: BackendError) -> bool {
        let mut inner = self.inner.lock();
        inner.failure_streak += 1;
        inner.last_error = Some(err);

        let trip = match inner.state {
            CircuitBreakerState::Closed => inner.failure_streak >= self.failure_threshold,
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => false,
        };
        if trip {
            inner.state = CircuitBreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
        trip
    }

    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::Closed;
        inner.failure_streak = 0;
        inner.last_error = None;
        inner.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PoolError;

    #[derive(Debug, thiserror::Error)]
    #[error("database is down")]
    struct Down;

    fn down() -> BackendError {
        PoolError::backend(Down)
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, None);

        assert!(!breaker.record_failure(down()));
        assert!(!breaker.record_failure(down()));
        assert!(breaker.check().is_ok());
        assert!(breaker.record_failure(down()));

        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        let cached = breaker.check().unwrap_err();
        assert_eq!(cached.to_string(), "database is down");
    }

    #[test]
    fn test_success_resets_streak() {
        let breaker = CircuitBreaker::new(2, None);

        breaker.record_failure(down());
        breaker.record_success();
        breaker.record_failure(down());

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_reset_closes_circuit() {
        let breaker = CircuitBreaker::new(1, None);
        breaker.record_failure(down());
        assert!(breaker.check().is_err());

        breaker.reset();
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Some(Duration::from_secs(5)));
        breaker.record_failure(down());
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);

        // a failed trial re-opens immediately
        assert!(breaker.record_failure(down()));
        assert!(breaker.check().is_err());
    }
}
