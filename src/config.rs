//! Pool configuration options

use std::time::Duration;

use crate::errors::{PoolError, PoolResult};

/// Capacity used when none (or zero) is configured.
pub const DEFAULT_CAPACITY: usize = 5;

/// Default time a caller waits for a free slot before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for object pool behavior
///
/// Zero durations are treated the same as unset ones.
///
/// # Examples
///
/// ```
/// use stale_pool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_capacity(10)
///     .with_min_idle(2)
///     .with_idle_timeout(Duration::from_secs(60))
///     .with_reap_interval(Duration::from_secs(10));
///
/// assert_eq!(config.capacity, 10);
/// assert!(config.reaper_enabled());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfiguration {
    /// Maximum number of pooled objects alive at once
    pub capacity: usize,

    /// Number of idle objects the pool tries to keep ready
    pub min_idle: usize,

    /// Objects older than this are evicted regardless of use
    pub max_object_age: Option<Duration>,

    /// Objects idle for longer than this are evicted
    pub idle_timeout: Option<Duration>,

    /// How long `get` waits for a free slot; `None` waits until cancelled
    pub acquire_timeout: Option<Duration>,

    /// Interval of the background stale reaper
    pub reap_interval: Option<Duration>,

    /// How long the circuit breaker stays open before letting a trial
    /// construction through; `None` keeps it open until reset
    pub circuit_breaker_cooldown: Option<Duration>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            min_idle: 0,
            max_object_age: None,
            idle_timeout: None,
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
            reap_interval: None,
            circuit_breaker_cooldown: None,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use stale_pool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_capacity(50);
    ///
    /// assert_eq!(config.capacity, 50);
    /// ```
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the minimum number of idle objects to keep ready
    pub fn with_min_idle(mut self, count: usize) -> Self {
        self.min_idle = count;
        self
    }

    /// Set the maximum object age
    pub fn with_max_object_age(mut self, age: Duration) -> Self {
        self.max_object_age = Some(age);
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set how long `get` waits for a slot
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Wait for a slot until the caller cancels
    pub fn without_acquire_timeout(mut self) -> Self {
        self.acquire_timeout = None;
        self
    }

    /// Set the reaper interval
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    /// Let the circuit breaker half-open after `cooldown`
    pub fn with_circuit_breaker_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_breaker_cooldown = Some(cooldown);
        self
    }

    /// Whether the background reaper runs for this configuration.
    pub fn reaper_enabled(&self) -> bool {
        non_zero(self.idle_timeout).is_some() && non_zero(self.reap_interval).is_some()
    }

    /// Check the configuration for contradictions.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfiguration`] when `min_idle` exceeds
    /// the effective capacity.
    pub fn validate(&self) -> PoolResult<()> {
        let capacity = self.effective_capacity();
        if self.min_idle > capacity {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_idle ({}) exceeds capacity ({capacity})",
                self.min_idle
            )));
        }
        Ok(())
    }

    pub(crate) fn effective_capacity(&self) -> usize {
        if self.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        }
    }

    /// Copy with zero capacity and zero durations folded to their defaults.
    pub(crate) fn normalized(&self) -> Self {
        Self {
            capacity: self.effective_capacity(),
            min_idle: self.min_idle,
            max_object_age: non_zero(self.max_object_age),
            idle_timeout: non_zero(self.idle_timeout),
            acquire_timeout: self.acquire_timeout,
            reap_interval: non_zero(self.reap_interval),
            circuit_breaker_cooldown: non_zero(self.circuit_breaker_cooldown),
        }
    }
}

fn non_zero(value: Option<Duration>) -> Option<Duration> {
    value.filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_falls_back_to_default() {
        let config = PoolConfiguration::new().with_capacity(0).normalized();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_min_idle_above_capacity_is_rejected() {
        let config = PoolConfiguration::new().with_capacity(2).with_min_idle(3);
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_reaper_needs_both_durations() {
        let only_timeout = PoolConfiguration::new().with_idle_timeout(Duration::from_secs(1));
        assert!(!only_timeout.reaper_enabled());

        let zero_interval = only_timeout.clone().with_reap_interval(Duration::ZERO);
        assert!(!zero_interval.reaper_enabled());

        let both = only_timeout.with_reap_interval(Duration::from_millis(100));
        assert!(both.reaper_enabled());
    }

    #[test]
    fn test_acquire_timeout_zero_is_kept() {
        let config = PoolConfiguration::new()
            .with_acquire_timeout(Duration::ZERO)
            .normalized();
        assert_eq!(config.acquire_timeout, Some(Duration::ZERO));
    }
}
