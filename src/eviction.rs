//! Staleness rules for idle objects

use std::time::Duration;

use tokio::time::Instant;

/// Eviction policy for pool objects
///
/// Built from the pool configuration; an object is stale once it reaches
/// either limit.
///
/// # Examples
///
/// ```
/// use stale_pool::EvictionPolicy;
/// use std::time::Duration;
///
/// let policy = EvictionPolicy::from_limits(Some(Duration::from_secs(3600)), None);
/// assert_eq!(policy, EvictionPolicy::MaxAge(Duration::from_secs(3600)));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// No eviction
    #[default]
    None,

    /// Objects expire a fixed duration after creation
    MaxAge(Duration),

    /// Objects expire after sitting idle
    IdleTimeout(Duration),

    /// Whichever limit is reached first
    Combined {
        max_age: Duration,
        idle_timeout: Duration,
    },
}

impl EvictionPolicy {
    /// Build a policy from optional limits. Zero durations are ignored.
    pub fn from_limits(max_age: Option<Duration>, idle_timeout: Option<Duration>) -> Self {
        let max_age = max_age.filter(|d| !d.is_zero());
        let idle_timeout = idle_timeout.filter(|d| !d.is_zero());
        match (max_age, idle_timeout) {
            (Some(max_age), Some(idle_timeout)) => Self::Combined {
                max_age,
                idle_timeout,
            },
            (Some(max_age), None) => Self::MaxAge(max_age),
            (None, Some(idle_timeout)) => Self::IdleTimeout(idle_timeout),
            (None, None) => Self::None,
        }
    }

    /// Whether an object created at `created_at` and last released at
    /// `last_used_at` is stale at `now`.
    pub fn is_stale(&self, created_at: Instant, last_used_at: Instant, now: Instant) -> bool {
        let aged = |limit: Duration| now.saturating_duration_since(created_at) >= limit;
        let idled = |limit: Duration| now.saturating_duration_since(last_used_at) >= limit;
        match *self {
            Self::None => false,
            Self::MaxAge(max_age) => aged(max_age),
            Self::IdleTimeout(idle_timeout) => idled(idle_timeout),
            Self::Combined {
                max_age,
                idle_timeout,
            } => idled(idle_timeout) || aged(max_age),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_from_limits_ignores_zero() {
        assert_eq!(
            EvictionPolicy::from_limits(Some(Duration::ZERO), Some(SECOND)),
            EvictionPolicy::IdleTimeout(SECOND)
        );
        assert_eq!(EvictionPolicy::from_limits(None, None), EvictionPolicy::None);
    }

    #[test]
    fn test_idle_timeout_is_inclusive() {
        let start = Instant::now();
        let policy = EvictionPolicy::IdleTimeout(SECOND);

        assert!(!policy.is_stale(start, start, start + SECOND / 2));
        assert!(policy.is_stale(start, start, start + SECOND));
    }

    #[test]
    fn test_combined_uses_both_limits() {
        let start = Instant::now();
        let policy = EvictionPolicy::from_limits(Some(10 * SECOND), Some(2 * SECOND));

        // recently used but too old
        let used = start + 9 * SECOND;
        assert!(policy.is_stale(start, used, start + 10 * SECOND));

        // young but idle too long
        assert!(policy.is_stale(start, start, start + 3 * SECOND));

        assert!(!policy.is_stale(start, used, start + 9 * SECOND + SECOND / 2));
    }

    #[test]
    fn test_none_never_expires() {
        let start = Instant::now();
        assert!(!EvictionPolicy::None.is_stale(start, start, start + 1000 * SECOND));
    }
}
