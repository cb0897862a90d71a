//! Statistics collection and export for object pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics for a pool
///
/// Counters are cumulative since the pool was created; counts reflect the
/// moment the snapshot was taken and are not transactional with other
/// operations.
///
/// # Examples
///
/// ```
/// use stale_pool::{Manager, Pool, PoolConfiguration};
/// use tokio_util::sync::CancellationToken;
/// # use std::convert::Infallible;
/// #
/// # struct Numbers;
/// #
/// # #[async_trait::async_trait]
/// # impl Manager for Numbers {
/// #     type Type = u32;
/// #     type Error = Infallible;
/// #     async fn create(&self, _cancel: &CancellationToken) -> Result<u32, Infallible> {
/// #         Ok(7)
/// #     }
/// # }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = Pool::new(Numbers, PoolConfiguration::default()).unwrap();
/// let cancel = CancellationToken::new();
///
/// let item = pool.get(&cancel).await.unwrap();
/// pool.put(item).unwrap();
///
/// let stats = pool.stats();
/// assert_eq!(stats.misses, 1);
/// assert_eq!(stats.idle_count, 1);
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    /// Acquisitions served from the idle list
    pub hits: u64,

    /// Acquisitions that had to construct a new object
    pub misses: u64,

    /// Acquisitions that gave up waiting for a slot
    pub timeouts: u64,

    /// Objects evicted for exceeding the idle timeout or max age
    pub stale_evictions: u64,

    /// Objects rejected by the validator on release
    pub validation_failures: u64,

    /// Failed constructor calls
    pub creation_failures: u64,

    /// Live objects, pooled or not
    pub total_count: usize,

    /// Objects waiting in the idle list
    pub idle_count: usize,

    /// Pooled objects counted against capacity
    pub size: usize,

    /// Configured capacity
    pub capacity: usize,

    /// Admission slots currently free
    pub available_slots: usize,
}

impl PoolStats {
    /// Export statistics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut stats = HashMap::new();
        stats.insert("hits".to_string(), self.hits.to_string());
        stats.insert("misses".to_string(), self.misses.to_string());
        stats.insert("timeouts".to_string(), self.timeouts.to_string());
        stats.insert("stale_evictions".to_string(), self.stale_evictions.to_string());
        stats.insert("validation_failures".to_string(), self.validation_failures.to_string());
        stats.insert("creation_failures".to_string(), self.creation_failures.to_string());
        stats.insert("total_count".to_string(), self.total_count.to_string());
        stats.insert("idle_count".to_string(), self.idle_count.to_string());
        stats.insert("size".to_string(), self.size.to_string());
        stats.insert("capacity".to_string(), self.capacity.to_string());
        stats.insert("available_slots".to_string(), self.available_slots.to_string());
        stats
    }

    /// Share of acquisitions served from the idle list, `0.0` before the
    /// first acquisition.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Share of capacity whose slot is currently taken.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.capacity.saturating_sub(self.available_slots) as f64 / self.capacity as f64
    }
}

/// Counts captured alongside the cumulative counters in a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Occupancy {
    pub total: usize,
    pub idle: usize,
    pub size: usize,
    pub capacity: usize,
    pub available: usize,
}

/// Internal counters
#[derive(Default)]
pub(crate) struct MetricsTracker {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_evictions: AtomicU64,
    validation_failures: AtomicU64,
    creation_failures: AtomicU64,
}

impl MetricsTracker {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self, count: u64) {
        if count > 0 {
            self.stale_evictions.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, timeouts: u64, occupancy: Occupancy) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts,
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            total_count: occupancy.total,
            idle_count: occupancy.idle,
            size: occupancy.size,
            capacity: occupancy.capacity,
            available_slots: occupancy.available,
        }
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export statistics in Prometheus text exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use stale_pool::{MetricsExporter, PoolStats};
    /// use std::collections::HashMap;
    ///
    /// let stats = PoolStats { hits: 3, idle_count: 1, ..Default::default() };
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&stats, "db", Some(&tags)).unwrap();
    /// assert!(output.contains("objectpool_hits_total"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    ///
    /// # Errors
    ///
    /// Fails if a tag is not a valid Prometheus label.
    pub fn export_prometheus(
        stats: &PoolStats,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let mut labels = tags.cloned().unwrap_or_default();
        labels.insert("pool".to_string(), pool_name.to_string());
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(labels.clone());

        let registry = Registry::new();

        let counters = [
            ("objectpool_hits_total", "Acquisitions served from the idle list", stats.hits),
            ("objectpool_misses_total", "Acquisitions that constructed a new object", stats.misses),
            ("objectpool_timeouts_total", "Acquisitions that timed out waiting for a slot", stats.timeouts),
            ("objectpool_stale_evictions_total", "Objects evicted as stale", stats.stale_evictions),
            ("objectpool_validation_failures_total", "Objects rejected on release", stats.validation_failures),
            ("objectpool_creation_failures_total", "Failed constructor calls", stats.creation_failures),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help))?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let gauges = [
            ("objectpool_objects_total", "Live objects", stats.total_count),
            ("objectpool_objects_idle", "Idle objects", stats.idle_count),
            ("objectpool_size", "Pooled objects counted against capacity", stats.size),
            ("objectpool_capacity", "Configured capacity", stats.capacity),
            ("objectpool_slots_available", "Free admission slots", stats.available_slots),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help))?;
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
            registry.register(Box::new(gauge))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let tracker = MetricsTracker::default();
        tracker.record_hit();
        tracker.record_hit();
        tracker.record_miss();
        tracker.record_stale(3);
        tracker.record_stale(0);

        let stats = tracker.snapshot(
            4,
            Occupancy {
                total: 2,
                idle: 1,
                size: 2,
                capacity: 5,
                available: 4,
            },
        );

        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.timeouts, 4);
        assert_eq!(stats.stale_evictions, 3);
        assert_eq!(stats.export().get("idle_count").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_rates() {
        let stats = PoolStats {
            hits: 3,
            misses: 1,
            capacity: 4,
            available_slots: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(stats.utilization(), 0.75);
        assert_eq!(PoolStats::default().hit_rate(), 0.0);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_export_has_pool_label() {
        let stats = PoolStats {
            misses: 2,
            total_count: 2,
            ..Default::default()
        };

        let output = MetricsExporter::export_prometheus(&stats, "cache", None).unwrap();
        assert!(output.contains("# TYPE objectpool_misses_total counter"));
        assert!(output.contains("objectpool_misses_total{pool=\"cache\"} 2"));
        assert!(output.contains("objectpool_objects_total{pool=\"cache\"} 2"));
    }
}
