//! Per-echo performance counters.
//!
//! Successful calls land in one of ten latency buckets; failed calls only
//! bump the failure counter. A ticker calls [`Indicator::on_timer`] at a
//! fixed cadence to refresh the QPS estimate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Upper bounds (exclusive, in milliseconds) of the first nine buckets.
/// The tenth bucket takes everything from 1000 ms up.
pub const BUCKET_BOUNDS_MS: [u64; 9] = [2, 6, 10, 20, 40, 60, 100, 300, 1000];

/// Number of latency buckets.
pub const BUCKET_COUNT: usize = BUCKET_BOUNDS_MS.len() + 1;

#[derive(Debug, Default)]
struct TimerState {
    last_total: u64,
    last_ns: u64,
}

/// Latency histogram, failure counter and QPS estimate for one echo.
#[derive(Debug)]
pub struct Indicator {
    buckets: [AtomicU64; BUCKET_COUNT],
    failed: AtomicU64,
    qps_bits: AtomicU64,
    timer: Mutex<TimerState>,
    origins: Option<Mutex<HashSet<String>>>,
}

/// Point-in-time copy of an [`Indicator`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    /// Successful calls per latency bucket.
    pub buckets: [u64; BUCKET_COUNT],
    /// Failed calls.
    pub failed: u64,
    /// Latest calls-per-second estimate.
    pub qps: f64,
    /// Recorded caller origins, sorted. Empty unless capture is enabled.
    pub origins: Vec<String>,
}

impl IndicatorSnapshot {
    /// Successful plus failed calls.
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum::<u64>() + self.failed
    }
}

/// Bucket index for a call duration.
pub fn bucket_for(elapsed: Duration) -> usize {
    BUCKET_BOUNDS_MS
        .iter()
        .position(|&bound| elapsed < Duration::from_millis(bound))
        .unwrap_or(BUCKET_COUNT - 1)
}

impl Indicator {
    /// Create zeroed counters. `capture_origins` enables the origin set.
    pub fn new(capture_origins: bool) -> Self {
        Self {
            buckets: Default::default(),
            failed: AtomicU64::new(0),
            qps_bits: AtomicU64::new(0f64.to_bits()),
            timer: Mutex::new(TimerState::default()),
            origins: capture_origins.then(|| Mutex::new(HashSet::new())),
        }
    }

    /// Record one call.
    pub fn count(&self, elapsed: Duration, origin: &str, successful: bool) {
        if successful {
            self.buckets[bucket_for(elapsed)].fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(origins) = &self.origins {
            let mut origins = origins.lock();
            if !origins.contains(origin) {
                origins.insert(origin.to_string());
            }
        }
    }

    /// Successful plus failed calls so far.
    pub fn total(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum::<u64>()
            + self.failed.load(Ordering::Relaxed)
    }

    /// Refresh the QPS estimate. `now_ns` is a monotonic timestamp.
    ///
    /// The first tick only records a baseline.
    pub fn on_timer(&self, now_ns: u64) {
        let total = self.total();
        let mut timer = self.timer.lock();
        if timer.last_ns != 0 && now_ns > timer.last_ns && total >= timer.last_total {
            let delta = (total - timer.last_total) as f64;
            let delta_ns = (now_ns - timer.last_ns) as f64;
            let qps = delta * 1e9 / delta_ns;
            self.qps_bits.store(qps.to_bits(), Ordering::Relaxed);
        }
        timer.last_total = total;
        timer.last_ns = now_ns;
    }

    /// Latest QPS estimate.
    pub fn qps(&self) -> f64 {
        f64::from_bits(self.qps_bits.load(Ordering::Relaxed))
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> IndicatorSnapshot {
        let mut buckets = [0u64; BUCKET_COUNT];
        for (out, bucket) in buckets.iter_mut().zip(&self.buckets) {
            *out = bucket.load(Ordering::Relaxed);
        }
        let mut origins: Vec<String> = self
            .origins
            .as_ref()
            .map(|o| o.lock().iter().cloned().collect())
            .unwrap_or_default();
        origins.sort();
        IndicatorSnapshot {
            buckets,
            failed: self.failed.load(Ordering::Relaxed),
            qps: self.qps(),
            origins,
        }
    }
}

impl Default for Indicator {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_bounds() {
        assert_eq!(bucket_for(Duration::from_micros(500)), 0);
        assert_eq!(bucket_for(Duration::from_millis(2)), 1);
        assert_eq!(bucket_for(Duration::from_millis(5)), 1);
        assert_eq!(bucket_for(Duration::from_millis(99)), 6);
        assert_eq!(bucket_for(Duration::from_millis(999)), 8);
        assert_eq!(bucket_for(Duration::from_millis(1000)), 9);
        assert_eq!(bucket_for(Duration::from_secs(30)), 9);
    }

    #[test]
    fn test_count_success_and_failure() {
        let indicator = Indicator::new(false);
        indicator.count(Duration::from_millis(1), "@", true);
        indicator.count(Duration::from_millis(15), "@", true);
        indicator.count(Duration::from_millis(1), "@", false);

        let snap = indicator.snapshot();
        assert_eq!(snap.buckets[0], 1);
        assert_eq!(snap.buckets[3], 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total(), 3);
        assert!(snap.origins.is_empty());
    }

    #[test]
    fn test_origins_recorded_once() {
        let indicator = Indicator::new(true);
        indicator.count(Duration::ZERO, "b", true);
        indicator.count(Duration::ZERO, "a", false);
        indicator.count(Duration::ZERO, "b", true);
        assert_eq!(indicator.snapshot().origins, vec!["a", "b"]);
    }

    #[test]
    fn test_qps_from_timer() {
        let indicator = Indicator::new(false);
        indicator.on_timer(1_000_000_000);
        assert_eq!(indicator.qps(), 0.0);

        for _ in 0..50 {
            indicator.count(Duration::ZERO, "@", true);
        }
        indicator.on_timer(1_500_000_000);
        assert!((indicator.qps() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_qps_ignores_clock_going_backwards() {
        let indicator = Indicator::new(false);
        indicator.on_timer(2_000);
        indicator.count(Duration::ZERO, "@", true);
        indicator.on_timer(1_000);
        assert_eq!(indicator.qps(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let indicator = Indicator::new(false);
        indicator.count(Duration::ZERO, "@", true);
        let json = serde_json::to_string(&indicator.snapshot()).unwrap();
        assert!(json.contains("\"failed\":0"));
    }
}
