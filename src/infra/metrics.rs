//! Lock-free metrics collection
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.
//! The barrier state gauge mirrors the interlock, it never drives it.

use crate::domain::types::BarrierState;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Device call latency bucket boundaries (microseconds)
/// Buckets: ≤1ms, ≤2ms, ≤5ms, ≤10ms, ≤25ms, ≤50ms, ≤100ms, ≤250ms, ≤500ms, ≤1s, >1s
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [1_000, 2_000, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000, 1_000_000];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (slot, bucket) in result.iter_mut().zip(buckets.iter()) {
        *slot = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket reports 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] = [
        1_000, 2_000, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000, 1_000_000,
        2_000_000,
    ];

    for (count, bound) in buckets.iter().zip(BUCKET_UPPER_BOUNDS.iter()) {
        cumulative += count;
        if cumulative >= target {
            return *bound;
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Barrier state values for the Prometheus gauge
pub const BARRIER_STATE_UP: u64 = 0;
pub const BARRIER_STATE_DOWN: u64 = 1;

/// Lock-free metrics collector
pub struct Metrics {
    /// RegisterClient calls accepted (monotonic)
    registrations_total: AtomicU64,
    /// UpdateStatus batches dispatched (monotonic)
    broadcasts_total: AtomicU64,
    /// Outbound device calls that succeeded (monotonic)
    device_calls_ok: AtomicU64,
    /// Outbound device calls that failed or timed out (monotonic)
    device_calls_failed: AtomicU64,
    /// Device call latency histogram
    device_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    device_latency_sum_us: AtomicU64,
    device_latency_max_us: AtomicU64,
    /// Barrier commands acknowledged by the device (monotonic)
    barrier_commands_ok: AtomicU64,
    /// Barrier commands that failed (monotonic)
    barrier_commands_failed: AtomicU64,
    /// Sensor events ignored because the barrier was already in position
    sensor_noops_total: AtomicU64,
    /// Current barrier state (0=up, 1=down)
    barrier_state: AtomicU64,
    /// Schedule engine firings (monotonic)
    schedule_firings_total: AtomicU64,
    logins_ok: AtomicU64,
    logins_failed: AtomicU64,
    /// Egress messages dropped because the MQTT channel was full
    egress_dropped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            registrations_total: AtomicU64::new(0),
            broadcasts_total: AtomicU64::new(0),
            device_calls_ok: AtomicU64::new(0),
            device_calls_failed: AtomicU64::new(0),
            device_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            device_latency_sum_us: AtomicU64::new(0),
            device_latency_max_us: AtomicU64::new(0),
            barrier_commands_ok: AtomicU64::new(0),
            barrier_commands_failed: AtomicU64::new(0),
            sensor_noops_total: AtomicU64::new(0),
            barrier_state: AtomicU64::new(BARRIER_STATE_UP),
            schedule_firings_total: AtomicU64::new(0),
            logins_ok: AtomicU64::new(0),
            logins_failed: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_registration(&self) {
        self.registrations_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_broadcast(&self) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one outbound device call and its latency (lock-free)
    #[inline]
    pub fn record_device_call(&self, ok: bool, latency_us: u64) {
        if ok {
            self.device_calls_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.device_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.device_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.device_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.device_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_barrier_command(&self, ok: bool) {
        if ok {
            self.barrier_commands_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.barrier_commands_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_sensor_noop(&self) {
        self.sensor_noops_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_barrier_state(&self, state: BarrierState) {
        let value = match state {
            BarrierState::Up => BARRIER_STATE_UP,
            BarrierState::Down => BARRIER_STATE_DOWN,
        };
        self.barrier_state.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_schedule_firing(&self) {
        self.schedule_firings_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_login(&self, ok: bool) {
        if ok {
            self.logins_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.logins_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters
    pub fn report(&self) -> MetricsSummary {
        let device_latency_buckets = load_buckets(&self.device_latency_buckets);
        let device_calls_ok = self.device_calls_ok.load(Ordering::Relaxed);
        let device_calls_failed = self.device_calls_failed.load(Ordering::Relaxed);
        let device_calls = device_calls_ok + device_calls_failed;
        let device_latency_avg_us = if device_calls > 0 {
            self.device_latency_sum_us.load(Ordering::Relaxed) / device_calls
        } else {
            0
        };

        MetricsSummary {
            registrations_total: self.registrations_total.load(Ordering::Relaxed),
            broadcasts_total: self.broadcasts_total.load(Ordering::Relaxed),
            device_calls_ok,
            device_calls_failed,
            device_latency_buckets,
            device_latency_avg_us,
            device_latency_max_us: self.device_latency_max_us.load(Ordering::Relaxed),
            device_latency_p99_us: percentile_from_buckets(&device_latency_buckets, 0.99),
            barrier_commands_ok: self.barrier_commands_ok.load(Ordering::Relaxed),
            barrier_commands_failed: self.barrier_commands_failed.load(Ordering::Relaxed),
            sensor_noops_total: self.sensor_noops_total.load(Ordering::Relaxed),
            barrier_state: self.barrier_state.load(Ordering::Relaxed),
            schedule_firings_total: self.schedule_firings_total.load(Ordering::Relaxed),
            logins_ok: self.logins_ok.load(Ordering::Relaxed),
            logins_failed: self.logins_failed.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub registrations_total: u64,
    pub broadcasts_total: u64,
    pub device_calls_ok: u64,
    pub device_calls_failed: u64,
    pub device_latency_buckets: [u64; METRICS_NUM_BUCKETS],
    pub device_latency_avg_us: u64,
    pub device_latency_max_us: u64,
    pub device_latency_p99_us: u64,
    pub barrier_commands_ok: u64,
    pub barrier_commands_failed: u64,
    pub sensor_noops_total: u64,
    pub barrier_state: u64,
    pub schedule_firings_total: u64,
    pub logins_ok: u64,
    pub logins_failed: u64,
    pub egress_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            registrations = %self.registrations_total,
            broadcasts = %self.broadcasts_total,
            device_calls_ok = %self.device_calls_ok,
            device_calls_failed = %self.device_calls_failed,
            device_latency_avg_us = %self.device_latency_avg_us,
            device_latency_p99_us = %self.device_latency_p99_us,
            barrier_commands_ok = %self.barrier_commands_ok,
            barrier_commands_failed = %self.barrier_commands_failed,
            barrier_state = %self.barrier_state,
            schedule_firings = %self.schedule_firings_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1_000), 0);
        assert_eq!(bucket_index(1_001), 1);
        assert_eq!(bucket_index(999_999), 9);
        assert_eq!(bucket_index(5_000_000), 10);
    }

    #[test]
    fn test_device_call_counters() {
        let metrics = Metrics::new();
        metrics.record_device_call(true, 800);
        metrics.record_device_call(true, 1_200);
        metrics.record_device_call(false, 2_000_000);

        let summary = metrics.report();
        assert_eq!(summary.device_calls_ok, 2);
        assert_eq!(summary.device_calls_failed, 1);
        assert_eq!(summary.device_latency_max_us, 2_000_000);
        assert_eq!(summary.device_latency_buckets[0], 1);
        assert_eq!(summary.device_latency_buckets[1], 1);
        assert_eq!(summary.device_latency_buckets[10], 1);
        assert_eq!(summary.device_latency_p99_us, 2_000_000);
    }

    #[test]
    fn test_barrier_state_gauge() {
        let metrics = Metrics::new();
        assert_eq!(metrics.report().barrier_state, BARRIER_STATE_UP);
        metrics.set_barrier_state(BarrierState::Down);
        assert_eq!(metrics.report().barrier_state, BARRIER_STATE_DOWN);
    }

    #[test]
    fn test_percentile_empty() {
        let buckets = [0u64; METRICS_NUM_BUCKETS];
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 0);
    }
}
