//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::AlertKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a value using binary search
#[inline]
fn bucket_index(value: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < value)
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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total location updates processed (monotonic)
    updates_total: AtomicU64,
    /// Updates since last report (reset on report)
    updates_since_report: AtomicU64,
    /// Sum of hot-path latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max hot-path latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Hot-path latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Updates rejected by validation (monotonic)
    updates_rejected: AtomicU64,
    /// Updates identical to the previous position (monotonic)
    duplicates_skipped: AtomicU64,
    /// ENTER alerts emitted (monotonic)
    alerts_enter: AtomicU64,
    /// EXIT alerts emitted (monotonic)
    alerts_exit: AtomicU64,
    /// SOS alerts emitted (monotonic)
    alerts_sos: AtomicU64,
    /// ENTER alerts suppressed by the dispatcher (monotonic)
    enters_deduplicated: AtomicU64,
    /// Messages dropped because a subscriber was gone or full (monotonic)
    deliveries_dropped: AtomicU64,
    /// Audit records dropped due to channel full (monotonic)
    audit_dropped: AtomicU64,
    /// Sessions removed by the TTL sweeper (monotonic)
    sessions_expired: AtomicU64,
    /// Current session count (gauge, set by sampler)
    sessions_active: AtomicU64,
    /// Current zone count (gauge, set on refresh)
    zones_active: AtomicU64,
    /// Successful zone refreshes (monotonic)
    zone_refresh_ok: AtomicU64,
    /// Failed zone refreshes (monotonic)
    zone_refresh_failed: AtomicU64,
    /// Optimizations completed (monotonic)
    optimizations_total: AtomicU64,
    /// Optimizations that hit their deadline (monotonic)
    optimizations_timed_out: AtomicU64,
    /// Optimization requests rejected by validation (monotonic)
    optimizations_rejected: AtomicU64,
    /// Optimizer wall time histogram in milliseconds (cumulative)
    optimizer_time_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of optimizer wall times (ms)
    optimizer_time_sum_ms: AtomicU64,
    /// Sum of distance saved across optimizations (meters)
    distance_saved_sum_m: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            updates_total: AtomicU64::new(0),
            updates_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            updates_rejected: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            alerts_enter: AtomicU64::new(0),
            alerts_exit: AtomicU64::new(0),
            alerts_sos: AtomicU64::new(0),
            enters_deduplicated: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            audit_dropped: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            zones_active: AtomicU64::new(0),
            zone_refresh_ok: AtomicU64::new(0),
            zone_refresh_failed: AtomicU64::new(0),
            optimizations_total: AtomicU64::new(0),
            optimizations_timed_out: AtomicU64::new(0),
            optimizations_rejected: AtomicU64::new(0),
            optimizer_time_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            optimizer_time_sum_ms: AtomicU64::new(0),
            distance_saved_sum_m: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a location update was processed with given latency (lock-free)
    #[inline]
    pub fn record_update_processed(&self, latency_us: u64) {
        self.updates_total.fetch_add(1, Ordering::Relaxed);
        self.updates_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_update_rejected(&self) {
        self.updates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate_skipped(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an alert emitted, by kind
    #[inline]
    pub fn record_alert(&self, kind: AlertKind) {
        let counter = match kind {
            AlertKind::Enter => &self.alerts_enter,
            AlertKind::Exit => &self.alerts_exit,
            AlertKind::Sos => &self.alerts_sos,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_enter_deduplicated(&self) {
        self.enters_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_audit_dropped(&self) {
        self.audit_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sessions_expired(&self, count: u64) {
        self.sessions_expired.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_sessions_active(&self, count: u64) {
        self.sessions_active.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_zones_active(&self, count: u64) {
        self.zones_active.store(count, Ordering::Relaxed);
    }

    /// Record the outcome of a zone refresh
    #[inline]
    pub fn record_zone_refresh(&self, ok: bool) {
        if ok {
            self.zone_refresh_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.zone_refresh_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a finished optimization (lock-free)
    /// Uses same bucket bounds as latency, in milliseconds
    #[inline]
    pub fn record_optimization(&self, elapsed_ms: u64, timed_out: bool, distance_saved_m: f64) {
        self.optimizations_total.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.optimizations_timed_out.fetch_add(1, Ordering::Relaxed);
        }
        self.optimizer_time_buckets[bucket_index(elapsed_ms)].fetch_add(1, Ordering::Relaxed);
        self.optimizer_time_sum_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.distance_saved_sum_m.fetch_add(distance_saved_m.max(0.0) as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_optimization_rejected(&self) {
        self.optimizations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn updates_total(&self) -> u64 {
        self.updates_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deliveries_dropped(&self) -> u64 {
        self.deliveries_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn enters_deduplicated(&self) -> u64 {
        self.enters_deduplicated.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn zone_refresh_failed(&self) -> u64 {
        self.zone_refresh_failed.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Same as `report()` but leaves the periodic counters untouched
    ///
    /// Used by scrapers so they don't steal the periodic reporter's window.
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let (updates_count, latency_sum, max_latency, lat_buckets) = if reset {
            (
                self.updates_since_report.swap(0, Ordering::Relaxed),
                self.latency_sum_us.swap(0, Ordering::Relaxed),
                self.latency_max_us.swap(0, Ordering::Relaxed),
                swap_buckets(&self.latency_buckets),
            )
        } else {
            (
                self.updates_since_report.load(Ordering::Relaxed),
                self.latency_sum_us.load(Ordering::Relaxed),
                self.latency_max_us.load(Ordering::Relaxed),
                load_buckets(&self.latency_buckets),
            )
        };

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let updates_per_sec = if elapsed.as_secs_f64() > 0.0 {
            updates_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if updates_count > 0 { latency_sum / updates_count } else { 0 };

        let optimizer_time_buckets = load_buckets(&self.optimizer_time_buckets);
        let optimizations_total = self.optimizations_total.load(Ordering::Relaxed);
        let optimizer_time_sum = self.optimizer_time_sum_ms.load(Ordering::Relaxed);
        let optimizer_time_avg_ms =
            if optimizations_total > 0 { optimizer_time_sum / optimizations_total } else { 0 };

        MetricsSummary {
            updates_total: self.updates_total.load(Ordering::Relaxed),
            updates_per_sec,
            avg_latency_us: avg_latency,
            max_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            alerts_enter: self.alerts_enter.load(Ordering::Relaxed),
            alerts_exit: self.alerts_exit.load(Ordering::Relaxed),
            alerts_sos: self.alerts_sos.load(Ordering::Relaxed),
            enters_deduplicated: self.enters_deduplicated.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            audit_dropped: self.audit_dropped.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            zones_active: self.zones_active.load(Ordering::Relaxed),
            zone_refresh_ok: self.zone_refresh_ok.load(Ordering::Relaxed),
            zone_refresh_failed: self.zone_refresh_failed.load(Ordering::Relaxed),
            optimizations_total,
            optimizations_timed_out: self.optimizations_timed_out.load(Ordering::Relaxed),
            optimizations_rejected: self.optimizations_rejected.load(Ordering::Relaxed),
            optimizer_time_p99_ms: percentile_from_buckets(&optimizer_time_buckets, 0.99),
            optimizer_time_buckets,
            optimizer_time_avg_ms,
            distance_saved_total_m: self.distance_saved_sum_m.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub updates_total: u64,
    pub updates_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    /// Hot-path latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub updates_rejected: u64,
    pub duplicates_skipped: u64,
    pub alerts_enter: u64,
    pub alerts_exit: u64,
    pub alerts_sos: u64,
    pub enters_deduplicated: u64,
    pub deliveries_dropped: u64,
    pub audit_dropped: u64,
    pub sessions_expired: u64,
    pub sessions_active: u64,
    pub zones_active: u64,
    pub zone_refresh_ok: u64,
    pub zone_refresh_failed: u64,
    pub optimizations_total: u64,
    pub optimizations_timed_out: u64,
    pub optimizations_rejected: u64,
    /// Optimizer wall time histogram buckets (ms, same bounds)
    pub optimizer_time_buckets: [u64; NUM_BUCKETS],
    pub optimizer_time_avg_ms: u64,
    pub optimizer_time_p99_ms: u64,
    pub distance_saved_total_m: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            updates_total = %self.updates_total,
            updates_per_sec = format!("{:.1}", self.updates_per_sec),
            avg_latency_us = %self.avg_latency_us,
            max_latency_us = %self.max_latency_us,
            p99_us = %self.lat_p99_us,
            sessions = %self.sessions_active,
            zones = %self.zones_active,
            enter = %self.alerts_enter,
            exit = %self.alerts_exit,
            sos = %self.alerts_sos,
            dropped = %self.deliveries_dropped,
            optimizations = %self.optimizations_total,
            "metrics"
        );
    }
}
