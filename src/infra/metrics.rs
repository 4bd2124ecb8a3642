//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Barrier state values for the Prometheus gauge
pub const BARRIER_STATE_CLOSED: u64 = 0;
pub const BARRIER_STATE_OPENING: u64 = 1;
pub const BARRIER_STATE_OPEN: u64 = 2;
pub const BARRIER_STATE_CLOSING: u64 = 3;
pub const BARRIER_STATE_FAULT: u64 = 4;

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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
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

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total detections ever ingested (monotonic)
    detections_total: AtomicU64,
    /// Detections since last report (reset on report)
    detections_since_report: AtomicU64,
    /// Detections suppressed by the debounce filter (monotonic)
    detections_suppressed: AtomicU64,
    /// Access grants (monotonic)
    access_granted: AtomicU64,
    /// Access denials (monotonic)
    access_denied: AtomicU64,
    /// Sessions opened (monotonic)
    sessions_opened: AtomicU64,
    /// Sessions closed into a terminal state (monotonic)
    sessions_closed: AtomicU64,
    /// Payment transactions requested (monotonic)
    payments_requested: AtomicU64,
    /// Payments settled (monotonic)
    payments_settled: AtomicU64,
    /// Payments failed, cancelled or timed out (monotonic)
    payments_failed: AtomicU64,
    /// Barrier open commands actuated (monotonic)
    barrier_commands: AtomicU64,
    /// Barrier safety faults (monotonic)
    barrier_faults: AtomicU64,
    /// Current barrier state (see BARRIER_STATE_* constants)
    barrier_state: AtomicU64,
    /// Detections dropped because the event channel was full (monotonic)
    detections_dropped: AtomicU64,
    /// Payment notifications dropped because the channel was full (monotonic)
    payment_updates_dropped: AtomicU64,
    /// Decision processing latency sum in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max decision latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Decision latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            detections_total: AtomicU64::new(0),
            detections_since_report: AtomicU64::new(0),
            detections_suppressed: AtomicU64::new(0),
            access_granted: AtomicU64::new(0),
            access_denied: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            payments_requested: AtomicU64::new(0),
            payments_settled: AtomicU64::new(0),
            payments_failed: AtomicU64::new(0),
            barrier_commands: AtomicU64::new(0),
            barrier_faults: AtomicU64::new(0),
            barrier_state: AtomicU64::new(BARRIER_STATE_CLOSED),
            detections_dropped: AtomicU64::new(0),
            payment_updates_dropped: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_detection_received(&self) {
        self.detections_total.fetch_add(1, Ordering::Relaxed);
        self.detections_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detection_suppressed(&self) {
        self.detections_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_access_granted(&self) {
        self.access_granted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_access_denied(&self) {
        self.access_denied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_payment_requested(&self) {
        self.payments_requested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_payment_settled(&self) {
        self.payments_settled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_payment_failed(&self) {
        self.payments_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_barrier_command(&self) {
        self.barrier_commands.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_barrier_fault(&self) {
        self.barrier_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_barrier_state(&self, state: u64) {
        self.barrier_state.store(state, Ordering::Relaxed);
    }

    #[inline]
    pub fn barrier_state(&self) -> u64 {
        self.barrier_state.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_detection_dropped(&self) {
        self.detections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_payment_update_dropped(&self) {
        self.payment_updates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one processed detection with its decision latency
    #[inline]
    pub fn record_decision_latency(&self, latency_us: u64) {
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    /// Produce a snapshot and reset the windowed counters
    pub fn report(&self, open_sessions: usize) -> MetricsSummary {
        let mut last_report = self.last_report_time.lock();
        let elapsed = last_report.elapsed().as_secs_f64().max(0.001);
        *last_report = Instant::now();
        drop(last_report);

        let detections_window = self.detections_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);
        let window_count: u64 = lat_buckets.iter().sum();

        MetricsSummary {
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detections_per_sec: detections_window as f64 / elapsed,
            detections_suppressed: self.detections_suppressed.load(Ordering::Relaxed),
            access_granted: self.access_granted.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            open_sessions,
            payments_requested: self.payments_requested.load(Ordering::Relaxed),
            payments_settled: self.payments_settled.load(Ordering::Relaxed),
            payments_failed: self.payments_failed.load(Ordering::Relaxed),
            barrier_commands: self.barrier_commands.load(Ordering::Relaxed),
            barrier_faults: self.barrier_faults.load(Ordering::Relaxed),
            barrier_state: self.barrier_state.load(Ordering::Relaxed),
            detections_dropped: self.detections_dropped.load(Ordering::Relaxed),
            payment_updates_dropped: self.payment_updates_dropped.load(Ordering::Relaxed),
            avg_decision_latency_us: if window_count > 0 { latency_sum / window_count } else { 0 },
            max_decision_latency_us: latency_max,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Consistent snapshot of the counters at report time
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub detections_total: u64,
    pub detections_per_sec: f64,
    pub detections_suppressed: u64,
    pub access_granted: u64,
    pub access_denied: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub open_sessions: usize,
    pub payments_requested: u64,
    pub payments_settled: u64,
    pub payments_failed: u64,
    pub barrier_commands: u64,
    pub barrier_faults: u64,
    pub barrier_state: u64,
    pub detections_dropped: u64,
    pub payment_updates_dropped: u64,
    pub avg_decision_latency_us: u64,
    pub max_decision_latency_us: u64,
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
}

impl MetricsSummary {
    /// Log the summary as a single structured event
    pub fn log(&self) {
        info!(
            detections_total = %self.detections_total,
            detections_per_sec = %format!("{:.1}", self.detections_per_sec),
            suppressed = %self.detections_suppressed,
            granted = %self.access_granted,
            denied = %self.access_denied,
            sessions_opened = %self.sessions_opened,
            sessions_closed = %self.sessions_closed,
            open_sessions = %self.open_sessions,
            payments_requested = %self.payments_requested,
            payments_settled = %self.payments_settled,
            payments_failed = %self.payments_failed,
            barrier_commands = %self.barrier_commands,
            barrier_faults = %self.barrier_faults,
            avg_latency_us = %self.avg_decision_latency_us,
            p99_latency_us = %self.lat_p99_us,
            "metrics_report"
        );
    }
}
