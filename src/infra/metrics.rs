//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so producers never contend on a mutex just to count.
//! Reporting is the only operation that resets anything (via atomic swap).
//! `snapshot()` reads the monotonic histogram for scrapes without resetting.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only; never use them for coordination or logic decisions.

use crate::domain::types::{DoorState, Outcome, Source};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤1, ≤2, ≤4, ≤8, ≤16, ≤32, ≤64, ≤128, ≤256, ≤512, >512
const BUCKET_BOUNDS: [u64; 10] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512];
const NUM_BUCKETS: usize = 11;
const NUM_SOURCES: usize = Source::ALL.len();

/// Door state values for the Prometheus gauge
pub const DOOR_STATE_CLOSED: u64 = 0;
pub const DOOR_STATE_MOVING: u64 = 1;
pub const DOOR_STATE_OPEN: u64 = 2;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
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

    let target = ((total as f64 * percentile) as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

fn door_state_gauge(state: DoorState) -> u64 {
    match state {
        DoorState::Closed => DOOR_STATE_CLOSED,
        DoorState::Opening | DoorState::Closing => DOOR_STATE_MOVING,
        DoorState::Open => DOOR_STATE_OPEN,
    }
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Intents submitted, indexed by source (monotonic)
    intents_by_source: [AtomicU64; NUM_SOURCES],
    executed_total: AtomicU64,
    ignored_total: AtomicU64,
    rejected_total: AtomicU64,
    /// Committed terminal transitions (monotonic)
    transitions_total: AtomicU64,
    /// Idle timeouts that actually closed the door
    auto_closes_total: AtomicU64,
    /// Inbound transport payloads that never became an intent
    commands_dropped: AtomicU64,
    state_publish_failures: AtomicU64,
    adapter_errors: AtomicU64,
    /// Current door state (0=closed, 1=moving, 2=open)
    door_state: AtomicU64,
    /// Time spent inside `submit` (reset on report)
    submit_latency_buckets: [AtomicU64; NUM_BUCKETS],
    submit_latency_sum_us: AtomicU64,
    submit_latency_max_us: AtomicU64,
    submits_since_report: AtomicU64,
    /// Same histogram, never reset (Prometheus scrapes)
    submit_latency_total_buckets: [AtomicU64; NUM_BUCKETS],
    submit_latency_total_sum_us: AtomicU64,
    /// Only touched by the reporter
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            intents_by_source: std::array::from_fn(|_| AtomicU64::new(0)),
            executed_total: AtomicU64::new(0),
            ignored_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            auto_closes_total: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            state_publish_failures: AtomicU64::new(0),
            adapter_errors: AtomicU64::new(0),
            door_state: AtomicU64::new(DOOR_STATE_CLOSED),
            submit_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            submit_latency_sum_us: AtomicU64::new(0),
            submit_latency_max_us: AtomicU64::new(0),
            submits_since_report: AtomicU64::new(0),
            submit_latency_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            submit_latency_total_sum_us: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record one arbitrated intent and how long `submit` took
    #[inline]
    pub fn record_intent(&self, source: Source, outcome: Outcome, latency_us: u64) {
        self.intents_by_source[source.index()].fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Executed => &self.executed_total,
            Outcome::Ignored(_) => &self.ignored_total,
            Outcome::Rejected(_) => &self.rejected_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.submits_since_report.fetch_add(1, Ordering::Relaxed);
        self.submit_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.submit_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.submit_latency_total_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.submit_latency_total_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.submit_latency_max_us, latency_us);
    }

    #[inline]
    pub fn set_door_state(&self, state: DoorState) {
        self.door_state.store(door_state_gauge(state), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auto_close(&self) {
        self.auto_closes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failure(&self) {
        self.state_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_adapter_error(&self) {
        self.adapter_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn intents_from(&self, source: Source) -> u64 {
        self.intents_by_source[source.index()].load(Ordering::Relaxed)
    }

    pub fn executed_total(&self) -> u64 {
        self.executed_total.load(Ordering::Relaxed)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn ignored_total(&self) -> u64 {
        self.ignored_total.load(Ordering::Relaxed)
    }

    pub fn commands_dropped(&self) -> u64 {
        self.commands_dropped.load(Ordering::Relaxed)
    }

    pub fn auto_closes_total(&self) -> u64 {
        self.auto_closes_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let submits = self.submits_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.submit_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.submit_latency_max_us.swap(0, Ordering::Relaxed);
        let latency_buckets = swap_buckets(&self.submit_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let intents_per_sec = if elapsed.as_secs_f64() > 0.0 {
            submits as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.summary(intents_per_sec, latency_buckets, latency_sum, submits, latency_max)
    }

    /// Cumulative view for scrapes; leaves the report window untouched
    pub fn snapshot(&self) -> MetricsSummary {
        let mut latency_buckets = [0u64; NUM_BUCKETS];
        for (i, bucket) in self.submit_latency_total_buckets.iter().enumerate() {
            latency_buckets[i] = bucket.load(Ordering::Relaxed);
        }
        let submits = latency_buckets.iter().sum();
        let latency_sum = self.submit_latency_total_sum_us.load(Ordering::Relaxed);
        let latency_max = self.submit_latency_max_us.load(Ordering::Relaxed);

        self.summary(0.0, latency_buckets, latency_sum, submits, latency_max)
    }

    fn summary(
        &self,
        intents_per_sec: f64,
        latency_buckets: [u64; NUM_BUCKETS],
        latency_sum: u64,
        submits: u64,
        latency_max: u64,
    ) -> MetricsSummary {
        let mut intents_by_source = [0u64; NUM_SOURCES];
        for (i, counter) in self.intents_by_source.iter().enumerate() {
            intents_by_source[i] = counter.load(Ordering::Relaxed);
        }

        MetricsSummary {
            intents_by_source,
            executed_total: self.executed_total.load(Ordering::Relaxed),
            ignored_total: self.ignored_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            auto_closes_total: self.auto_closes_total.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            state_publish_failures: self.state_publish_failures.load(Ordering::Relaxed),
            adapter_errors: self.adapter_errors.load(Ordering::Relaxed),
            door_state: self.door_state.load(Ordering::Relaxed),
            intents_per_sec,
            submit_lat_buckets: latency_buckets,
            submit_lat_sum_us: latency_sum,
            submit_lat_avg_us: if submits > 0 { latency_sum / submits } else { 0 },
            submit_lat_max_us: latency_max,
            submit_lat_p99_us: percentile_from_buckets(&latency_buckets, 0.99),
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
    /// Indexed like `Source::ALL`
    pub intents_by_source: [u64; NUM_SOURCES],
    pub executed_total: u64,
    pub ignored_total: u64,
    pub rejected_total: u64,
    pub transitions_total: u64,
    pub auto_closes_total: u64,
    pub commands_dropped: u64,
    pub state_publish_failures: u64,
    pub adapter_errors: u64,
    /// 0=closed, 1=moving, 2=open
    pub door_state: u64,
    pub intents_per_sec: f64,
    pub submit_lat_buckets: [u64; NUM_BUCKETS],
    pub submit_lat_sum_us: u64,
    pub submit_lat_avg_us: u64,
    pub submit_lat_max_us: u64,
    pub submit_lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            executed = %self.executed_total,
            ignored = %self.ignored_total,
            rejected = %self.rejected_total,
            transitions = %self.transitions_total,
            auto_closes = %self.auto_closes_total,
            dropped = %self.commands_dropped,
            publish_failures = %self.state_publish_failures,
            adapter_errors = %self.adapter_errors,
            door_state = %self.door_state,
            intents_per_sec = format!("{:.2}", self.intents_per_sec),
            submit_p99_us = %self.submit_lat_p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{IgnoreReason, RejectReason};

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.executed_total(), 0);
        assert_eq!(metrics.door_state.load(Ordering::Relaxed), DOOR_STATE_CLOSED);
    }

    #[test]
    fn test_record_intent_by_outcome() {
        let metrics = Metrics::new();
        metrics.record_intent(Source::Remote, Outcome::Executed, 3);
        metrics.record_intent(Source::Remote, Outcome::Rejected(RejectReason::InvalidToken), 1);
        metrics.record_intent(Source::Voice, Outcome::Ignored(IgnoreReason::AlreadyOpen), 2);

        assert_eq!(metrics.intents_from(Source::Remote), 2);
        assert_eq!(metrics.intents_from(Source::Voice), 1);
        assert_eq!(metrics.intents_from(Source::Camera), 0);
        assert_eq!(metrics.executed_total(), 1);
        assert_eq!(metrics.rejected_total(), 1);
        assert_eq!(metrics.ignored_total(), 1);
    }

    #[test]
    fn test_report_resets_latency_only() {
        let metrics = Metrics::new();
        metrics.record_intent(Source::Manual, Outcome::Executed, 700);
        metrics.record_intent(Source::Manual, Outcome::Executed, 3);

        let summary = metrics.report();
        assert_eq!(summary.submit_lat_max_us, 700);
        assert_eq!(summary.submit_lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(summary.executed_total, 2);

        let summary = metrics.report();
        assert_eq!(summary.submit_lat_max_us, 0);
        assert_eq!(summary.submit_lat_avg_us, 0);
        assert_eq!(summary.executed_total, 2);
    }

    #[test]
    fn test_snapshot_is_cumulative_and_leaves_report_window() {
        let metrics = Metrics::new();
        metrics.record_intent(Source::Voice, Outcome::Executed, 10);
        metrics.record_intent(Source::Voice, Outcome::Executed, 30);

        let first = metrics.snapshot();
        let second = metrics.snapshot();
        assert_eq!(first.submit_lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(second.submit_lat_buckets, first.submit_lat_buckets);
        assert_eq!(second.submit_lat_sum_us, 40);
        assert_eq!(second.submit_lat_avg_us, 20);

        let report = metrics.report();
        assert_eq!(report.submit_lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(report.submit_lat_max_us, 30);

        // The periodic window resets; the scrape histogram keeps counting
        metrics.record_intent(Source::Voice, Outcome::Executed, 5);
        assert_eq!(metrics.report().submit_lat_buckets.iter().sum::<u64>(), 1);
        let after = metrics.snapshot();
        assert_eq!(after.submit_lat_buckets.iter().sum::<u64>(), 3);
        assert_eq!(after.submit_lat_sum_us, 45);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1), 0);
        assert_eq!(bucket_index(3), 2);
        assert_eq!(bucket_index(512), 9);
        assert_eq!(bucket_index(10_000), 10);
    }

    #[test]
    fn test_door_state_gauge() {
        let metrics = Metrics::new();
        metrics.set_door_state(DoorState::Opening);
        assert_eq!(metrics.report().door_state, DOOR_STATE_MOVING);
        metrics.set_door_state(DoorState::Open);
        assert_eq!(metrics.report().door_state, DOOR_STATE_OPEN);
    }
}
