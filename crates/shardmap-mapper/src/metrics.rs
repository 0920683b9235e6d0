//! Observability metrics for the mapper engine.
//!
//! Metrics go through the `metrics` crate facade; install any recorder
//! (Prometheus, statsd, a test recorder) to collect them. Without a recorder
//! every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `shardmap_task_deliveries_total` | Counter | `task`, `result` | Task deliveries by outcome |
//! | `shardmap_task_duration_seconds` | Histogram | `task` | Handler execution time |
//! | `shardmap_job_transitions_total` | Counter | `from_state`, `to_state` | Job state changes |
//! | `shardmap_shard_transitions_total` | Counter | `from_state`, `to_state` | Shard state changes |
//! | `shardmap_pages_mapped_total` | Counter | `mapper` | Pages handed to mappers |
//! | `shardmap_keys_mapped_total` | Counter | `mapper` | Keys handed to mappers |
//! | `shardmap_mapper_errors_total` | Counter | `mapper`, `class` | Mapper failures |
//! | `shardmap_queue_depth` | Gauge | `queue` | Pending tasks |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shardmap_mapper::metrics::MapperMetrics;
//!
//! let metrics = MapperMetrics::new();
//! metrics.record_job_transition("starting", "running");
//! metrics.record_page("count", 33);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: task deliveries by outcome.
    pub const TASK_DELIVERIES_TOTAL: &str = "shardmap_task_deliveries_total";
    /// Histogram: handler execution time in seconds.
    pub const TASK_DURATION_SECONDS: &str = "shardmap_task_duration_seconds";
    /// Counter: job state transitions.
    pub const JOB_TRANSITIONS_TOTAL: &str = "shardmap_job_transitions_total";
    /// Counter: shard state transitions.
    pub const SHARD_TRANSITIONS_TOTAL: &str = "shardmap_shard_transitions_total";
    /// Counter: pages handed to mappers.
    pub const PAGES_MAPPED_TOTAL: &str = "shardmap_pages_mapped_total";
    /// Counter: keys handed to mappers.
    pub const KEYS_MAPPED_TOTAL: &str = "shardmap_keys_mapped_total";
    /// Counter: mapper failures.
    pub const MAPPER_ERRORS_TOTAL: &str = "shardmap_mapper_errors_total";
    /// Gauge: pending tasks.
    pub const QUEUE_DEPTH: &str = "shardmap_queue_depth";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task kind (`split_and_launch`, `process_shard`, ...).
    pub const TASK: &str = "task";
    /// Delivery result (acked, retried, failed, dead_lettered).
    pub const RESULT: &str = "result";
    /// Previous state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Mapper ID.
    pub const MAPPER: &str = "mapper";
    /// Error class (transient, fatal).
    pub const CLASS: &str = "class";
    /// Queue name.
    pub const QUEUE: &str = "queue";
}

/// High-level interface for recording mapper metrics.
///
/// Cheap to clone and share across handlers.
#[derive(Debug, Clone, Default)]
pub struct MapperMetrics {
    _private: (),
}

impl MapperMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one task delivery.
    pub fn record_delivery(&self, task: &'static str, result: &'static str) {
        counter!(
            names::TASK_DELIVERIES_TOTAL,
            labels::TASK => task,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records handler execution time.
    pub fn observe_task_duration(&self, task: &'static str, duration: Duration) {
        histogram!(names::TASK_DURATION_SECONDS, labels::TASK => task).record(duration.as_secs_f64());
    }

    /// Records a job state transition.
    pub fn record_job_transition(&self, from_state: &'static str, to_state: &'static str) {
        counter!(
            names::JOB_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state,
            labels::TO_STATE => to_state,
        )
        .increment(1);
    }

    /// Records a shard state transition.
    pub fn record_shard_transition(&self, from_state: &'static str, to_state: &'static str) {
        counter!(
            names::SHARD_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state,
            labels::TO_STATE => to_state,
        )
        .increment(1);
    }

    /// Records one page handed to a mapper.
    pub fn record_page(&self, mapper: &str, keys: usize) {
        counter!(names::PAGES_MAPPED_TOTAL, labels::MAPPER => mapper.to_string()).increment(1);
        counter!(names::KEYS_MAPPED_TOTAL, labels::MAPPER => mapper.to_string())
            .increment(keys as u64);
    }

    /// Records a mapper failure.
    pub fn record_mapper_error(&self, mapper: &str, transient: bool) {
        let class = if transient { "transient" } else { "fatal" };
        counter!(
            names::MAPPER_ERRORS_TOTAL,
            labels::MAPPER => mapper.to_string(),
            labels::CLASS => class,
        )
        .increment(1);
    }

    /// Sets the number of pending tasks.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(names::QUEUE_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }
}

/// RAII guard for timing operations.
///
/// Calls the callback with the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records handler duration for `task`.
#[must_use]
pub fn time_task(metrics: &MapperMetrics, task: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    let metrics = metrics.clone();
    TimingGuard::new(move |duration| metrics.observe_task_duration(task, duration))
}
