//! Bounded in-memory operation metrics.
//!
//! Samples go into a fixed-capacity ring buffer; when it is full the oldest
//! sample is evicted. Nothing is exported or persisted; [`MetricsRecorder::query`]
//! computes aggregates on demand.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use super::error::Metadata;
use crate::config::MetricsConfig;

pub const DEFAULT_CAPACITY: usize = 1_000;
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: usize,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub success_rate_percent: f64,
}

#[derive(Debug)]
pub struct MetricsRecorder {
    capacity: usize,
    slow_threshold: Duration,
    samples: Mutex<VecDeque<MetricSample>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SLOW_THRESHOLD)
    }
}

impl MetricsRecorder {
    pub fn new(capacity: usize, slow_threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slow_threshold,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Self {
        Self::new(
            config.capacity,
            Duration::from_millis(config.slow_threshold_ms),
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn record(&self, operation: &str, duration: Duration, success: bool, metadata: Metadata) {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        if duration > self.slow_threshold {
            tracing::warn!(
                operation,
                duration_ms,
                threshold_ms = u64::try_from(self.slow_threshold.as_millis()).unwrap_or(u64::MAX),
                success,
                "slow operation"
            );
        }

        let sample = MetricSample {
            operation: operation.to_owned(),
            duration_ms,
            success,
            timestamp: Utc::now(),
            metadata,
        };

        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Time `fut` and record its outcome. The result is handed back as-is,
    /// errors included.
    pub async fn measure<F, T, E>(
        &self,
        operation: &str,
        metadata: Metadata,
        fut: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started_at = Instant::now();
        let result = fut.await;
        self.record(operation, started_at.elapsed(), result.is_ok(), metadata);
        result
    }

    pub fn measure_sync<T, E>(
        &self,
        operation: &str,
        metadata: Metadata,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let started_at = Instant::now();
        let result = f();
        self.record(operation, started_at.elapsed(), result.is_ok(), metadata);
        result
    }

    /// Aggregates over the retained samples for `operation`. All zeros when
    /// there are none.
    pub fn query(&self, operation: &str) -> OperationStats {
        let samples = self.samples.lock();
        stats_for(samples.iter().filter(|s| s.operation == operation))
    }

    /// Aggregates for every operation with at least one retained sample.
    pub fn operations(&self) -> BTreeMap<String, OperationStats> {
        let samples = self.samples.lock();
        let mut grouped: BTreeMap<&str, Vec<&MetricSample>> = BTreeMap::new();
        for sample in samples.iter() {
            grouped.entry(&sample.operation).or_default().push(sample);
        }
        grouped
            .into_iter()
            .map(|(op, group)| (op.to_owned(), stats_for(group.into_iter())))
            .collect()
    }

    /// Up to `n` most recent samples, newest last.
    pub fn recent(&self, n: usize) -> Vec<MetricSample> {
        let samples = self.samples.lock();
        let skip = samples.len().saturating_sub(n);
        samples.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

#[allow(clippy::cast_precision_loss)]
fn stats_for<'a>(samples: impl Iterator<Item = &'a MetricSample>) -> OperationStats {
    let mut count = 0usize;
    let mut total_ms = 0u128;
    let mut min = u64::MAX;
    let mut max = 0u64;
    let mut successes = 0usize;

    for sample in samples {
        count += 1;
        total_ms += u128::from(sample.duration_ms);
        min = min.min(sample.duration_ms);
        max = max.max(sample.duration_ms);
        if sample.success {
            successes += 1;
        }
    }

    if count == 0 {
        return OperationStats::default();
    }

    OperationStats {
        count,
        avg_duration_ms: total_ms as f64 / count as f64,
        min_duration_ms: min,
        max_duration_ms: max,
        success_rate_percent: successes as f64 * 100.0 / count as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fixture_aggregates() {
        let recorder = MetricsRecorder::default();
        let outcomes = [true, true, true, true, false];
        for (duration, success) in [10, 20, 30, 40, 50].into_iter().zip(outcomes) {
            recorder.record("count", ms(duration), success, Metadata::new());
        }

        let stats = recorder.query("count");
        assert_eq!(stats.count, 5);
        assert!((stats.avg_duration_ms - 30.0).abs() < f64::EPSILON);
        assert_eq!(stats.min_duration_ms, 10);
        assert_eq!(stats.max_duration_ms, 50);
        assert!((stats.success_rate_percent - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_operation_is_all_zero() {
        let recorder = MetricsRecorder::default();
        recorder.record("other", ms(5), true, Metadata::new());
        assert_eq!(recorder.query("missing"), OperationStats::default());
    }

    #[test]
    fn ring_buffer_keeps_most_recent() {
        let capacity = 8;
        let recorder = MetricsRecorder::new(capacity, DEFAULT_SLOW_THRESHOLD);
        for i in 0..(capacity as u64 + 5) {
            recorder.record("op", ms(i), true, Metadata::new());
        }

        assert_eq!(recorder.len(), capacity);
        let kept: Vec<u64> = recorder
            .recent(capacity)
            .iter()
            .map(|s| s.duration_ms)
            .collect();
        assert_eq!(kept, (5..13).collect::<Vec<u64>>());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let recorder = MetricsRecorder::new(0, DEFAULT_SLOW_THRESHOLD);
        recorder.record("a", ms(1), true, Metadata::new());
        recorder.record("b", ms(2), true, Metadata::new());
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.recent(5)[0].operation, "b");
    }

    #[test]
    fn operations_groups_by_name() {
        let recorder = MetricsRecorder::default();
        recorder.record("a", ms(10), true, Metadata::new());
        recorder.record("b", ms(20), false, Metadata::new());
        recorder.record("a", ms(30), true, Metadata::new());

        let all = recorder.operations();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"].count, 2);
        assert_eq!(all["a"].max_duration_ms, 30);
        assert!((all["b"].success_rate_percent).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn measure_records_success() {
        let recorder = MetricsRecorder::default();
        let value: Result<u32, anyhow::Error> = recorder
            .measure("ok-op", Metadata::new(), async { Ok(7) })
            .await;
        assert_eq!(value.unwrap(), 7);

        let stats = recorder.query("ok-op");
        assert_eq!(stats.count, 1);
        assert!((stats.success_rate_percent - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn measure_records_failure_and_returns_original_error() {
        let recorder = MetricsRecorder::default();
        let mut meta = Metadata::new();
        meta.insert("guild".into(), "g-1".into());

        let result: Result<(), anyhow::Error> = recorder
            .measure("bad-op", meta, async { Err(anyhow::anyhow!("original failure")) })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "original failure");

        let recent = recorder.recent(1);
        assert!(!recent[0].success);
        assert_eq!(recent[0].metadata["guild"], "g-1");
    }

    #[test]
    fn measure_sync_records_outcome() {
        let recorder = MetricsRecorder::default();
        let result: Result<(), &str> =
            recorder.measure_sync("sync-op", Metadata::new(), || Err("nope"));
        assert_eq!(result, Err("nope"));
        assert_eq!(recorder.query("sync-op").count, 1);
    }

    #[test]
    fn clear_empties_buffer() {
        let recorder = MetricsRecorder::default();
        recorder.record("op", ms(1), true, Metadata::new());
        recorder.clear();
        assert!(recorder.is_empty());
    }
}
