//! In-process metrics registry and sink contract.
//!
//! The pipeline reports through the [`MetricsSink`] trait; the default
//! [`InMemoryMetrics`] registry keeps counters, gauges, and bucketed
//! histograms that render into a [`Snapshot`] on demand. The registry is
//! passed explicitly to every component at construction, never held in a
//! global. A scrape endpoint, if any, lives outside this crate and reads
//! snapshots.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

/// Stable metric names used across the pipeline.
pub mod names {
    /// Counter: admitted items, labeled by priority.
    pub const ITEMS_ADMITTED: &str = "items_admitted_total";
    /// Counter: rejected items, labeled by reason.
    pub const ITEMS_REJECTED: &str = "items_rejected_total";
    /// Counter: displaced items, labeled by lane.
    pub const OVERFLOW: &str = "overflow_total";
    /// Counter: delivery attempts, labeled by endpoint and outcome.
    pub const SENDS: &str = "sends_total";
    /// Counter: retries, labeled by endpoint and attempt number.
    pub const RETRIES: &str = "retries_total";
    /// Counter: breaker state changes, labeled by endpoint and target state.
    pub const BREAKER_TRANSITIONS: &str = "breaker_transitions_total";
    /// Counter: best-effort store failures.
    pub const STORE_ERRORS: &str = "store_errors_total";
    /// Counter: invariant violations observed by workers.
    pub const INTERNAL_ERRORS: &str = "internal_errors_total";

    /// Gauge: queued items, labeled by lane.
    pub const QUEUE_SIZE: &str = "queue_size";
    /// Gauge: workers currently allowed to dequeue.
    pub const ACTIVE_WORKERS: &str = "active_workers";
    /// Gauge: current adaptive batch size.
    pub const CURRENT_BATCH_SIZE: &str = "current_batch_size";
    /// Gauge: last rate-limit wait per endpoint, in seconds.
    pub const RATE_LIMIT_WAIT: &str = "rate_limit_wait_seconds";

    /// Histogram: HTTP send duration per endpoint.
    pub const SEND_DURATION: &str = "send_duration_seconds";
    /// Histogram: admission-to-terminal-outcome latency.
    pub const ENQUEUE_TO_SEND: &str = "enqueue_to_send_seconds";
    /// Histogram: time spent inside the enqueue critical section.
    pub const ENQUEUE_DURATION: &str = "enqueue_duration_seconds";
    /// Histogram: dequeued batch sizes.
    pub const BATCH_SIZE_OBSERVED: &str = "batch_size_observed";
    /// Histogram: admission-to-dequeue wait.
    pub const QUEUE_WAIT: &str = "queue_wait_seconds";
}

/// Sink for pipeline observations.
///
/// Labels arrive as ordered key/value pairs; implementations decide how to
/// encode them. All methods must be cheap and non-blocking.
pub trait MetricsSink: Send + Sync {
    /// Adds to a monotonic counter.
    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)], delta: u64);

    /// Sets a gauge to an absolute value.
    fn gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);

    /// Records one observation into a histogram.
    fn observe(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn incr(&self, _name: &'static str, _labels: &[(&'static str, &str)], _delta: u64) {}
    fn gauge(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
    fn observe(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
}

/// Upper bounds (seconds) for histogram buckets, plus an implicit +Inf.
pub const BUCKET_BOUNDS: [f64; 11] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Renders a metric key as `name{k="v",...}`, or bare `name` without labels.
pub fn metric_key(name: &str, labels: &[(&'static str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut key = String::with_capacity(name.len() + 16 * labels.len());
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push_str("=\"");
        key.push_str(v);
        key.push('"');
    }
    key.push('}');
    key
}

#[derive(Debug, Clone, PartialEq)]
struct HistogramCells {
    buckets: [u64; BUCKET_BOUNDS.len() + 1],
    sum: f64,
    count: u64,
}

impl HistogramCells {
    fn new() -> Self {
        Self { buckets: [0; BUCKET_BOUNDS.len() + 1], sum: 0.0, count: 0 }
    }

    fn record(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        let idx = BUCKET_BOUNDS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(BUCKET_BOUNDS.len());
        self.buckets[idx] += 1;
    }
}

/// Registry keeping all observations in memory.
///
/// Lock scope is one short critical section per observation; no lock is held
/// across any await point because none of the methods are async.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, HistogramCells>>,
}

impl InMemoryMetrics {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces a point-in-time view of every metric.
    ///
    /// Always complete: a snapshot taken during shutdown still contains all
    /// counters recorded so far.
    pub fn snapshot(&self) -> Snapshot {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let gauges = self
            .gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let histograms = self
            .histograms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, cells)| {
                (
                    k.clone(),
                    HistogramSummary {
                        count: cells.count,
                        sum: cells.sum,
                        buckets: cells.buckets.to_vec(),
                    },
                )
            })
            .collect();
        Snapshot { counters, gauges, histograms }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)], delta: u64) {
        let key = metric_key(name, labels);
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry(key).or_insert(0) += delta;
    }

    fn gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        let key = metric_key(name, labels);
        let mut gauges = self.gauges.lock().unwrap_or_else(|e| e.into_inner());
        gauges.insert(key, value);
    }

    fn observe(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        let key = metric_key(name, labels);
        let mut histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        histograms.entry(key).or_insert_with(HistogramCells::new).record(value);
    }
}

/// Aggregated view of one histogram.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistogramSummary {
    /// Number of observations.
    pub count: u64,
    /// Sum of observed values.
    pub sum: f64,
    /// Per-bucket counts aligned with [`BUCKET_BOUNDS`], final slot +Inf.
    pub buckets: Vec<u64>,
}

impl HistogramSummary {
    /// Mean observation, or zero without observations.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time view over all pipeline metrics.
///
/// Keys are rendered metric names including labels, e.g.
/// `sends_total{endpoint="https://x/hook",outcome="success"}`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    /// Monotonic counters.
    pub counters: BTreeMap<String, u64>,
    /// Last-set gauge values.
    pub gauges: BTreeMap<String, f64>,
    /// Histogram summaries.
    pub histograms: BTreeMap<String, HistogramSummary>,
}

impl Snapshot {
    /// Counter value for an exact rendered key, zero when absent.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Sum of all counters sharing a metric name, across label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|(k, _)| *k == name || k.starts_with(&format!("{name}{{")))
            .map(|(_, v)| *v)
            .sum()
    }

    /// Gauge value for an exact rendered key, when present.
    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.gauges.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_with_and_without_labels() {
        assert_eq!(metric_key("active_workers", &[]), "active_workers");
        assert_eq!(
            metric_key("sends_total", &[("endpoint", "https://x"), ("outcome", "success")]),
            "sends_total{endpoint=\"https://x\",outcome=\"success\"}"
        );
    }

    #[test]
    fn counters_accumulate() {
        let registry = InMemoryMetrics::new();
        registry.incr(names::SENDS, &[("endpoint", "e"), ("outcome", "success")], 1);
        registry.incr(names::SENDS, &[("endpoint", "e"), ("outcome", "success")], 2);

        let snap = registry.snapshot();
        assert_eq!(snap.counter("sends_total{endpoint=\"e\",outcome=\"success\"}"), 3);
        assert_eq!(snap.counter_total(names::SENDS), 3);
    }

    #[test]
    fn gauges_keep_last_value() {
        let registry = InMemoryMetrics::new();
        registry.gauge(names::ACTIVE_WORKERS, &[], 4.0);
        registry.gauge(names::ACTIVE_WORKERS, &[], 2.0);

        assert_eq!(registry.snapshot().gauge("active_workers"), Some(2.0));
    }

    #[test]
    fn histograms_track_count_and_sum() {
        let registry = InMemoryMetrics::new();
        registry.observe(names::SEND_DURATION, &[("endpoint", "e")], 0.1);
        registry.observe(names::SEND_DURATION, &[("endpoint", "e")], 0.3);

        let snap = registry.snapshot();
        let hist = snap.histograms.get("send_duration_seconds{endpoint=\"e\"}").unwrap();
        assert_eq!(hist.count, 2);
        assert!((hist.sum - 0.4).abs() < 1e-9);
        assert!((hist.mean() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn snapshots_without_activity_are_equal() {
        let registry = InMemoryMetrics::new();
        registry.incr(names::ITEMS_ADMITTED, &[("priority", "high")], 1);

        let first = registry.snapshot();
        let second = registry.snapshot();
        assert_eq!(first, second);
    }
}
