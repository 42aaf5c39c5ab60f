//! Process-wide metric registry and the snapshot/aggregation pipeline.
//!
//! One [`MetricCollector`] exists per process and is injected into the
//! node, scenario managers, and request contexts rather than reached
//! through a global.  All entry points take the registry lock, so
//! observations within one family are totally ordered.

mod aggregate;
mod export;
mod record;
mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use stampede_error::{ErrorCodes, StampedeError};
use thiserror::Error;

pub use aggregate::{
    aggregate_snapshots, latest_per_node, query_time_window, time_series, AggregatedSnapshot,
    MetricKind, SeriesSamples, TimeSeriesPoint,
};
pub use export::{
    labels, BucketBound, BucketCount, CounterExport, CounterSample, Event, HistogramExport,
    HistogramSample, Labels, SnapshotData,
};
pub use record::{
    record_http_request, record_journey_failure, record_journey_success, ScenarioLabels,
    HTTP_ERRORS_TOTAL, HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUEST_EVENT,
    JOURNEY_DURATION_SECONDS, JOURNEY_EXECUTIONS_TOTAL, JOURNEY_FAILURES_TOTAL,
};
pub use snapshot::MetricsSnapshot;

/// Default histogram boundaries, in seconds.
pub const DEFAULT_LATENCY_BUCKETS: [f64; 8] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("counters can only be incremented by non-negative values (got {0})")]
    NegativeIncrement(f64),
}

impl StampedeError for MetricsError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

#[derive(Debug, Default)]
struct CounterFamily {
    description: String,
    values: HashMap<Labels, f64>,
}

impl CounterFamily {
    fn export(&self, name: &str) -> CounterExport {
        CounterExport {
            name: name.to_string(),
            description: self.description.clone(),
            samples: self
                .values
                .iter()
                .map(|(labels, value)| CounterSample {
                    labels: labels.clone(),
                    value: *value,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct HistogramState {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramState {
    fn create(bucket_count: usize) -> Self {
        HistogramState {
            // one extra slot for +Inf
            bucket_counts: vec![0; bucket_count + 1],
            sum: 0.0,
            count: 0,
        }
    }
}

#[derive(Debug)]
struct HistogramFamily {
    description: String,
    buckets: Vec<f64>,
    states: HashMap<Labels, HistogramState>,
}

impl HistogramFamily {
    fn new(description: String, buckets: Option<&[f64]>) -> Self {
        let mut buckets = buckets
            .map(|b| b.to_vec())
            .unwrap_or_else(|| DEFAULT_LATENCY_BUCKETS.to_vec());
        buckets.sort_by(|a, b| a.total_cmp(b));
        HistogramFamily {
            description,
            buckets,
            states: HashMap::new(),
        }
    }

    /// Index of the first boundary >= value; past the end is the +Inf slot.
    fn bucket_index(&self, value: f64) -> usize {
        self.buckets
            .iter()
            .position(|boundary| value <= *boundary)
            .unwrap_or(self.buckets.len())
    }

    fn observe(&mut self, value: f64, labels: Labels) {
        let index = self.bucket_index(value);
        let bucket_count = self.buckets.len();
        let state = self
            .states
            .entry(labels)
            .or_insert_with(|| HistogramState::create(bucket_count));
        state.bucket_counts[index] += 1;
        state.sum += value;
        state.count += 1;
    }

    fn export(&self, name: &str) -> HistogramExport {
        let mut samples = Vec::with_capacity(self.states.len());
        for (labels, state) in &self.states {
            let mut cumulative = 0u64;
            let mut buckets = Vec::with_capacity(self.buckets.len() + 1);
            for (boundary, count) in self.buckets.iter().zip(&state.bucket_counts) {
                cumulative += count;
                buckets.push(BucketCount {
                    le: BucketBound::Finite(*boundary),
                    count: cumulative as f64,
                });
            }
            cumulative += state.bucket_counts[self.buckets.len()];
            buckets.push(BucketCount {
                le: BucketBound::inf(),
                count: cumulative as f64,
            });
            samples.push(HistogramSample {
                labels: labels.clone(),
                sum: state.sum,
                count: state.count as f64,
                buckets,
            });
        }
        HistogramExport {
            name: name.to_string(),
            description: self.description.clone(),
            buckets: self.buckets.clone(),
            samples,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<String, CounterFamily>,
    histograms: BTreeMap<String, HistogramFamily>,
    events: BTreeMap<String, Vec<Event>>,
}

/// Thread-safe registry of counter, histogram, and event families keyed by
/// metric name.
#[derive(Debug, Default)]
pub struct MetricCollector {
    registry: Mutex<Registry>,
}

impl MetricCollector {
    pub fn new() -> Self {
        MetricCollector::default()
    }

    /// Add `amount` to the counter's value for this label set.
    pub fn inc(&self, name: &str, amount: f64, labels: Labels) -> Result<(), MetricsError> {
        if amount < 0.0 {
            return Err(MetricsError::NegativeIncrement(amount));
        }
        let mut registry = self.registry.lock();
        let family = registry.counters.entry(name.to_string()).or_default();
        *family.values.entry(labels).or_insert(0.0) += amount;
        Ok(())
    }

    /// Record one observation.  Bucket bounds are fixed by the first
    /// registration of the name; later `buckets` arguments are ignored.
    pub fn observe(&self, name: &str, value: f64, labels: Labels, buckets: Option<&[f64]>) {
        let mut registry = self.registry.lock();
        let family = registry
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| HistogramFamily::new(String::new(), buckets));
        family.observe(value, labels);
    }

    /// Append an event to the named stream.
    pub fn record_event(&self, name: &str, event: Event) {
        let mut registry = self.registry.lock();
        registry.events.entry(name.to_string()).or_default().push(event);
    }

    /// Copy every family under the registry lock; with `reset`, clear them
    /// in the same critical section.
    pub fn snapshot(&self, reset: bool) -> SnapshotData {
        let mut registry = self.registry.lock();
        let counters = registry
            .counters
            .iter()
            .map(|(name, family)| (name.clone(), family.export(name)))
            .collect();
        let histograms = registry
            .histograms
            .iter()
            .map(|(name, family)| (name.clone(), family.export(name)))
            .collect();
        let events = registry.events.clone();
        if reset {
            registry.counters.clear();
            registry.histograms.clear();
            registry.events.clear();
        }
        SnapshotData {
            timestamp: unix_now(),
            counters,
            histograms,
            events,
        }
    }

    pub fn reset(&self) {
        self.snapshot(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let collector = MetricCollector::new();
        collector
            .inc("requests", 1.0, labels([("status", "200")]))
            .unwrap();
        collector
            .inc("requests", 2.0, labels([("status", "200")]))
            .unwrap();
        collector
            .inc("requests", 1.0, labels([("status", "500")]))
            .unwrap();

        let snap = collector.snapshot(false);
        let counter = &snap.counters["requests"];
        let mut values: Vec<_> = counter
            .samples
            .iter()
            .map(|s| (s.labels["status"].clone(), s.value))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.partial_cmp(&b.1).unwrap()));
        assert_eq!(values, vec![("200".to_string(), 3.0), ("500".to_string(), 1.0)]);
    }

    #[test]
    fn negative_increment_is_rejected() {
        let collector = MetricCollector::new();
        assert!(matches!(
            collector.inc("requests", -1.0, Labels::new()),
            Err(MetricsError::NegativeIncrement(_))
        ));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let collector = MetricCollector::new();
        for value in [0.03, 0.07, 0.2, 30.0] {
            collector.observe("latency", value, Labels::new(), None);
        }
        let snap = collector.snapshot(false);
        let histogram = &snap.histograms["latency"];
        assert_eq!(histogram.buckets, DEFAULT_LATENCY_BUCKETS.to_vec());
        let sample = &histogram.samples[0];
        assert_eq!(sample.count, 4.0);
        assert!((sample.sum - 30.3).abs() < 1e-9);
        // 0.05 -> 1, 0.1 -> 2, 0.25 -> 3, ... +Inf -> 4
        assert_eq!(sample.buckets[0].count, 1.0);
        assert_eq!(sample.buckets[1].count, 2.0);
        assert_eq!(sample.buckets[2].count, 3.0);
        assert_eq!(sample.buckets.last().unwrap().count, 4.0);
        assert_eq!(sample.buckets.last().unwrap().le, BucketBound::inf());
    }

    #[test]
    fn value_on_boundary_lands_in_that_bucket() {
        let collector = MetricCollector::new();
        collector.observe("latency", 0.05, Labels::new(), None);
        let snap = collector.snapshot(false);
        assert_eq!(snap.histograms["latency"].samples[0].buckets[0].count, 1.0);
    }

    #[test]
    fn first_registration_fixes_bucket_bounds() {
        let collector = MetricCollector::new();
        collector.observe("latency", 1.0, Labels::new(), Some(&[1.0, 2.0]));
        collector.observe("latency", 1.5, Labels::new(), Some(&[10.0, 20.0, 30.0]));
        let snap = collector.snapshot(false);
        assert_eq!(snap.histograms["latency"].buckets, vec![1.0, 2.0]);
    }

    #[test]
    fn events_preserve_append_order() {
        let collector = MetricCollector::new();
        for i in 0..3 {
            collector.record_event(
                "http_request",
                Event {
                    timestamp: i as f64,
                    labels: Labels::new(),
                    payload: serde_json::json!({ "seq": i }),
                },
            );
        }
        let snap = collector.snapshot(false);
        let seqs: Vec<_> = snap.events["http_request"]
            .iter()
            .map(|e| e.payload["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn reset_snapshot_clears_all_families() {
        let collector = MetricCollector::new();
        collector.inc("requests", 1.0, Labels::new()).unwrap();
        collector.observe("latency", 0.1, Labels::new(), None);
        collector.record_event(
            "http_request",
            Event {
                timestamp: 1.0,
                labels: Labels::new(),
                payload: serde_json::Value::Null,
            },
        );

        let first = collector.snapshot(true);
        assert_eq!(first.counters.len(), 1);
        assert_eq!(first.histograms.len(), 1);
        assert_eq!(first.events.len(), 1);

        let second = collector.snapshot(false);
        assert!(second.counters.is_empty());
        assert!(second.histograms.is_empty());
        assert!(second.events.is_empty());
    }
}
