//! Cluster-wide views over collections of node snapshots.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::export::{
    BucketBound, BucketCount, CounterExport, CounterSample, Event, HistogramExport,
    HistogramSample, Labels,
};
use crate::snapshot::MetricsSnapshot;
use crate::unix_now;

/// Metrics from many snapshots folded into a single cluster view.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSnapshot {
    pub timestamp: i64,
    pub node_count: usize,
    pub counters: BTreeMap<String, CounterExport>,
    pub histograms: BTreeMap<String, HistogramExport>,
    pub events: BTreeMap<String, Vec<Event>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricKind {
    Counter,
    Histogram,
    Event,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SeriesSamples {
    Counter(Vec<CounterSample>),
    Histogram(Vec<HistogramSample>),
    Events(Vec<Event>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeriesPoint {
    pub timestamp: i64,
    pub node_identity: String,
    pub samples: SeriesSamples,
}

/// Fold every snapshot into one view: counters sum per label set,
/// histograms merge bucket-wise, events concatenate in time order.
pub fn aggregate_snapshots(snapshots: &[MetricsSnapshot]) -> AggregatedSnapshot {
    let mut counters: BTreeMap<String, CounterAccumulator> = BTreeMap::new();
    let mut histograms: BTreeMap<String, HistogramAccumulator> = BTreeMap::new();
    let mut events: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    let mut node_ids: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
    let mut latest_timestamp = 0i64;

    for snapshot in snapshots {
        node_ids.insert(&snapshot.node_identity);
        latest_timestamp = latest_timestamp.max(snapshot.timestamp);
        for (name, counter) in &snapshot.data.counters {
            merge_counter(counters.entry(name.clone()).or_default(), counter);
        }
        for (name, histogram) in &snapshot.data.histograms {
            let accumulator = histograms
                .entry(name.clone())
                .or_insert_with(|| HistogramAccumulator::new(histogram));
            merge_histogram(accumulator, histogram);
        }
        for (name, entries) in &snapshot.data.events {
            events.entry(name.clone()).or_default().extend(entries.iter().cloned());
        }
    }

    for entries in events.values_mut() {
        entries.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    }

    AggregatedSnapshot {
        timestamp: if latest_timestamp > 0 {
            latest_timestamp
        } else {
            unix_now() as i64
        },
        node_count: node_ids.len(),
        counters: counters
            .into_iter()
            .map(|(name, acc)| (name.clone(), acc.finalize(&name)))
            .collect(),
        histograms: histograms
            .into_iter()
            .map(|(name, acc)| (name.clone(), acc.finalize(&name)))
            .collect(),
        events,
    }
}

/// Aggregate only the snapshots inside `[start, end]` (unix seconds, either
/// side open when `None`).
pub fn query_time_window(
    snapshots: &[MetricsSnapshot],
    start: Option<i64>,
    end: Option<i64>,
) -> AggregatedSnapshot {
    let filtered: Vec<MetricsSnapshot> = snapshots
        .iter()
        .filter(|s| start.map_or(true, |t| s.timestamp >= t))
        .filter(|s| end.map_or(true, |t| s.timestamp <= t))
        .cloned()
        .collect();
    aggregate_snapshots(&filtered)
}

/// The newest snapshot per node identity, sorted by identity.
pub fn latest_per_node(snapshots: &[MetricsSnapshot]) -> Vec<&MetricsSnapshot> {
    let mut latest: HashMap<&str, &MetricsSnapshot> = HashMap::new();
    for snapshot in snapshots {
        match latest.get(snapshot.node_identity.as_str()) {
            Some(current) if current.timestamp >= snapshot.timestamp => {}
            _ => {
                latest.insert(&snapshot.node_identity, snapshot);
            }
        }
    }
    let mut out: Vec<&MetricsSnapshot> = latest.into_values().collect();
    out.sort_by(|a, b| a.node_identity.cmp(&b.node_identity));
    out
}

/// The per-snapshot samples of one metric across nodes, in time order.
pub fn time_series(
    snapshots: &[MetricsSnapshot],
    metric_name: &str,
    kind: MetricKind,
) -> Vec<TimeSeriesPoint> {
    let mut ordered: Vec<&MetricsSnapshot> = snapshots.iter().collect();
    ordered.sort();
    let mut series = Vec::new();
    for snapshot in ordered {
        let samples = match kind {
            MetricKind::Counter => snapshot
                .data
                .counters
                .get(metric_name)
                .filter(|c| !c.samples.is_empty())
                .map(|c| SeriesSamples::Counter(c.samples.clone())),
            MetricKind::Histogram => snapshot
                .data
                .histograms
                .get(metric_name)
                .filter(|h| !h.samples.is_empty())
                .map(|h| SeriesSamples::Histogram(h.samples.clone())),
            MetricKind::Event => snapshot
                .data
                .events
                .get(metric_name)
                .filter(|e| !e.is_empty())
                .map(|e| SeriesSamples::Events(e.clone())),
        };
        if let Some(samples) = samples {
            series.push(TimeSeriesPoint {
                timestamp: snapshot.timestamp,
                node_identity: snapshot.node_identity.clone(),
                samples,
            });
        }
    }
    series
}

#[derive(Default)]
struct CounterAccumulator {
    description: String,
    values: BTreeMap<Labels, f64>,
}

impl CounterAccumulator {
    fn finalize(self, name: &str) -> CounterExport {
        CounterExport {
            name: name.to_string(),
            description: self.description,
            samples: self
                .values
                .into_iter()
                .map(|(labels, value)| CounterSample { labels, value })
                .collect(),
        }
    }
}

fn merge_counter(accumulator: &mut CounterAccumulator, counter: &CounterExport) {
    if accumulator.description.is_empty() {
        accumulator.description = counter.description.clone();
    }
    for sample in &counter.samples {
        *accumulator.values.entry(sample.labels.clone()).or_insert(0.0) += sample.value;
    }
}

struct HistogramSampleAccumulator {
    counts: Vec<f64>,
    sum: f64,
    count: f64,
}

struct HistogramAccumulator {
    description: String,
    buckets: Vec<f64>,
    samples: BTreeMap<Labels, HistogramSampleAccumulator>,
}

impl HistogramAccumulator {
    fn new(first: &HistogramExport) -> Self {
        HistogramAccumulator {
            description: first.description.clone(),
            buckets: first.buckets.clone(),
            samples: BTreeMap::new(),
        }
    }

    fn finalize(self, name: &str) -> HistogramExport {
        let mut samples = Vec::with_capacity(self.samples.len());
        for (labels, acc) in self.samples {
            let mut cumulative = 0.0;
            let mut buckets = Vec::with_capacity(acc.counts.len());
            for (idx, increment) in acc.counts.iter().enumerate() {
                cumulative += increment;
                let le = self
                    .buckets
                    .get(idx)
                    .map(|b| BucketBound::Finite(*b))
                    .unwrap_or_else(BucketBound::inf);
                buckets.push(BucketCount {
                    le,
                    count: cumulative,
                });
            }
            samples.push(HistogramSample {
                labels,
                sum: acc.sum,
                count: acc.count,
                buckets,
            });
        }
        HistogramExport {
            name: name.to_string(),
            description: self.description,
            buckets: self.buckets,
            samples,
        }
    }
}

fn merge_histogram(accumulator: &mut HistogramAccumulator, histogram: &HistogramExport) {
    let expected_len = accumulator.buckets.len() + 1;
    for sample in &histogram.samples {
        if sample.buckets.is_empty() {
            continue;
        }
        let counts = bucket_increments(&sample.buckets);
        // Elementwise sums require identical bounds; mismatched shapes from
        // an incompatible peer are dropped rather than misfiled.
        if counts.len() != expected_len {
            continue;
        }
        let acc = accumulator
            .samples
            .entry(sample.labels.clone())
            .or_insert_with(|| HistogramSampleAccumulator {
                counts: vec![0.0; counts.len()],
                sum: 0.0,
                count: 0.0,
            });
        for (slot, increment) in acc.counts.iter_mut().zip(&counts) {
            *slot += increment;
        }
        acc.sum += sample.sum;
        acc.count += sample.count;
    }
}

/// Cumulative bucket counts back to per-bucket increments.
fn bucket_increments(buckets: &[BucketCount]) -> Vec<f64> {
    let mut increments = Vec::with_capacity(buckets.len());
    let mut previous = 0.0;
    for bucket in buckets {
        increments.push((bucket.count - previous).max(0.0));
        previous = bucket.count;
    }
    increments
}
