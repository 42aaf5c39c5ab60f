//! Serializable snapshot exports.  These shapes are shared by the on-disk
//! snapshot files, the gossip payloads, and the cluster aggregator, so they
//! round-trip through JSON without loss.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A canonicalized label set: sorted by key by construction.
pub type Labels = BTreeMap<String, String>;

pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    pub labels: Labels,
    pub value: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterExport {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub samples: Vec<CounterSample>,
}

/// An upper bucket boundary: a finite `le` or the `+Inf` overflow bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BucketBound {
    Finite(f64),
    Label(String),
}

impl BucketBound {
    pub fn inf() -> Self {
        BucketBound::Label("+Inf".to_string())
    }
}

/// One bucket of one histogram sample; `count` is cumulative, Prometheus
/// style.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketCount {
    pub le: BucketBound,
    pub count: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramSample {
    pub labels: Labels,
    pub sum: f64,
    pub count: f64,
    pub buckets: Vec<BucketCount>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramExport {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub buckets: Vec<f64>,
    pub samples: Vec<HistogramSample>,
}

/// One recorded event.  The payload is free-form JSON; ordering within a
/// stream is append order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: f64,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Everything the collector held at one instant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub timestamp: f64,
    pub counters: BTreeMap<String, CounterExport>,
    pub histograms: BTreeMap<String, HistogramExport>,
    pub events: BTreeMap<String, Vec<Event>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_bound_json_forms() {
        let finite = serde_json::to_string(&BucketBound::Finite(0.5)).unwrap();
        assert_eq!(finite, "0.5");
        let inf = serde_json::to_string(&BucketBound::inf()).unwrap();
        assert_eq!(inf, "\"+Inf\"");
        let back: BucketBound = serde_json::from_str("\"+Inf\"").unwrap();
        assert_eq!(back, BucketBound::inf());
    }

    #[test]
    fn snapshot_data_round_trips_through_json() {
        let mut data = SnapshotData {
            timestamp: 1234.5,
            ..Default::default()
        };
        data.counters.insert(
            "requests".to_string(),
            CounterExport {
                name: "requests".to_string(),
                description: String::new(),
                samples: vec![CounterSample {
                    labels: labels([("status", "200")]),
                    value: 7.0,
                }],
            },
        );
        let json = serde_json::to_string(&data).unwrap();
        let back: SnapshotData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }
}
