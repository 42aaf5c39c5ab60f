use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::export::SnapshotData;
use crate::unix_now;

/// An immutable metrics snapshot from one node at one second, shared across
/// the cluster through the `metrics_snapshots` set and persisted to disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub node_identity: String,
    /// Unix seconds when the snapshot was taken.
    pub timestamp: i64,
    #[serde(rename = "snapshot_data")]
    pub data: SnapshotData,
}

impl MetricsSnapshot {
    pub fn from_collector(node_identity: impl Into<String>, data: SnapshotData) -> Self {
        MetricsSnapshot {
            node_identity: node_identity.into(),
            timestamp: unix_now() as i64,
            data,
        }
    }

    /// The CRDT element key for this snapshot.
    pub fn element_key(&self) -> String {
        format!("{}:{}", self.node_identity, self.timestamp)
    }

    pub fn age_seconds(&self) -> f64 {
        unix_now() - self.timestamp as f64
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age_seconds() > ttl.as_secs_f64()
    }
}

impl Eq for MetricsSnapshot {}

impl Ord for MetricsSnapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.node_identity.cmp(&other.node_identity))
    }
}

impl PartialOrd for MetricsSnapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
