//! Canonical metric names and recording helpers shared by journey
//! execution and the builtin HTTP journey, so every node exports the same
//! families and existing dashboards keep working.

use serde_json::json;

use crate::export::{Event, Labels};
use crate::{unix_now, MetricCollector};

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_ERRORS_TOTAL: &str = "http_errors_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const JOURNEY_EXECUTIONS_TOTAL: &str = "journey_executions_total";
pub const JOURNEY_FAILURES_TOTAL: &str = "journey_failures_total";
pub const JOURNEY_DURATION_SECONDS: &str = "journey_duration_seconds";
pub const HTTP_REQUEST_EVENT: &str = "http_request";

/// The identity labels attached to every journey-scoped metric.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioLabels {
    pub scenario: String,
    pub journey: String,
    pub node: Option<String>,
}

impl ScenarioLabels {
    pub fn to_labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert("scenario".to_string(), self.scenario.clone());
        labels.insert("journey".to_string(), self.journey.clone());
        if let Some(node) = &self.node {
            labels.insert("node".to_string(), node.clone());
        }
        labels
    }
}

/// Record one target-service request: request counter, error counter for
/// status >= 400, duration histogram, and an `http_request` event.
#[allow(clippy::too_many_arguments)]
pub fn record_http_request(
    collector: &MetricCollector,
    scenario: &ScenarioLabels,
    method: &str,
    url: &str,
    status: u16,
    duration: f64,
    timestamp: Option<f64>,
) {
    let timestamp = timestamp.unwrap_or_else(unix_now);
    let mut labels = scenario.to_labels();
    labels.insert("method".to_string(), method.to_uppercase());
    labels.insert("status".to_string(), status.to_string());
    let (host, path) = split_url(url);
    if !host.is_empty() {
        labels.insert("host".to_string(), host);
    }
    labels.insert("path".to_string(), path);

    let _ = collector.inc(HTTP_REQUESTS_TOTAL, 1.0, labels.clone());
    if status >= 400 {
        let _ = collector.inc(HTTP_ERRORS_TOTAL, 1.0, labels.clone());
    }
    collector.observe(HTTP_REQUEST_DURATION_SECONDS, duration, labels.clone(), None);
    collector.record_event(
        HTTP_REQUEST_EVENT,
        Event {
            timestamp,
            labels,
            payload: json!({ "duration": duration }),
        },
    );
}

pub fn record_journey_success(collector: &MetricCollector, scenario: &ScenarioLabels, duration: f64) {
    let labels = scenario.to_labels();
    let _ = collector.inc(JOURNEY_EXECUTIONS_TOTAL, 1.0, labels.clone());
    collector.observe(JOURNEY_DURATION_SECONDS, duration, labels, None);
}

pub fn record_journey_failure(
    collector: &MetricCollector,
    scenario: &ScenarioLabels,
    duration: f64,
    error_kind: &str,
) {
    let labels = scenario.to_labels();
    let _ = collector.inc(JOURNEY_EXECUTIONS_TOTAL, 1.0, labels.clone());
    let mut failure_labels = labels.clone();
    failure_labels.insert("error".to_string(), error_kind.to_string());
    let _ = collector.inc(JOURNEY_FAILURES_TOTAL, 1.0, failure_labels);
    if duration >= 0.0 {
        collector.observe(JOURNEY_DURATION_SECONDS, duration, labels, None);
    }
}

/// `http://host:port/path?q` -> `(host:port, /path)`.
fn split_url(url: &str) -> (String, String) {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    match rest.split_once('/') {
        Some((host, path)) => {
            let path = path.split('?').next().unwrap_or("");
            (host.to_string(), format!("/{}", path))
        }
        None => (rest.to_string(), "/".to_string()),
    }
}
