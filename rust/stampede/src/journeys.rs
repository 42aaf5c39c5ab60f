//! Builtin journeys.
//!
//! Scenarios compose these into load shapes without any dynamic code
//! loading: an HTTP GET journey against the target service, and a log-only
//! journey for wiring checks.

use std::sync::Arc;
use std::time::Instant;

use stampede_node::{Context, JourneyError, JourneyFn};

/// GET the configured URL, or the datapool item when one is supplied.  An
/// item that parses as a URL replaces the target wholesale; anything else
/// is appended as a path.
///
/// Every response is recorded under the canonical HTTP metric names;
/// statuses >= 400 count as errors but not journey failures.  Only
/// transport-level failures fail the journey.
pub fn http_get(client: reqwest::Client, url: String) -> JourneyFn {
    Arc::new(move |context: Context, item: Option<String>| {
        let client = client.clone();
        let url = request_url(&url, item.as_deref());
        Box::pin(async move {
            let start = Instant::now();
            let response = client
                .get(&url)
                .header("X-Trace-ID", context.trace_id.clone())
                .header("X-Span-ID", context.span_id.clone())
                .send()
                .await
                .map_err(|err| JourneyError::new("RequestError", err.to_string()))?;
            let status = response.status().as_u16();
            // drain the body so the duration covers the whole exchange
            let _ = response
                .bytes()
                .await
                .map_err(|err| JourneyError::new("BodyError", err.to_string()))?;
            let duration = start.elapsed().as_secs_f64();
            context.record_http_request("GET", &url, status, duration);
            tracing::debug!(
                trace_id = %context.trace_id,
                "GET {url} - Status: {status} ({duration:.3}s)"
            );
            Ok(())
        })
    })
}

/// Emit one log line per execution.  Useful for verifying partitioning and
/// pacing without a target service.
pub fn log_line(message: String) -> JourneyFn {
    Arc::new(move |context: Context, item: Option<String>| {
        let message = message.clone();
        Box::pin(async move {
            match item {
                Some(item) => tracing::info!(
                    trace_id = %context.trace_id,
                    journey = %context.metadata.journey_spec,
                    "{message} [{item}]"
                ),
                None => tracing::info!(
                    trace_id = %context.trace_id,
                    journey = %context.metadata.journey_spec,
                    "{message}"
                ),
            }
            Ok(())
        })
    })
}

fn request_url(base: &str, item: Option<&str>) -> String {
    match item {
        Some(item) if item.starts_with("http://") || item.starts_with("https://") => {
            item.to_string()
        }
        Some(item) => {
            format!("{}/{}", base.trim_end_matches('/'), item.trim_start_matches('/'))
        }
        None => base.to_string(),
    }
}
