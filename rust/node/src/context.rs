//! Per-request execution scope.
//!
//! Every spawned request gets a fresh [`Context`]: trace identifiers, the
//! metadata that becomes metric labels, and a LIFO stack of cleanup hooks
//! run exactly once when the context closes.

use std::sync::Arc;
use std::time::Instant;

use stampede_metrics::{MetricCollector, ScenarioLabels};

type CleanupHook = Box<dyn FnOnce() + Send>;

#[derive(Clone, Debug, PartialEq)]
pub struct ContextMetadata {
    pub scenario: String,
    pub journey_spec: String,
    pub node: String,
}

pub struct Context {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub metadata: ContextMetadata,
    start: Instant,
    collector: Arc<MetricCollector>,
    cleanup_hooks: Vec<CleanupHook>,
    closed: bool,
}

impl Context {
    pub fn new(collector: Arc<MetricCollector>, metadata: ContextMetadata) -> Self {
        Context {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: span_id(),
            parent_span_id: None,
            metadata,
            start: Instant::now(),
            collector,
            cleanup_hooks: Vec::new(),
            closed: false,
        }
    }

    /// A child scope for a nested operation: same trace, new span, this
    /// span as parent.
    pub fn child(&self) -> Context {
        Context {
            trace_id: self.trace_id.clone(),
            span_id: span_id(),
            parent_span_id: Some(self.span_id.clone()),
            metadata: self.metadata.clone(),
            start: Instant::now(),
            collector: Arc::clone(&self.collector),
            cleanup_hooks: Vec::new(),
            closed: false,
        }
    }

    pub fn collector(&self) -> &Arc<MetricCollector> {
        &self.collector
    }

    /// The `{scenario, journey, node}` labels for this request's metrics.
    pub fn scenario_labels(&self) -> ScenarioLabels {
        ScenarioLabels {
            scenario: self.metadata.scenario.clone(),
            journey: self.metadata.journey_spec.clone(),
            node: Some(self.metadata.node.clone()),
        }
    }

    /// Record one target-service request under this context's labels.
    pub fn record_http_request(&self, method: &str, url: &str, status: u16, duration: f64) {
        stampede_metrics::record_http_request(
            &self.collector,
            &self.scenario_labels(),
            method,
            url,
            status,
            duration,
            None,
        );
    }

    pub fn add_cleanup_hook(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.cleanup_hooks.push(Box::new(hook));
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Run the cleanup hooks in reverse registration order.  Subsequent
    /// calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        while let Some(hook) = self.cleanup_hooks.pop() {
            hook();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("trace_id", &self.trace_id)
            .field("span_id", &self.span_id)
            .field("metadata", &self.metadata)
            .finish()
    }
}

fn span_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn context() -> Context {
        Context::new(
            Arc::new(MetricCollector::new()),
            ContextMetadata {
                scenario: "demo".to_string(),
                journey_spec: "demo:get".to_string(),
                node: "abcd".to_string(),
            },
        )
    }

    #[test]
    fn cleanup_hooks_run_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context();
        for i in 0..3 {
            let order = Arc::clone(&order);
            ctx.add_cleanup_hook(move || order.lock().unwrap().push(i));
        }
        ctx.close();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn close_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = context();
        let counted = Arc::clone(&calls);
        ctx.add_cleanup_hook(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        ctx.close();
        ctx.close();
        drop(ctx);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_runs_hooks_if_never_closed() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let mut ctx = context();
            let counted = Arc::clone(&calls);
            ctx.add_cleanup_hook(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_shares_the_trace() {
        let ctx = context();
        let child = ctx.child();
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_ne!(child.span_id, ctx.span_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(ctx.span_id.as_str()));
        assert_eq!(child.metadata, ctx.metadata);
    }

    #[test]
    fn labels_come_from_metadata() {
        let labels = context().scenario_labels();
        assert_eq!(labels.scenario, "demo");
        assert_eq!(labels.journey, "demo:get");
        assert_eq!(labels.node.as_deref(), Some("abcd"));
    }
}
