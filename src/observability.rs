// Centralized observability infrastructure: structured logging, metrics, tracing.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);
static INDEX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure. Call once at startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity. `--quiet` takes precedence
/// over `RUST_LOG`; `RUST_LOG` takes precedence over `--verbose`.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("pyrite=debug,info")
    } else {
        EnvFilter::new("pyrite=warn,error")
    };

    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_line_number(!quiet)
        .with_file(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("pyrite observability initialized");
            }
            Ok(())
        }
        Err(_) => Ok(()), // already initialized, fine in tests
    }
}

/// Structured operation kinds for logging, keyed by the domain concepts
/// (`kb_name`/`entry_id`/`relation`) rather than free-text interpolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    EntryUpsert {
        kb_name: String,
        entry_id: String,
    },
    EntryDelete {
        kb_name: String,
        entry_id: String,
    },
    IndexSearch {
        kb_name: Option<String>,
        query: String,
        result_count: usize,
    },
    IndexSync {
        kb_name: String,
        added: usize,
        updated: usize,
        removed: usize,
    },
    HookInvoke {
        hook: String,
        entry_id: String,
    },
    Startup {
        version: String,
    },
}

/// Metric types for performance monitoring.
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter { name: &'static str, value: u64 },
    Gauge { name: &'static str, value: f64 },
    Timer { name: &'static str, duration: Duration },
}

/// Operation context threaded through a request for correlated logging.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation: String,
    pub start_time: Instant,
    pub attributes: Vec<(String, String)>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log an operation with full context.
#[instrument(skip(ctx))]
pub fn log_operation(ctx: &OperationContext, op: &Operation, result: &Result<()>) {
    let elapsed = ctx.elapsed();
    let attrs = ctx
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");

    match result {
        Ok(()) => {
            info!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                "operation completed: {:?}", op
            );
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                error = %e,
                "operation failed: {:?}", op
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }

    match op {
        Operation::IndexSearch { .. } => {
            QUERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::EntryUpsert { .. } | Operation::EntryDelete { .. } | Operation::IndexSync { .. } => {
            INDEX_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

/// Record a metric.
pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => debug!("metric.counter {} = {}", name, value),
        MetricType::Gauge { name, value } => debug!("metric.gauge {} = {}", name, value),
        MetricType::Timer { name, duration } => debug!("metric.timer {} = {:?}", name, duration),
    }
}

/// Execute a closure with a trace context.
pub async fn with_trace_id<F, T>(operation: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let ctx = OperationContext::new(operation);
    info!(trace_id = %ctx.trace_id, span_id = %ctx.span_id, "starting operation: {}", operation);

    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    match &result {
        Ok(_) => {
            info!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                elapsed_ms = elapsed.as_millis(),
                "operation completed successfully: {}", operation
            );
            record_metric(MetricType::Timer { name: "operation.duration", duration: elapsed });
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                elapsed_ms = elapsed.as_millis(),
                error = %e,
                "operation failed: {}", operation
            );
            record_metric(MetricType::Counter { name: "operation.errors", value: 1 });
        }
    }

    result
}

/// Current metrics snapshot.
pub fn get_metrics() -> serde_json::Value {
    serde_json::json!({
        "operations": {
            "total": OPERATION_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
            "queries": QUERY_COUNTER.load(Ordering::Relaxed),
            "index_ops": INDEX_COUNTER.load(Ordering::Relaxed),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_context_parents_correctly() {
        let ctx = OperationContext::new("test_operation");
        assert_eq!(ctx.operation, "test_operation");
        assert!(ctx.parent_span_id.is_none());

        let child = ctx.child("child_operation");
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(child.parent_span_id, Some(ctx.span_id));
    }

    #[test]
    fn metrics_recording_does_not_panic() {
        record_metric(MetricType::Counter { name: "test.counter", value: 42 });
        record_metric(MetricType::Gauge { name: "test.gauge", value: std::f64::consts::PI });
        record_metric(MetricType::Timer { name: "test.timer", duration: Duration::from_millis(123) });

        let metrics = get_metrics();
        assert!(metrics["timestamp"].is_string());
        assert!(metrics["operations"].is_object());
    }

    #[tokio::test]
    async fn with_trace_id_returns_inner_result() {
        let result = with_trace_id("test_async_op", async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok::<_, anyhow::Error>(42)
        })
        .await;

        assert_eq!(result.expect("operation should succeed"), 42);
    }

    #[test]
    fn logging_level_filters_are_valid() {
        for filter_str in ["error", "pyrite=debug,info", "pyrite=warn,error"] {
            assert!(EnvFilter::try_new(filter_str).is_ok(), "bad filter: {filter_str}");
        }
    }
}
