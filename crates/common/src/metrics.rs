//! Metrics collection and reporting

use crate::error::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, Registry,
};

/// Global metrics registry
pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Completed dag-run attempts by DAG, terminal status, and trigger
pub static DAG_RUN_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagflow_dag_runs_total",
        "Total number of finished dag-run attempts",
        &["dag", "status", "trigger"]
    )
    .unwrap()
});

/// Attempt duration histogram
pub static DAG_RUN_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "dagflow_dag_run_duration_seconds",
        "Dag-run attempt duration in seconds",
        &["dag", "status"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0, 7200.0]
    )
    .unwrap()
});

/// Items enqueued per queue name
pub static ENQUEUE_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagflow_enqueued_total",
        "Total items placed on admission queues",
        &["queue", "priority"]
    )
    .unwrap()
});

/// Current queue depth per queue name
pub static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "dagflow_queue_depth",
        "Number of items waiting per queue",
        &["queue"]
    )
    .unwrap()
});

/// Node retries by DAG and step
pub static NODE_RETRY_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagflow_node_retries_total",
        "Total node retry transitions",
        &["dag", "step"]
    )
    .unwrap()
});

/// LLM token usage by provider and token type
pub static TOKEN_USAGE: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagflow_llm_tokens_total",
        "Total LLM tokens used",
        &["provider", "token_type"]
    )
    .unwrap()
});

/// LLM provider call duration
pub static PROVIDER_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "dagflow_provider_request_duration_seconds",
        "LLM provider request duration in seconds",
        &["provider", "status"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .unwrap()
});

/// Error counter
pub static ERROR_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagflow_errors_total",
        "Total number of errors",
        &["component", "severity"]
    )
    .unwrap()
});

/// Initialize all metrics
pub fn init_metrics() -> Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(DAG_RUN_COUNTER.clone()),
        Box::new(DAG_RUN_DURATION.clone()),
        Box::new(ENQUEUE_COUNTER.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(NODE_RETRY_COUNTER.clone()),
        Box::new(TOKEN_USAGE.clone()),
        Box::new(PROVIDER_DURATION.clone()),
        Box::new(ERROR_COUNTER.clone()),
    ];
    for collector in collectors {
        METRICS_REGISTRY
            .register(collector)
            .map_err(|e| crate::error::Error::Internal(format!("metrics registration: {e}")))?;
    }
    Ok(())
}

/// Metrics collector trait
pub trait MetricsCollector: Send + Sync {
    /// Record a finished dag-run attempt
    fn record_dag_run(&self, dag: &str, status: &str, trigger: &str, duration_secs: f64);

    /// Record an enqueue and the resulting queue depth
    fn record_enqueue(&self, queue: &str, priority: &str, depth: usize);

    /// Update the depth gauge after a dequeue
    fn record_queue_depth(&self, queue: &str, depth: usize);

    /// Record a node retry transition
    fn record_node_retry(&self, dag: &str, step: &str);

    /// Record LLM token usage
    fn record_tokens(&self, provider: &str, prompt_tokens: u32, completion_tokens: u32);

    /// Record provider call duration
    fn record_provider_request(&self, provider: &str, status: &str, duration_secs: f64);

    /// Record error
    fn record_error(&self, component: &str, severity: &str);
}

/// Default metrics collector backed by the prometheus statics
#[derive(Clone, Default)]
pub struct DefaultMetricsCollector;

impl MetricsCollector for DefaultMetricsCollector {
    fn record_dag_run(&self, dag: &str, status: &str, trigger: &str, duration_secs: f64) {
        DAG_RUN_COUNTER
            .with_label_values(&[dag, status, trigger])
            .inc();
        DAG_RUN_DURATION
            .with_label_values(&[dag, status])
            .observe(duration_secs);
    }

    fn record_enqueue(&self, queue: &str, priority: &str, depth: usize) {
        ENQUEUE_COUNTER.with_label_values(&[queue, priority]).inc();
        QUEUE_DEPTH
            .with_label_values(&[queue])
            .set(depth as f64);
    }

    fn record_queue_depth(&self, queue: &str, depth: usize) {
        QUEUE_DEPTH
            .with_label_values(&[queue])
            .set(depth as f64);
    }

    fn record_node_retry(&self, dag: &str, step: &str) {
        NODE_RETRY_COUNTER.with_label_values(&[dag, step]).inc();
    }

    fn record_tokens(&self, provider: &str, prompt_tokens: u32, completion_tokens: u32) {
        TOKEN_USAGE
            .with_label_values(&[provider, "prompt"])
            .inc_by(f64::from(prompt_tokens));
        TOKEN_USAGE
            .with_label_values(&[provider, "completion"])
            .inc_by(f64::from(completion_tokens));
    }

    fn record_provider_request(&self, provider: &str, status: &str, duration_secs: f64) {
        PROVIDER_DURATION
            .with_label_values(&[provider, status])
            .observe(duration_secs);
    }

    fn record_error(&self, component: &str, severity: &str) {
        ERROR_COUNTER
            .with_label_values(&[component, severity])
            .inc();
    }
}

/// Collector that drops everything; used by tests and the no-op wiring
#[derive(Clone, Default)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn record_dag_run(&self, _: &str, _: &str, _: &str, _: f64) {}
    fn record_enqueue(&self, _: &str, _: &str, _: usize) {}
    fn record_queue_depth(&self, _: &str, _: usize) {}
    fn record_node_retry(&self, _: &str, _: &str) {}
    fn record_tokens(&self, _: &str, _: u32, _: u32) {}
    fn record_provider_request(&self, _: &str, _: &str, _: f64) {}
    fn record_error(&self, _: &str, _: &str) {}
}
