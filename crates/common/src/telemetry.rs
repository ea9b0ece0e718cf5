//! Telemetry and observability setup

use crate::config::{LogFormat, ObservabilityConfig};
use crate::error::{Error, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{self as sdktrace, RandomIdGenerator, Sampler},
    Resource,
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Initialize telemetry subsystems
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    let registry = Registry::default().with(env_filter).with(fmt_layer);

    match (config.tracing_enabled, &config.otlp_endpoint) {
        (true, Some(endpoint)) => {
            let tracer = init_tracer(endpoint)?;
            let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            registry.with(telemetry_layer).init();
        }
        _ => registry.init(),
    }

    Ok(())
}

/// Initialize the OTLP tracer pipeline
fn init_tracer(endpoint: &str) -> Result<sdktrace::Tracer> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", "dagflow"),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            sdktrace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_resource(resource),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::Config(format!("failed to install OTLP tracer: {e}")))
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
