//! Tracing subscriber and OpenTelemetry setup for the runner.

use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{Config, RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,eco_world=debug";

/// Collector endpoint: the standard OTEL variable wins over the CLI flag
fn resolve_endpoint(otel_endpoint: Option<&str>) -> Option<String> {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| otel_endpoint.map(|s| s.to_string()))
}

fn trace_config(sampler: Sampler) -> Config {
    let service = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "eco-sim".to_string());
    Config::default()
        .with_sampler(sampler)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new(SERVICE_NAME, service),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]))
}

/// Install the global subscriber. With an endpoint, spans are batched to an
/// OTLP collector over gRPC; without one the tracer samples nothing.
pub fn init_telemetry(otel_endpoint: Option<&str>, json_logs: bool) -> Result<()> {
    let endpoint = resolve_endpoint(otel_endpoint);

    let tracer_provider = match &endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.as_str())
                .build()?;
            TracerProvider::builder()
                .with_batch_exporter(exporter, runtime::Tokio)
                .with_config(trace_config(Sampler::AlwaysOn))
                .build()
        }
        None => TracerProvider::builder()
            .with_config(trace_config(Sampler::AlwaysOff))
            .build(),
    };

    global::set_tracer_provider(tracer_provider.clone());
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("eco-sim"));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json_layer = json_logs.then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let text_layer = (!json_logs).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(telemetry_layer)
        .try_init()?;

    match endpoint {
        Some(endpoint) => info!("Exporting spans to OTLP endpoint {}", endpoint),
        None => info!("OpenTelemetry disabled (no endpoint configured)"),
    }
    Ok(())
}

/// Flush pending span batches and tear down the global provider
pub fn shutdown_telemetry() {
    info!("Shutting down telemetry");
    global::shutdown_tracer_provider();
}
