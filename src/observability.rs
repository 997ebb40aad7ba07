//! Logging and tracing setup
//!
//! Structured logging is ambient: every module logs through `tracing`
//! directly. This module only owns process-wide setup — the env-filtered
//! fmt subscriber used everywhere, and an optional OpenTelemetry exporter
//! behind the `otel` feature for environments that ship traces to a
//! collector.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` layer filtered by `RUST_LOG`
/// (defaulting to `info`). Call once at process startup.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}

/// OpenTelemetry tracer configuration.
#[derive(Debug, Clone)]
pub struct OtelConfig {
    pub service_name: String,
    /// OTLP endpoint, e.g. `http://localhost:4318/v1/traces`.
    pub endpoint: String,
    pub use_http: bool,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            service_name: "execution-kernel".to_string(),
            endpoint: "http://localhost:4318/v1/traces".to_string(),
            use_http: true,
        }
    }
}

/// Initializes an OTLP exporter and layers it onto the `tracing`
/// subscriber alongside the fmt layer. Call instead of `init_tracing`
/// when traces should ship to a collector.
#[cfg(feature = "otel")]
pub fn init_otel_tracer(config: OtelConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::TracerProvider;
    use opentelemetry_sdk::Resource;

    let exporter = opentelemetry_otlp::new_exporter().http().with_endpoint(&config.endpoint);

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter.build_span_exporter()?, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
        ]))
        .build();

    opentelemetry::global::set_tracer_provider(tracer_provider);

    let telemetry = tracing_opentelemetry::layer().with_tracer(opentelemetry::global::tracer("execution-kernel"));

    tracing_subscriber::registry()
        .with(telemetry)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    tracing::info!(service = %config.service_name, endpoint = %config.endpoint, "OpenTelemetry tracer initialized");
    Ok(())
}

#[cfg(feature = "otel")]
pub fn shutdown_otel_tracer() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("OpenTelemetry tracer shutdown complete");
}

#[cfg(not(feature = "otel"))]
pub fn init_otel_tracer(_config: OtelConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::warn!("OpenTelemetry not enabled - build with `--features otel` to enable");
    Ok(())
}

#[cfg(not(feature = "otel"))]
pub fn shutdown_otel_tracer() {}
