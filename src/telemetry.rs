//! Structured logging and optional OpenTelemetry trace export
//!
//! Logs are always written as JSON to stdout. When an OTLP endpoint is
//! configured, spans (including the per-reconcile `reconcile` span) are also
//! exported over gRPC with W3C TraceContext propagation.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,myapp_operator=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize the OTLP span exporter
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans
    pub service_name: String,

    /// OTLP gRPC endpoint (e.g. "http://otel-collector:4317"); logs only when None
    pub otlp_endpoint: Option<String>,

    /// Where the operator pod runs, as (attribute key, value) pairs
    pub placement: Vec<(&'static str, String)>,
}

/// Downward-API variables mapped to their semantic-convention attribute keys
const PLACEMENT_ENV: [(&str, &str); 2] = [
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("POD_NAME", "k8s.pod.name"),
];

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: crate::FIELD_MANAGER.to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            placement: PLACEMENT_ENV
                .iter()
                .filter_map(|(var, key)| std::env::var(var).ok().map(|v| (*key, v)))
                .collect(),
        }
    }
}

/// Install the global tracing subscriber
///
/// Must be called once, from inside the tokio runtime when an OTLP endpoint
/// is set (the batch exporter spawns onto it).
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let provider = init_otlp_tracer(endpoint, build_resource(&config))?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(())
}

/// Flush pending spans before exit
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// Service identity plus pod placement
fn build_resource(config: &TelemetryConfig) -> Resource {
    use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

    let identity = [
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    let placement = config
        .placement
        .iter()
        .map(|(key, value)| KeyValue::new(*key, value.clone()));

    Resource::new(identity.into_iter().chain(placement))
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}
