use anyhow::Result;
use tracing::Subscriber;
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::Config;

/// Install the global subscriber: JSON lines filtered by `RUST_LOG`, falling
/// back to `LOG_LEVEL`. With `OTEL_ENABLED` the OTLP span exporter is layered
/// underneath; if it cannot start, logging continues without it.
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.log_level)));

    if config.otel_enabled {
        match init_otel(config) {
            Ok(otel_layer) => {
                // OTel layer added first (closest to Registry), then fmt layers on top.
                tracing_subscriber::registry()
                    .with(otel_layer)
                    .with(filter)
                    .with(json_layer())
                    .try_init()?;
                tracing::info!(
                    endpoint = %config.otel_exporter_otlp_endpoint,
                    "OpenTelemetry OTLP exporter initialized"
                );
            }
            Err(e) => {
                // Subscriber isn't installed yet, so stderr is the only sink.
                eprintln!("[metered-gateway] OTel init failed ({e}), continuing with JSON logs only");
                tracing_subscriber::registry()
                    .with(filter)
                    .with(json_layer())
                    .try_init()?;
            }
        }
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer())
            .try_init()?;
    }

    Ok(())
}

/// One JSON line per event; the concrete subscriber differs per branch.
fn json_layer<S>() -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
}

fn init_otel(
    config: &Config,
) -> Result<impl Layer<tracing_subscriber::Registry> + Send + Sync + 'static>
{
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.otel_exporter_otlp_endpoint.clone()),
        )
        .with_trace_config(
            sdktrace::Config::default().with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                "metered-gateway",
            )])),
        )
        .install_batch(runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

fn level_directive(log_level: &str) -> &'static str {
    match log_level.trim().to_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}
