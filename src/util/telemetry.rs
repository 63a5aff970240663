use std::time::Duration;

use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{self, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::constants::{DEFAULT_LOG_FILTER, SERVICE_NAME, TRACER_NAME};
use crate::util::env::TelemetryEnv;

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;

/// OTLP exporters, present only when a collector endpoint is configured.
#[derive(Debug, Clone)]
struct Exporters {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    filter: String,
    exporters: Option<Exporters>,
}

impl Telemetry {
    pub fn new(env: &TelemetryEnv) -> Result<Telemetry> {
        let filter = env
            .rust_log
            .clone()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let exporters = match env.otel_exporter_otlp_endpoint.as_deref() {
            Some(collector_url) => {
                let base_resource = base_attrs(SERVICE_NAME, env!("CARGO_PKG_VERSION"));
                Some(Exporters {
                    logger_provider: build_logger_provider(collector_url, base_resource.clone())?,
                    tracer_provider: build_tracer_provider(collector_url, base_resource.clone())?,
                    meter_provider: build_meter_provider(collector_url, base_resource)?,
                })
            }
            None => None,
        };

        Ok(Self { filter, exporters })
    }

    /// Installs the global subscriber. Console output is always enabled; trace, log and metric
    /// export are layered on when exporters were built.
    pub fn register(self) -> Self {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true);

        let (trace_layer, log_layer, meter_layer) = match &self.exporters {
            Some(exporters) => {
                global::set_tracer_provider(exporters.tracer_provider.clone());
                global::set_meter_provider(exporters.meter_provider.clone());
                let tracer = global::tracer(TRACER_NAME);

                (
                    Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                    Some(OpenTelemetryTracingBridge::new(&exporters.logger_provider)),
                    Some(tracing_opentelemetry::MetricsLayer::new(
                        exporters.meter_provider.clone(),
                    )),
                )
            }
            None => (None, None, None),
        };

        tracing_subscriber::registry()
            .with(trace_layer)
            .with(log_layer)
            .with(meter_layer)
            .with(EnvFilter::new(&self.filter))
            .with(fmt_layer)
            .init();

        self
    }

    /// Flushes and shuts down any exporters. Must run before the process exits, as a batch job
    /// would otherwise drop its buffered spans.
    pub fn shutdown(self) {
        let Some(exporters) = self.exporters else {
            return;
        };

        if let Err(e) = exporters.meter_provider.shutdown() {
            eprintln!("error during metering shutdown: {e:?}");
        }

        if let Err(e) = exporters.logger_provider.shutdown() {
            eprintln!("error during logging shutdown: {e:?}");
        }

        if let Err(e) = exporters.tracer_provider.shutdown() {
            eprintln!("error during tracing shutdown: {e:?}");
        }
    }
}

pub fn build_logger_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(grpc_endpoint(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

pub fn build_tracer_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(grpc_endpoint(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

pub fn build_meter_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(grpc_endpoint(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn base_attrs(name: &'static str, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name),
            KeyValue::new("service.version", version),
        ])
        .build()
}

/// gRPC export routes by service, not by path, so every signal shares the collector's base URL.
fn grpc_endpoint(collector_url: &str) -> String {
    collector_url.trim_end_matches('/').to_string()
}
