//! Telemetry logic.
//! Support tracing, metrics and logging.
use axum::extract::{MatchedPath, Request};
use axum::http::Version;
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics::{Unit, gauge};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle,
};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::time::sleep;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::filter_fn;

use std::time::{Duration, Instant};

use crate::error::ServerError;

const DEFAULT_FILTER: &str = "info,vouch=debug";

/// Collector address. Exporters stay off when unset.
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

fn ressources() -> Resource {
    Resource::builder().with_service_name("vouch").build()
}

/// OTLP span and log providers.
pub struct Otlp {
    tracer: SdkTracerProvider,
    logger: SdkLoggerProvider,
}

impl Otlp {
    /// Flush pending spans and logs.
    pub fn shutdown(&self) {
        if let Err(err) = self.tracer.shutdown() {
            tracing::warn!(%err, "cannot flush OTLP spans");
        }
        if let Err(err) = self.logger.shutdown() {
            tracing::warn!(%err, "cannot flush OTLP logs");
        }
    }
}

/// Create OTLP exporters for spans and logs sent to `endpoint`.
///
/// The tracer provider becomes the global one used by [`track`].
pub fn setup_otlp(endpoint: &str) -> Result<Otlp, ServerError> {
    let spans = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error)?;
    let logs = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error)?;

    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(ressources())
        .build();
    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(ressources())
        .build();
    global::set_tracer_provider(tracer.clone());

    Ok(Otlp { tracer, logger })
}

fn exporter_error(err: impl std::fmt::Display) -> ServerError {
    ServerError::Config(format!("cannot build OTLP exporter: {err}"))
}

/// Install global subscriber, filtered by `RUST_LOG`.
///
/// The plugin binary passes `std::io::stderr` since stdout carries the
/// protocol. Logs are also exported over OTLP when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn setup_tracing<W>(writer: W) -> Option<Otlp>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let endpoint = std::env::var(OTLP_ENDPOINT_ENV)
        .ok()
        .filter(|endpoint| !endpoint.is_empty());
    let otlp = endpoint.as_deref().map(setup_otlp);

    let bridge = match &otlp {
        Some(Ok(otlp)) => {
            let targets = filter_fn(|metadata| exported(metadata.target()));
            Some(
                OpenTelemetryTracingBridge::new(&otlp.logger)
                    .with_filter(targets),
            )
        },
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .with(bridge)
        .init();

    match otlp {
        Some(Ok(otlp)) => {
            tracing::info!(
                endpoint = endpoint.as_deref().unwrap_or_default(),
                "OTLP export enabled"
            );
            Some(otlp)
        },
        Some(Err(err)) => {
            tracing::warn!(%err, "OTLP export disabled");
            None
        },
        None => None,
    }
}

/// Events sent over OTLP. Exporter internals stay local.
fn exported(target: &str) -> bool {
    !["opentelemetry", "tonic", "h2", "hyper"]
        .iter()
        .any(|prefix| target.starts_with(prefix))
}

/// Create recorder for Prometheus metrics.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    metrics::describe_gauge!(
        "process_cpu_usage",
        Unit::Percent,
        "CPU usage of the process in percentage."
    );
    metrics::describe_gauge!(
        "process_memory_used_bytes",
        Unit::Bytes,
        "Total process memory in bytes."
    );
    metrics::describe_counter!(
        "tokens_issued_total",
        Unit::Count,
        "Access and refresh tokens signed."
    );

    let mut system = System::new_with_specifics(RefreshKind::nothing());
    let pid = Pid::from_u32(std::process::id());

    // Wait 10 seconds between updates.
    tokio::spawn(async move {
        loop {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory().with_cpu(),
            );

            if let Some(process) = system.process(pid) {
                gauge!("process_memory_used_bytes").set(process.memory() as f64);
                gauge!("process_cpu_usage").set(process.cpu_usage() as f64);
            }

            sleep(Duration::from_secs(10)).await;
        }
    });

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .install_recorder()
}

/// Record request counter, latency and span of every route.
pub async fn track(req: Request, next: Next) -> impl IntoResponse {
    // No-op unless an OTLP provider is installed.
    let tracer = global::tracer("vouch-http");
    let mut otel_span = tracer.start("http-request");

    let start = Instant::now();
    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();
    let version = match req.version() {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "UNKNOWN",
    };

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    otel_span.set_attribute(KeyValue::new("version", version));
    otel_span.set_attribute(KeyValue::new("path", path.clone()));
    otel_span.set_attribute(KeyValue::new("method", method.to_string()));
    otel_span.set_attribute(KeyValue::new("status", status.clone()));
    otel_span.end();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
        ("version", version.to_owned()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(latency);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exported_targets() {
        assert!(exported("vouch::token"));
        assert!(exported("tower_http::trace::on_response"));
        assert!(!exported("opentelemetry_sdk::logs"));
        assert!(!exported("h2::codec"));
        assert!(!exported("hyper_util::client"));
    }

    #[tokio::test]
    async fn test_invalid_otlp_endpoint() {
        assert!(matches!(
            setup_otlp("not a uri"),
            Err(ServerError::Config(_))
        ));
    }
}
