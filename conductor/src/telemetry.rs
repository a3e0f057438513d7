//! Logging and tracing setup.
//!
//! [`Telemetry`] installs the global `tracing` subscriber: console output
//! filtered by `RUST_LOG` (or a fallback level), plus OTLP trace and metric
//! export when the `telemetry` feature is enabled and `OTEL_EXPORTER_OTLP_*`
//! variables are set. [`http_tracing`] builds the request-span layer used by
//! [`HttpServer`](crate::http::HttpServer).

use std::time::Duration;

use axum::http::{Request, Response};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultOnRequest, MakeSpan, OnResponse, TraceLayer};
use tracing::Span;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "telemetry")]
use otlp::OtlpProtocol;

/// Service identity and log level for the process-wide subscriber.
///
/// With the `telemetry` feature, values can be overridden via
/// `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION` and `OTEL_SERVICE_DEPLOYMENT`.
#[derive(Debug, Default)]
pub struct Telemetry {
    name: Option<String>,
    version: Option<String>,
    log_level: Option<String>,
}

impl Telemetry {
    /// Creates a new, empty [`Telemetry`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the service name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the service version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the log level filter used when `RUST_LOG` is not set.
    ///
    /// Accepts any valid [`EnvFilter`] directive string (e.g. `"debug"`,
    /// `"conductor=debug,tower_http=info"`).
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Installs the global subscriber.
    ///
    /// Returns a [`TelemetryGuard`] that flushes exporters on drop.
    pub fn register(self) -> TelemetryGuard {
        let fallback = self.log_level.as_deref().unwrap_or("info");
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into());

        #[cfg(feature = "telemetry")]
        {
            let protocol = otlp::detect_protocol();
            let (tracer_provider, meter_provider) = protocol.map_or_else(
                || (None, None),
                |p| (self.init_tracer(p), self.init_meter(p)),
            );

            let otel_layer = tracer_provider.as_ref().map(|tp| {
                use opentelemetry::trace::TracerProvider;
                tracing_opentelemetry::OpenTelemetryLayer::new(tp.tracer("conductor"))
            });
            let metrics_layer = meter_provider
                .as_ref()
                .map(|mp| tracing_opentelemetry::MetricsLayer::new(mp.clone()));

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(metrics_layer)
                .with(otel_layer)
                .init();

            if protocol.is_some() {
                tracing::info!("OpenTelemetry exporters registered");
            } else {
                tracing::debug!("OpenTelemetry is not configured, console logging only");
            }

            TelemetryGuard {
                tracer_provider,
                meter_provider,
            }
        }

        #[cfg(not(feature = "telemetry"))]
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            TelemetryGuard {}
        }
    }

    #[cfg(feature = "telemetry")]
    fn resource(&self) -> opentelemetry_sdk::Resource {
        use opentelemetry::KeyValue;
        use opentelemetry_semantic_conventions::SCHEMA_URL;
        use opentelemetry_semantic_conventions::attribute::{
            DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION,
        };

        let name = otlp::resolve_env("OTEL_SERVICE_NAME", self.name.as_deref());
        let version = otlp::resolve_env("OTEL_SERVICE_VERSION", self.version.as_deref());
        let deployment = otlp::resolve_env("OTEL_SERVICE_DEPLOYMENT", None);

        let mut builder = opentelemetry_sdk::Resource::builder();
        if let Some(name) = name {
            builder = builder.with_service_name(name);
        }
        let mut attributes = Vec::<KeyValue>::with_capacity(2);
        if let Some(version) = version {
            attributes.push(KeyValue::new(SERVICE_VERSION, version));
        }
        if let Some(deployment) = deployment {
            attributes.push(KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment));
        }
        if !attributes.is_empty() {
            builder = builder.with_schema_url(attributes, SCHEMA_URL);
        }
        builder.build()
    }

    #[cfg(feature = "telemetry")]
    fn init_tracer(
        &self,
        protocol: OtlpProtocol,
    ) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
        use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};

        let exporter = match protocol {
            OtlpProtocol::Http => opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .build(),
            OtlpProtocol::Grpc => opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .build(),
        };
        let exporter = exporter
            .inspect_err(|err| tracing::warn!(%err, "failed to build OTLP span exporter"))
            .ok()?;

        Some(
            SdkTracerProvider::builder()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    1.0,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(self.resource())
                .with_batch_exporter(exporter)
                .build(),
        )
    }

    #[cfg(feature = "telemetry")]
    fn init_meter(
        &self,
        protocol: OtlpProtocol,
    ) -> Option<opentelemetry_sdk::metrics::SdkMeterProvider> {
        use opentelemetry_sdk::metrics::{MeterProviderBuilder, PeriodicReader, Temporality};

        let exporter = match protocol {
            OtlpProtocol::Http => opentelemetry_otlp::MetricExporter::builder()
                .with_http()
                .with_temporality(Temporality::default())
                .build(),
            OtlpProtocol::Grpc => opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_temporality(Temporality::default())
                .build(),
        };
        let exporter = exporter
            .inspect_err(|err| tracing::warn!(%err, "failed to build OTLP metric exporter"))
            .ok()?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(30))
            .build();
        let stdout_reader =
            PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default()).build();

        let provider = MeterProviderBuilder::default()
            .with_resource(self.resource())
            .with_reader(reader)
            .with_reader(stdout_reader)
            .build();
        opentelemetry::global::set_meter_provider(provider.clone());
        Some(provider)
    }
}

#[cfg(feature = "telemetry")]
mod otlp {
    use std::env;

    /// Supported OTLP transport protocols.
    #[derive(Debug, Clone, Copy)]
    pub(super) enum OtlpProtocol {
        Http,
        Grpc,
    }

    /// Detects the OTLP protocol. Returns `None` if OTEL is not configured.
    pub(super) fn detect_protocol() -> Option<OtlpProtocol> {
        let is_enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        is_enabled.then(|| {
            env::var("OTEL_EXPORTER_OTLP_PROTOCOL")
                .ok()
                .map_or(OtlpProtocol::Http, |s| match s.as_str() {
                    "grpc" => OtlpProtocol::Grpc,
                    _ => OtlpProtocol::Http,
                })
        })
    }

    /// Resolves an env var with a programmatic fallback.
    pub(super) fn resolve_env(key: &str, fallback: Option<&str>) -> Option<String> {
        env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| fallback.map(str::to_owned))
    }
}

/// Owns the exporter providers; performs graceful shutdown on drop.
#[derive(Debug)]
pub struct TelemetryGuard {
    #[cfg(feature = "telemetry")]
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
    #[cfg(feature = "telemetry")]
    meter_provider: Option<opentelemetry_sdk::metrics::SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "telemetry")]
        {
            if let Some(ref tp) = self.tracer_provider
                && let Err(err) = tp.shutdown()
            {
                tracing::error!(?err, "tracer provider shutdown error");
            }
            if let Some(ref mp) = self.meter_provider
                && let Err(err) = mp.shutdown()
            {
                tracing::error!(?err, "meter provider shutdown error");
            }
        }
    }
}

/// Request tracing layer applied to every [`HttpServer`](crate::http::HttpServer).
#[must_use]
pub fn http_tracing() -> TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    HttpMakeSpan,
    DefaultOnRequest,
    HttpOnResponse,
> {
    TraceLayer::new_for_http()
        .make_span_with(HttpMakeSpan)
        .on_response(HttpOnResponse)
}

/// Span maker for HTTP requests.
#[derive(Clone, Copy, Debug)]
pub struct HttpMakeSpan;

impl<A> MakeSpan<A> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<A>) -> Span {
        tracing::info_span!(
            "http_request",
            otel.kind = "server",
            otel.name = %format!("{} {}", request.method(), request.uri().path()),
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
            status = tracing::field::Empty,
        )
    }
}

/// Response handler recording status and latency on the request span.
#[derive(Clone, Copy, Debug)]
pub struct HttpOnResponse;

impl<A> OnResponse<A> for HttpOnResponse {
    fn on_response(self, response: &Response<A>, latency: Duration, span: &Span) {
        span.record("status", response.status().as_u16());

        #[cfg(feature = "telemetry")]
        {
            use opentelemetry::trace::Status;
            use tracing_opentelemetry::OpenTelemetrySpanExt;

            if response.status().is_server_error() {
                span.set_status(Status::error(
                    response
                        .status()
                        .canonical_reason()
                        .unwrap_or("unknown")
                        .to_owned(),
                ));
            } else {
                span.set_status(Status::Ok);
            }
        }

        tracing::debug!(
            "status={} elapsed={}ms",
            response.status().as_u16(),
            latency.as_millis()
        );
    }
}
