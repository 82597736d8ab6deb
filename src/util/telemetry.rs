//! Log subscriber setup.
//!
//! Logs always go to stdout through `tracing_subscriber::fmt`, filtered by `RUST_LOG`
//! (default `info`). With the `telemetry` feature and any `OTEL_EXPORTER_OTLP_*` variable set,
//! spans and metrics are also exported over OTLP.

#[cfg(feature = "telemetry")]
use std::env;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, HttpMakeClassifier, TraceLayer};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(feature = "telemetry")]
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
#[cfg(feature = "telemetry")]
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
#[cfg(feature = "telemetry")]
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
#[cfg(feature = "telemetry")]
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// OTLP transport.
#[cfg(feature = "telemetry")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelemetryProtocol {
    Http,
    Grpc,
}

#[cfg(feature = "telemetry")]
impl TelemetryProtocol {
    /// `None` unless at least one OTLP exporter variable is present.
    fn from_env() -> Option<Self> {
        let is_enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        if !is_enabled {
            return None;
        }
        match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => Some(TelemetryProtocol::Grpc),
            _ => Some(TelemetryProtocol::Http),
        }
    }
}

#[cfg(feature = "telemetry")]
#[derive(Debug, thiserror::Error)]
enum ExporterError {
    #[error("failed to build OTLP span exporter: {0}")]
    Span(#[source] opentelemetry_otlp::ExporterBuildError),
    #[error("failed to build OTLP metric exporter: {0}")]
    Metric(#[source] opentelemetry_otlp::ExporterBuildError),
}

/// Subscriber builder. Providers, if any, are flushed on drop.
pub struct Telemetry {
    name: &'static str,
    version: &'static str,
    #[cfg(feature = "telemetry")]
    tracer_provider: Option<SdkTracerProvider>,
    #[cfg(feature = "telemetry")]
    meter_provider: Option<SdkMeterProvider>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            #[cfg(feature = "telemetry")]
            tracer_provider: None,
            #[cfg(feature = "telemetry")]
            meter_provider: None,
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    /// Installs the global subscriber. A second call in the same process is a no-op.
    pub fn register(self) -> Self {
        #[cfg(feature = "telemetry")]
        if let Some(protocol) = TelemetryProtocol::from_env() {
            return self.register_otel(protocol);
        }
        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!(service = self.name, version = self.version, "Logging initialized");
        }
        self
    }

    /// Per-request spans for the HTTP stack, logged at INFO.
    pub fn http_tracing(&self) -> TraceLayer<HttpMakeClassifier> {
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO))
    }

    #[cfg(feature = "telemetry")]
    fn resource(&self) -> Resource {
        let environment = env::var("APIX_ENV").unwrap_or_else(|_| "development".to_string());
        Resource::builder()
            .with_service_name(self.name)
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, self.version),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, environment),
                ],
                SCHEMA_URL,
            )
            .build()
    }

    #[cfg(feature = "telemetry")]
    fn tracer_provider(&self, protocol: TelemetryProtocol) -> Result<SdkTracerProvider, ExporterError> {
        let exporter = opentelemetry_otlp::SpanExporter::builder();
        let exporter = match protocol {
            TelemetryProtocol::Http => exporter.with_http().build(),
            TelemetryProtocol::Grpc => exporter.with_tonic().build(),
        }
        .map_err(ExporterError::Span)?;
        Ok(SdkTracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(1.0))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.resource())
            .with_batch_exporter(exporter)
            .build())
    }

    #[cfg(feature = "telemetry")]
    fn meter_provider(&self, protocol: TelemetryProtocol) -> Result<SdkMeterProvider, ExporterError> {
        let exporter = opentelemetry_otlp::MetricExporter::builder();
        let exporter = match protocol {
            TelemetryProtocol::Http => exporter
                .with_http()
                .with_temporality(opentelemetry_sdk::metrics::Temporality::default())
                .build(),
            TelemetryProtocol::Grpc => exporter
                .with_tonic()
                .with_temporality(opentelemetry_sdk::metrics::Temporality::default())
                .build(),
        }
        .map_err(ExporterError::Metric)?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(30))
            .build();
        let meter_provider = MeterProviderBuilder::default()
            .with_resource(self.resource())
            .with_reader(reader)
            .build();
        global::set_meter_provider(meter_provider.clone());
        Ok(meter_provider)
    }

    #[cfg(feature = "telemetry")]
    fn register_otel(mut self, protocol: TelemetryProtocol) -> Self {
        let providers = self
            .tracer_provider(protocol)
            .and_then(|tracer| Ok((tracer, self.meter_provider(protocol)?)));
        let (tracer_provider, meter_provider) = match providers {
            Ok(providers) => providers,
            Err(error) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer())
                    .try_init();
                tracing::warn!(%error, "OpenTelemetry export disabled");
                return self;
            }
        };
        let tracer = tracer_provider.tracer(self.name);
        // The exporter's own network stack must not re-enter the OpenTelemetry layer, so the
        // filter applies to every layer.
        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .with(MetricsLayer::new(meter_provider.clone()))
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()
            .is_ok();
        if installed {
            tracing::info!(?protocol, "OpenTelemetry tracing and metrics exporter is enabled");
            self.tracer_provider = Some(tracer_provider);
            self.meter_provider = Some(meter_provider);
        }
        self
    }
}

#[cfg(feature = "telemetry")]
impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.take() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.take() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}
