//! Logging, trace propagation and runner metrics

use opentelemetry::Context;
use opentelemetry::baggage::BaggageExt;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Registry};

use crate::broker::Properties;

/// Dependencies kept one level quieter than our own logs
const NOISY_TARGETS: &[&str] = &[
    "object_store",
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
];

static PROPAGATOR: LazyLock<TextMapCompositePropagator> = LazyLock::new(propagator);

fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Flushes pending spans when dropped. Keep it alive for the process lifetime.
pub struct TelemetryGuard {
    provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.force_flush() {
            eprintln!("OTEL trace flush error: {e:?}");
        }
    }
}

fn level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

/// Filter directives used when `RUST_LOG` is not set
pub fn default_directives(verbosity: u8) -> String {
    let mut directives = vec![level(verbosity).to_string()];
    if verbosity <= 3 {
        let quieter = level(verbosity.saturating_sub(1));
        directives.extend(NOISY_TARGETS.iter().map(|t| format!("{t}={quieter}")));
    }
    directives.join(",")
}

/// Structured output is forced inside Kubernetes or when exporting traces
fn json_requested(json: bool) -> bool {
    json || std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
        || std::env::var_os("OTEL_SERVICE_NAME").is_some()
}

/// Install the global subscriber and the trace-context propagator.
///
/// Verbosity maps 0..=3 to error, warn, info, debug. `RUST_LOG` overrides it.
pub fn init_logging(
    service_name: &str,
    verbosity: u8,
    json: bool,
) -> Result<TelemetryGuard, TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(verbosity))
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };

    let provider = SdkTracerProvider::builder().build();
    let tracer = provider.tracer(service_name.to_string());
    opentelemetry::global::set_tracer_provider(provider.clone());
    opentelemetry::global::set_text_map_propagator(propagator());

    let json = json_requested(json);
    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let plain_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    Registry::default()
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(json_layer)
        .with(plain_layer)
        .with(filter)
        .try_init()?;

    Ok(TelemetryGuard { provider })
}

pub fn log_component_version(component: &str, version: &str) {
    tracing::info!(component, version, "Starting");
}

/// Trace context carried in message properties
pub fn extract_context(properties: &Properties) -> Context {
    PROPAGATOR.extract(properties)
}

pub fn inject_context(cx: &Context, properties: &mut Properties) {
    PROPAGATOR.inject_context(cx, properties);
}

/// Upstream baggage as sorted `key=value` pairs, for recording on a span so
/// that every log line inside it carries the pipeline context
pub fn baggage_summary(cx: &Context) -> Option<String> {
    let mut entries: Vec<String> = cx
        .baggage()
        .iter()
        .map(|(key, (value, _))| format!("{}={}", key.as_str(), value))
        .collect();
    if entries.is_empty() {
        return None;
    }
    entries.sort();
    Some(entries.join(","))
}

/// Copy upstream baggage onto a span declared with an empty `baggage` field:
/// each entry becomes a trace attribute, and the summary a log field
pub fn attach_baggage(span: &tracing::Span, cx: &Context) {
    for (key, (value, _)) in cx.baggage().iter() {
        span.set_attribute(key.clone(), value.clone());
    }
    if let Some(summary) = baggage_summary(cx) {
        span.record("baggage", summary.as_str());
    }
}

/// Propagate the context of the current span into outgoing properties
pub fn inject_current_context(properties: &mut Properties) {
    inject_context(&tracing::Span::current().context(), properties);
}

/// Message outcome counters for a runner
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    acknowledged: AtomicU64,
    negatively_acknowledged: AtomicU64,
    permanent_failures: AtomicU64,
    takeovers: AtomicU64,
}

impl RunnerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "acknowledged", "Metric incremented");
    }

    pub fn message_negatively_acknowledged(&self) {
        self.negatively_acknowledged.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "negatively_acknowledged", "Metric incremented");
    }

    pub fn permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "permanent_failures", "Metric incremented");
    }

    pub fn takeover(&self) {
        self.takeovers.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "takeovers", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            negatively_acknowledged: self.negatively_acknowledged.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            takeovers: self.takeovers.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub acknowledged: u64,
    pub negatively_acknowledged: u64,
    pub permanent_failures: u64,
    pub takeovers: u64,
}
