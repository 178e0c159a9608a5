//! Tracer construction, span export filtering, and span outcome helpers.
//!
//! # Design
//! - One tracer provider per logical service name, built lazily and memoised behind a mutex.
//! - Export is opt-in: without a collector endpoint spans are still created (and valid for log
//!   correlation) but never leave the process.
//! - Internal HTTP framing spans are dropped before they reach the exporter.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use opentelemetry::trace::{
    SpanBuilder, SpanKind, SpanRef, Status, TraceContextExt as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{
    BatchSpanProcessor, SdkTracer, SdkTracerProvider, Span, SpanData, SpanProcessor,
};
use tracing::warn;

use crate::failure::Failure;

/// Span attribute carrying the ASGI-style framing marker.
const FRAMING_ATTRIBUTE: &str = "type";
/// Framing markers whose internal spans are never exported.
const FRAMING_SPAN_TYPES: [&str; 3] = [
    "http.request",
    "http.response.start",
    "http.response.body",
];

/// Span processor that drops internal HTTP framing spans and forwards everything else.
#[derive(Debug)]
pub struct HttpFramingFilter<P> {
    inner: P,
}

impl<P> HttpFramingFilter<P> {
    /// Wrap the processor that receives the surviving spans.
    #[must_use]
    pub const fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: SpanProcessor> SpanProcessor for HttpFramingFilter<P> {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        self.inner.on_start(span, cx);
    }

    fn on_end(&self, span: SpanData) {
        if is_framing_span(&span) {
            return;
        }
        self.inner.on_end(span);
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.inner.shutdown_with_timeout(timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.inner.set_resource(resource);
    }
}

fn is_framing_span(span: &SpanData) -> bool {
    span.span_kind == SpanKind::Internal
        && span.attributes.iter().any(|attribute| {
            attribute.key.as_str() == FRAMING_ATTRIBUTE
                && FRAMING_SPAN_TYPES
                    .iter()
                    .any(|kind| attribute.value.as_str() == *kind)
        })
}

enum SpanExport {
    Disabled,
    Otlp(String),
    #[cfg(test)]
    Capture(opentelemetry_sdk::trace::InMemorySpanExporter),
}

#[derive(Clone)]
struct ServiceTracer {
    provider: SdkTracerProvider,
    tracer: SdkTracer,
}

struct RegistryInner {
    export: SpanExport,
    services: Mutex<HashMap<String, ServiceTracer>>,
}

/// Process-wide cache of tracers keyed by service name.
#[derive(Clone)]
pub struct TracerRegistry {
    inner: Arc<RegistryInner>,
}

impl Debug for TracerRegistry {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        let export = match &self.inner.export {
            SpanExport::Disabled => "disabled",
            SpanExport::Otlp(_) => "otlp",
            #[cfg(test)]
            SpanExport::Capture(_) => "capture",
        };
        formatter
            .debug_struct("TracerRegistry")
            .field("export", &export)
            .finish_non_exhaustive()
    }
}

impl TracerRegistry {
    /// Build a registry that exports to `otlp_endpoint` when one is configured.
    #[must_use]
    pub fn new(otlp_endpoint: Option<String>) -> Self {
        let export = otlp_endpoint.map_or(SpanExport::Disabled, SpanExport::Otlp);
        Self::with_export(export)
    }

    /// Build a registry whose spans stay in-process.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_export(SpanExport::Disabled)
    }

    #[cfg(test)]
    pub(crate) fn capturing(exporter: opentelemetry_sdk::trace::InMemorySpanExporter) -> Self {
        Self::with_export(SpanExport::Capture(exporter))
    }

    fn with_export(export: SpanExport) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                export,
                services: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve the tracer for `service`, building its provider on first use.
    #[must_use]
    pub fn tracer(&self, service: &str) -> SdkTracer {
        let mut services = self
            .inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = services.get(service) {
            return existing.tracer.clone();
        }
        let provider = self.build_provider(service);
        let tracer = provider.tracer(service.to_string());
        services.insert(
            service.to_string(),
            ServiceTracer {
                provider,
                tracer: tracer.clone(),
            },
        );
        tracer
    }

    /// Flush every provider so batched spans reach the exporter.
    pub fn force_flush(&self) {
        for (service, provider) in self.providers() {
            if let Err(err) = provider.force_flush() {
                warn!(service = %service, error = %err, "failed to flush spans");
            }
        }
    }

    /// Flush and shut down every provider built so far.
    pub fn shutdown(&self) {
        let drained: Vec<(String, ServiceTracer)> = self
            .inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (service, entry) in drained {
            if let Err(err) = entry.provider.shutdown() {
                warn!(service = %service, error = %err, "failed to shut down tracer provider");
            }
        }
    }

    fn providers(&self) -> Vec<(String, SdkTracerProvider)> {
        self.inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(service, entry)| (service.clone(), entry.provider.clone()))
            .collect()
    }

    fn build_provider(&self, service: &str) -> SdkTracerProvider {
        let resource = Resource::builder()
            .with_attribute(KeyValue::new("service.name", service.to_string()))
            .build();
        let builder = SdkTracerProvider::builder().with_resource(resource);
        match &self.inner.export {
            SpanExport::Disabled => builder.build(),
            SpanExport::Otlp(endpoint) => match otlp_processor(endpoint) {
                Some(processor) => builder.with_span_processor(processor).build(),
                None => builder.build(),
            },
            #[cfg(test)]
            SpanExport::Capture(exporter) => builder
                .with_span_processor(HttpFramingFilter::new(
                    BatchSpanProcessor::builder(exporter.clone()).build(),
                ))
                .build(),
        }
    }
}

#[cfg(feature = "otlp")]
fn otlp_processor(endpoint: &str) -> Option<HttpFramingFilter<BatchSpanProcessor>> {
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};

    let traces_endpoint = traces_endpoint(endpoint);
    match SpanExporter::builder()
        .with_http()
        .with_endpoint(traces_endpoint.clone())
        .build()
    {
        Ok(exporter) => Some(HttpFramingFilter::new(
            BatchSpanProcessor::builder(exporter).build(),
        )),
        Err(source) => {
            let err = crate::error::TelemetryError::ExporterBuild {
                endpoint: traces_endpoint,
                source,
            };
            warn!(error = %err, "span export disabled");
            None
        }
    }
}

#[cfg(not(feature = "otlp"))]
fn otlp_processor(endpoint: &str) -> Option<HttpFramingFilter<BatchSpanProcessor>> {
    warn!(
        endpoint = %endpoint,
        "collector endpoint configured but `beacon-telemetry` was built without the `otlp` feature; spans stay in-process"
    );
    None
}

/// Resolve the signal-specific OTLP/HTTP path for a collector base URL.
#[cfg_attr(not(feature = "otlp"), allow(dead_code))]
fn traces_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with("/v1/traces") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1/traces")
    }
}

/// Start a server-kind span as a child of `parent` and return the context carrying it.
#[must_use]
pub fn start_server_span(tracer: &SdkTracer, name: String, parent: &Context) -> Context {
    let span = SpanBuilder::from_name(name)
        .with_kind(SpanKind::Server)
        .start_with_context(tracer, parent);
    parent.with_span(span)
}

/// Final status assigned once to an instrumented unit of work or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanOutcome {
    /// The unit completed normally.
    Ok,
    /// The unit failed; carries the status description.
    Error(String),
}

impl SpanOutcome {
    /// Outcome for a failure, described as `"<type>: <message>"`.
    #[must_use]
    pub fn failure(failure: &Failure) -> Self {
        Self::Error(failure.describe())
    }

    /// Set the span status matching this outcome.
    pub fn apply(&self, span: &SpanRef<'_>) {
        match self {
            Self::Ok => span.set_status(Status::Ok),
            Self::Error(description) => span.set_status(Status::error(description.clone())),
        }
    }
}

/// Record `failure` as an `exception` event on `span`.
pub fn record_exception(span: &SpanRef<'_>, failure: &Failure) {
    span.add_event(
        "exception",
        vec![
            KeyValue::new("exception.type", failure.error_type.clone()),
            KeyValue::new("exception.message", failure.message.clone()),
            KeyValue::new("exception.stacktrace", failure.traceback.clone()),
        ],
    );
}

/// Record `failure` on `span` and mark the span as failed.
pub fn fail_span(span: &SpanRef<'_>, failure: &Failure) {
    record_exception(span, failure);
    SpanOutcome::failure(failure).apply(span);
}
