//! Prometheus-backed request metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Every request series is keyed by `(service, "METHOD /template")` so label cardinality stays
//!   bounded by the route table.
//! - The registry is process-scoped and handed to each consumer explicitly.

use std::sync::Arc;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Bucket boundaries (seconds) for request durations.
pub const REQUEST_DURATION_BUCKETS: [f64; 24] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5,
    5.0, 5.5, 6.0, 6.5, 7.0, 7.5, 10.0,
];

const ROUTE_LABELS: [&str; 2] = ["service", "function"];

/// Label tuple shared by every request counter and histogram.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteMetricKey {
    /// Service the request was served by.
    pub service: String,
    /// `"<METHOD> <route template>"`, e.g. `GET /items/{id}`.
    pub function: String,
}

impl RouteMetricKey {
    /// Build the key from a method and the matched route template (never the literal path).
    #[must_use]
    pub fn new(service: impl Into<String>, method: &str, template: &str) -> Self {
        Self {
            service: service.into(),
            function: format!("{method} {template}"),
        }
    }

    fn labels(&self) -> [&str; 2] {
        [self.service.as_str(), self.function.as_str()]
    }
}

/// Point-in-time values of the series belonging to one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteSnapshot {
    /// Requests that entered the handler.
    pub invocations: u64,
    /// Requests that produced a response without failing.
    pub responses: u64,
    /// Requests currently in flight.
    pub in_progress: i64,
    /// Duration observations recorded in the histogram.
    pub observations: u64,
}

/// Prometheus-backed metrics registry shared across HTTP services and the log sink.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    service_info: IntGaugeVec,
    invocations: IntCounterVec,
    responses: IntCounterVec,
    invocation_time: HistogramVec,
    exceptions: IntCounterVec,
    in_progress: IntGaugeVec,
    log_total: IntCounterVec,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let service_info = gauge_vec("service", "App Name", &["service"])?;
        let invocations = counter_vec(
            "function_invocations",
            "Counting the number of function invocations",
            &ROUTE_LABELS,
        )?;
        let responses = counter_vec(
            "function_invocation_responses",
            "Counting the number of function invocation responses",
            &ROUTE_LABELS,
        )?;
        let invocation_time = histogram_vec(
            "function_invocation_time",
            "Histogram of function invocation processing time by path (in seconds)",
            &ROUTE_LABELS,
            REQUEST_DURATION_BUCKETS.to_vec(),
        )?;
        let exceptions = counter_vec(
            "base_exceptions",
            "Total count of exceptions raised by function and exception type",
            &["service", "function", "exception_type"],
        )?;
        let in_progress = gauge_vec(
            "function_invocations_in_progress",
            "Gauge of function invocations currently being processed",
            &ROUTE_LABELS,
        )?;
        let log_total = counter_vec(
            "log_total",
            "Total number of log messages",
            &["service", "level"],
        )?;

        register(&registry, "service", &service_info)?;
        register(&registry, "function_invocations", &invocations)?;
        register(&registry, "function_invocation_responses", &responses)?;
        register(&registry, "function_invocation_time", &invocation_time)?;
        register(&registry, "base_exceptions", &exceptions)?;
        register(&registry, "function_invocations_in_progress", &in_progress)?;
        register(&registry, "log_total", &log_total)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                service_info,
                invocations,
                responses,
                invocation_time,
                exceptions,
                in_progress,
                log_total,
            }),
        })
    }

    /// Announce `service` and pre-create its zero-valued exception series.
    pub fn register_service(&self, service: &str) {
        self.inner.service_info.with_label_values(&[service]).inc();
        self.inner
            .exceptions
            .with_label_values(&[service, "", ""])
            .inc_by(0);
    }

    /// Count a request entering its handler.
    pub fn invocation_started(&self, key: &RouteMetricKey) {
        let labels = key.labels();
        self.inner.in_progress.with_label_values(&labels).inc();
        self.inner.invocations.with_label_values(&labels).inc();
    }

    /// Count a successful response and record its duration.
    pub fn invocation_succeeded(&self, key: &RouteMetricKey, elapsed: Duration) {
        let labels = key.labels();
        self.inner.responses.with_label_values(&labels).inc();
        self.inner
            .invocation_time
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    /// Count a failure raised while handling a request.
    pub fn invocation_failed(&self, key: &RouteMetricKey, exception_type: &str) {
        self.inner
            .exceptions
            .with_label_values(&[key.service.as_str(), key.function.as_str(), exception_type])
            .inc();
    }

    /// Release the in-flight slot taken by [`Metrics::invocation_started`].
    pub fn invocation_exited(&self, key: &RouteMetricKey) {
        self.inner.in_progress.with_label_values(&key.labels()).dec();
    }

    /// Count one emitted log record.
    pub fn inc_log(&self, service: &str, level: &str) {
        self.inner
            .log_total
            .with_label_values(&[service, level])
            .inc();
    }

    /// Read the current values for one route.
    #[must_use]
    pub fn route_snapshot(&self, key: &RouteMetricKey) -> RouteSnapshot {
        let labels = key.labels();
        RouteSnapshot {
            invocations: self.inner.invocations.with_label_values(&labels).get(),
            responses: self.inner.responses.with_label_values(&labels).get(),
            in_progress: self.inner.in_progress.with_label_values(&labels).get(),
            observations: self
                .inner
                .invocation_time
                .with_label_values(&labels)
                .get_sample_count(),
        }
    }

    /// Read the exception counter for one route and exception type.
    #[must_use]
    pub fn exception_count(&self, key: &RouteMetricKey, exception_type: &str) -> u64 {
        self.inner
            .exceptions
            .with_label_values(&[key.service.as_str(), key.function.as_str(), exception_type])
            .get()
    }

    /// Read the log counter for a service and level.
    #[must_use]
    pub fn log_count(&self, service: &str, level: &str) -> u64 {
        self.inner
            .log_total
            .with_label_values(&[service, level])
            .get()
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        encode_text(&self.inner.registry.gather())
    }
}

pub(crate) fn counter_vec(
    name: &'static str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

pub(crate) fn gauge_vec(name: &'static str, help: &str, labels: &[&str]) -> Result<IntGaugeVec> {
    IntGaugeVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

pub(crate) fn histogram_vec(
    name: &'static str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> Result<HistogramVec> {
    HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

pub(crate) fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}

pub(crate) fn encode_text(families: &[prometheus::proto::MetricFamily]) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(families, &mut buffer)
        .map_err(|source| TelemetryError::MetricsEncode { source })?;
    String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn route_keys_use_the_template() {
        let key = RouteMetricKey::new("receiver", "GET", "/items/{id}");
        assert_eq!(key.function, "GET /items/{id}");
        assert_eq!(key.service, "receiver");
    }

    #[test]
    fn request_lifecycle_updates_route_series() -> std::result::Result<(), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        let key = RouteMetricKey::new("receiver", "GET", "/");

        metrics.invocation_started(&key);
        assert_eq!(metrics.route_snapshot(&key).in_progress, 1);
        metrics.invocation_succeeded(&key, Duration::from_millis(12));
        metrics.invocation_exited(&key);

        metrics.invocation_started(&key);
        metrics.invocation_failed(&key, "ValueError");
        metrics.invocation_exited(&key);

        let snapshot = metrics.route_snapshot(&key);
        assert_eq!(
            snapshot,
            RouteSnapshot {
                invocations: 2,
                responses: 1,
                in_progress: 0,
                observations: 1,
            }
        );
        assert_eq!(metrics.exception_count(&key, "ValueError"), 1);
        Ok(())
    }

    #[test]
    fn render_exposes_registered_series() -> std::result::Result<(), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        metrics.register_service("receiver");
        metrics.inc_log("receiver", "INFO");
        metrics.invocation_started(&RouteMetricKey::new("receiver", "GET", "/"));

        let rendered = metrics.render()?;
        assert!(rendered.contains("service{service=\"receiver\"} 1"));
        assert!(rendered.contains(
            "base_exceptions{exception_type=\"\",function=\"\",service=\"receiver\"} 0"
        ));
        assert!(rendered.contains("log_total{level=\"INFO\",service=\"receiver\"} 1"));
        assert!(rendered.contains("function_invocations{function=\"GET /\",service=\"receiver\"} 1"));
        assert_eq!(metrics.log_count("receiver", "INFO"), 1);
        Ok(())
    }
}
