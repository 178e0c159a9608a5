//! Error types for telemetry operations.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use prometheus::Error as PrometheusError;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised by telemetry helpers.
#[derive(Debug)]
pub enum TelemetryError {
    /// Installing the tracing subscriber failed.
    SubscriberInstall {
        /// Underlying tracing dispatcher error.
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    /// Installing the `log` facade bridge failed.
    LoggerInstall {
        /// Underlying `log` error.
        source: log::SetLoggerError,
    },
    /// Building a Prometheus collector failed.
    MetricsCollector {
        /// Metric identifier tied to the failure.
        name: &'static str,
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// Registering a Prometheus collector failed.
    MetricsRegister {
        /// Metric identifier tied to the failure.
        name: &'static str,
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// Encoding Prometheus metrics failed.
    MetricsEncode {
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// Rendered metrics output was not valid UTF-8.
    MetricsUtf8 {
        /// Underlying UTF-8 conversion error.
        source: std::string::FromUtf8Error,
    },
    /// Pushing a registry to the push-gateway failed.
    MetricsPush {
        /// Job name the push was tagged with.
        job: String,
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// Building the span exporter failed.
    #[cfg(feature = "otlp")]
    ExporterBuild {
        /// Collector endpoint the exporter targeted.
        endpoint: String,
        /// Underlying exporter error.
        source: opentelemetry_otlp::ExporterBuildError,
    },
}

impl Display for TelemetryError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriberInstall { .. } => {
                formatter.write_str("failed to install tracing subscriber")
            }
            Self::LoggerInstall { .. } => formatter.write_str("failed to install log bridge"),
            Self::MetricsCollector { .. } => {
                formatter.write_str("failed to build metrics collector")
            }
            Self::MetricsRegister { .. } => {
                formatter.write_str("failed to register metrics collector")
            }
            Self::MetricsEncode { .. } => formatter.write_str("failed to encode metrics"),
            Self::MetricsUtf8 { .. } => formatter.write_str("metrics output was not valid utf-8"),
            Self::MetricsPush { .. } => formatter.write_str("failed to push metrics to gateway"),
            #[cfg(feature = "otlp")]
            Self::ExporterBuild { .. } => formatter.write_str("failed to build span exporter"),
        }
    }
}

impl Error for TelemetryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SubscriberInstall { source } => Some(source),
            Self::LoggerInstall { source } => Some(source),
            Self::MetricsCollector { source, .. }
            | Self::MetricsRegister { source, .. }
            | Self::MetricsEncode { source }
            | Self::MetricsPush { source, .. } => Some(source),
            Self::MetricsUtf8 { source } => Some(source),
            #[cfg(feature = "otlp")]
            Self::ExporterBuild { source, .. } => Some(source),
        }
    }
}
