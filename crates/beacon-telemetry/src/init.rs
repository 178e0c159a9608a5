//! Telemetry initialisation primitives and logging configuration.
//!
//! # Design
//! - Centralises logging setup (JSON or logfmt) behind a single entry point.
//! - Installs the structured layer for `tracing` events and the bridge for `log` records so
//!   both reach the same sink.

use std::sync::Arc;

use log::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _};

use crate::error::{Result, TelemetryError};
use crate::log::{LogSink, NativeLogBridge, StructuredLogLayer};
use crate::metrics::Metrics;
use crate::settings::Settings;

/// Default logging target when `RUST_LOG` is not provided.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Available output formats for the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One compact JSON object per line.
    Json,
    /// Space-joined `key=value` pairs.
    Logfmt,
}

impl LogFormat {
    /// Parse a configured format name; unknown names fall back to JSON.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "logfmt" | "text" | "kv" => Self::Logfmt,
            _ => Self::Json,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig<'a> {
    /// Service name stamped on every record.
    pub service: &'a str,
    /// Log level directive (e.g., `info`, `debug`) used when `RUST_LOG` is unset.
    pub level: &'a str,
    /// Output format selection.
    pub format: LogFormat,
    /// Whether records are copied onto the active span as events.
    pub span_events: bool,
}

impl<'a> LoggingConfig<'a> {
    /// Derive the logging configuration from resolved settings.
    #[must_use]
    pub fn from_settings(settings: &'a Settings) -> Self {
        Self {
            service: &settings.service,
            level: &settings.log_level,
            format: settings.log_format,
            span_events: true,
        }
    }
}

/// Configure and install the global tracing subscriber and the `log` bridge.
///
/// Returns the shared sink so callers can flush it on shutdown.
///
/// # Errors
///
/// Returns an error if the tracing subscriber or the `log` bridge cannot be installed (for
/// example, because another one has already been set globally).
pub fn init_logging(config: &LoggingConfig<'_>, metrics: &Metrics) -> Result<Arc<LogSink>> {
    let sink = Arc::new(
        LogSink::stderr(config.service, config.format, metrics.clone())
            .with_span_events(config.span_events),
    );

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(config.level))
        .with(StructuredLogLayer::new(Arc::clone(&sink)));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|source| TelemetryError::SubscriberInstall { source })?;

    let max_level = bridge_level(config.level);
    log::set_boxed_logger(Box::new(NativeLogBridge::new(Arc::clone(&sink), max_level)))
        .map_err(|source| TelemetryError::LoggerInstall { source })?;
    log::set_max_level(max_level);

    Ok(sink)
}

fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn bridge_level(level: &str) -> LevelFilter {
    level
        .split(',')
        .find(|directive| !directive.contains('='))
        .and_then(|directive| directive.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn log_format_parse_falls_back_to_json() {
        assert_eq!(LogFormat::parse("logfmt"), LogFormat::Logfmt);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Json);
    }

    #[test]
    fn bridge_level_uses_the_global_directive() {
        assert_eq!(bridge_level("debug"), LevelFilter::Debug);
        assert_eq!(bridge_level("hyper=warn,trace"), LevelFilter::Trace);
        assert_eq!(bridge_level("hyper=warn"), LevelFilter::Info);
        assert_eq!(bridge_level("nonsense"), LevelFilter::Info);
    }

    #[test]
    fn config_follows_settings() {
        let settings = Settings::default().for_service("receiver");
        let config = LoggingConfig::from_settings(&settings);
        assert_eq!(config.service, "receiver");
        assert_eq!(config.level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn init_logging_installs_subscriber_once() -> std::result::Result<(), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        let settings = Settings::default();
        let config = LoggingConfig::from_settings(&settings);
        // The `log` slot may already be taken by another test in this binary.
        let _ = init_logging(&config, &metrics);
        let second = init_logging(&config, &metrics);
        assert!(matches!(
            second,
            Err(TelemetryError::SubscriberInstall { .. })
        ));
        Ok(())
    }
}
