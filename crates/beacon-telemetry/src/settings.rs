//! Environment-backed settings shared by every instrumented service.
//!
//! # Design
//! - Reads a flat set of environment variables once at startup.
//! - Parsing is routed through a lookup closure so tests never mutate the process environment.

use crate::init::{DEFAULT_LOG_LEVEL, LogFormat};

/// Default logical service name when `SERVICE` is not provided.
pub const DEFAULT_SERVICE: &str = "flows";
/// Default push-gateway address when `PUSH_GATEWAY` is not provided.
pub const DEFAULT_PUSH_GATEWAY: &str = "http://pushgateway:9091";

/// Telemetry settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Logical service name used for labels, resources, and push-gateway jobs.
    pub service: String,
    /// Push-gateway base URL.
    pub push_gateway: String,
    /// OTLP collector endpoint; `None` disables span export.
    pub otlp_endpoint: Option<String>,
    /// Log line encoding.
    pub log_format: LogFormat,
    /// Default level directive when `RUST_LOG` is unset.
    pub log_level: String,
    /// Whether the HTTP middleware converts application failures into 500 responses.
    pub intercept_exceptions: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            push_gateway: DEFAULT_PUSH_GATEWAY.to_string(),
            otlp_endpoint: None,
            log_format: LogFormat::Json,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            intercept_exceptions: true,
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve settings through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        Self {
            service: non_empty("SERVICE").unwrap_or(defaults.service),
            push_gateway: non_empty("PUSH_GATEWAY").unwrap_or(defaults.push_gateway),
            otlp_endpoint: non_empty("OTEL_EXPORTER_OTLP_ENDPOINT"),
            log_format: non_empty("LOG_FORMAT")
                .map_or(defaults.log_format, |value| LogFormat::parse(&value)),
            log_level: non_empty("RUST_LOG").unwrap_or(defaults.log_level),
            intercept_exceptions: non_empty("INTERCEPT_EXCEPTIONS")
                .map_or(defaults.intercept_exceptions, |value| flag_value(&value)),
        }
    }

    /// Return a copy of these settings bound to another service name.
    #[must_use]
    pub fn for_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }
}

fn flag_value(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let settings = Settings::from_lookup(lookup(&[]));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.service, "flows");
        assert_eq!(settings.push_gateway, "http://pushgateway:9091");
        assert!(settings.otlp_endpoint.is_none());
        assert!(settings.intercept_exceptions);
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("SERVICE", "receiver"),
            ("PUSH_GATEWAY", "http://localhost:9091"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
            ("LOG_FORMAT", "logfmt"),
            ("RUST_LOG", "debug"),
            ("INTERCEPT_EXCEPTIONS", "off"),
        ]));
        assert_eq!(settings.service, "receiver");
        assert_eq!(settings.push_gateway, "http://localhost:9091");
        assert_eq!(
            settings.otlp_endpoint.as_deref(),
            Some("http://collector:4318")
        );
        assert_eq!(settings.log_format, LogFormat::Logfmt);
        assert_eq!(settings.log_level, "debug");
        assert!(!settings.intercept_exceptions);
    }

    #[test]
    fn blank_values_are_ignored() {
        let settings = Settings::from_lookup(lookup(&[
            ("SERVICE", "  "),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", ""),
        ]));
        assert_eq!(settings.service, DEFAULT_SERVICE);
        assert!(settings.otlp_endpoint.is_none());
    }

    #[test]
    fn for_service_rebinds_the_name() {
        let settings = Settings::default().for_service("poller");
        assert_eq!(settings.service, "poller");
    }
}
