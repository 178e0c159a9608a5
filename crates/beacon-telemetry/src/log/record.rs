//! Log record model and its line encodings.

use std::fmt::{self, Display, Formatter};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use opentelemetry::KeyValue;
use opentelemetry::trace::SpanContext;
use serde_json::Value;

use crate::failure::Failure;
use crate::init::LogFormat;

/// Severity names written to the `level` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Very fine-grained diagnostics.
    Trace,
    /// Diagnostics for developers.
    Debug,
    /// Normal operational messages.
    Info,
    /// Something unexpected that the service recovered from.
    Warning,
    /// A failed operation.
    Error,
    /// A failure the service cannot continue past.
    Critical,
}

impl Level {
    /// Name written to log lines and used as the `log_total` label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// Map a `tracing` level; `critical` escalates errors.
    #[must_use]
    pub fn from_tracing(level: tracing::Level, critical: bool) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warning,
            tracing::Level::ERROR if critical => Self::Critical,
            tracing::Level::ERROR => Self::Error,
        }
    }

    /// Map a `log` facade level.
    #[must_use]
    pub const fn from_log(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Self::Trace,
            log::Level::Debug => Self::Debug,
            log::Level::Info => Self::Info,
            log::Level::Warn => Self::Warning,
            log::Level::Error => Self::Error,
        }
    }
}

impl Display for Level {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Source location a record was emitted from, rendered as `file:line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    file: String,
    line: u32,
}

impl Caller {
    /// Build a caller from a source path; only the file name is kept.
    #[must_use]
    pub fn new(path: &str, line: u32) -> Self {
        let file = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(path);
        Self {
            file: file.to_string(),
            line,
        }
    }
}

impl Display for Caller {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.file, self.line)
    }
}

/// Trace correlation identifiers in fixed-width lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIds {
    /// 32 hex characters.
    pub trace_id: String,
    /// 16 hex characters.
    pub span_id: String,
}

impl TraceIds {
    /// Identifiers of a valid span context, or `None` when the context is invalid.
    #[must_use]
    pub fn from_span_context(span_context: &SpanContext) -> Option<Self> {
        span_context.is_valid().then(|| Self {
            trace_id: format!("{:032x}", span_context.trace_id()),
            span_id: format!("{:016x}", span_context.span_id()),
        })
    }
}

/// One log event, built per call and discarded once written.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Emitting service; filled in by the sink.
    pub service: String,
    /// Emission instant.
    pub time: DateTime<Utc>,
    /// Severity.
    pub level: Level,
    /// Emission site.
    pub caller: Caller,
    /// Rendered message.
    pub message: String,
    /// Additional fields in insertion order.
    pub extra: Vec<(String, Value)>,
    /// Failure attached to the event.
    pub error: Option<Failure>,
    /// Active span identifiers; filled in by the sink.
    pub trace: Option<TraceIds>,
}

impl LogRecord {
    /// Start a record stamped with the current time.
    #[must_use]
    pub fn new(level: Level, caller: Caller, message: impl Into<String>) -> Self {
        Self {
            service: String::new(),
            time: Utc::now(),
            level,
            caller,
            message: message.into(),
            extra: Vec::new(),
            error: None,
            trace: None,
        }
    }

    /// Append an extra field; non-finite floats are stored as strings.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push_field(key, value);
        self
    }

    /// Attach a failure.
    #[must_use]
    pub fn with_error(mut self, failure: Failure) -> Self {
        self.error = Some(failure);
        self
    }

    /// Append an extra field in place.
    pub fn push_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extra.push((key.into(), value.into()));
    }

    /// Ordered key/value pairs: base keys, extras, error keys, trace keys, then `message`.
    ///
    /// A later key that repeats an earlier one replaces its value without moving it; `message`
    /// is always emitted last.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, Value)> {
        let mut fields: Vec<(String, Value)> = vec![
            ("service".to_string(), Value::from(self.service.clone())),
            (
                "time".to_string(),
                Value::from(self.time.to_rfc3339_opts(SecondsFormat::Millis, false)),
            ),
            ("level".to_string(), Value::from(self.level.as_str())),
            ("caller".to_string(), Value::from(self.caller.to_string())),
        ];
        let mut message = Value::from(self.message.clone());

        let mut upsert = |key: &str, value: Value| {
            if key == "message" {
                message = value;
            } else if let Some(slot) = fields.iter_mut().find(|(existing, _)| existing == key) {
                slot.1 = value;
            } else {
                fields.push((key.to_string(), value));
            }
        };

        for (key, value) in &self.extra {
            upsert(key, value.clone());
        }
        if let Some(failure) = &self.error {
            upsert("error_type", Value::from(failure.error_type.clone()));
            upsert("error_message", Value::from(failure.message.clone()));
            upsert("error_traceback", Value::from(failure.traceback.clone()));
        }
        if let Some(trace) = &self.trace {
            upsert("trace_id", Value::from(trace.trace_id.clone()));
            upsert("span_id", Value::from(trace.span_id.clone()));
        }

        fields.push(("message".to_string(), message));
        fields
    }

    /// Encode the record as a single line.
    #[must_use]
    pub fn render(&self, format: LogFormat) -> String {
        let fields = self.fields();
        match format {
            LogFormat::Json => {
                let body: Vec<String> = fields
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "{}:{}",
                            json_fragment(&Value::from(key.as_str())),
                            json_fragment(value)
                        )
                    })
                    .collect();
                format!("{{{}}}", body.join(","))
            }
            LogFormat::Logfmt => fields
                .iter()
                .map(|(key, value)| format!("{key}={}", plain_value(value)))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Record fields as span event attributes.
    #[must_use]
    pub fn span_attributes(&self) -> Vec<KeyValue> {
        self.fields()
            .into_iter()
            .map(|(key, value)| match value {
                Value::Bool(flag) => KeyValue::new(key, flag),
                Value::Number(number) => match (number.as_i64(), number.as_f64()) {
                    (Some(integer), _) => KeyValue::new(key, integer),
                    (None, Some(float)) => KeyValue::new(key, float),
                    (None, None) => KeyValue::new(key, number.to_string()),
                },
                Value::String(text) => KeyValue::new(key, text),
                other => KeyValue::new(key, other.to_string()),
            })
            .collect()
    }
}

/// Convert a float into a JSON value, keeping non-finite values readable.
#[must_use]
pub fn float_value(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or_else(|| Value::from(value.to_string()), Value::Number)
}

fn json_fragment(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("null"))
}

fn plain_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
