//! `tracing` layer that turns events into structured log records.

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use super::record::{Caller, Level, LogRecord, float_value};
use super::sink::LogSink;
use crate::failure::Failure;

/// Event field holding the message.
const MESSAGE_FIELD: &str = "message";
/// Boolean field escalating an error event to `CRITICAL`.
const CRITICAL_FIELD: &str = "critical";
/// Field whose `&dyn Error` value fills the error keys.
const ERROR_FIELD: &str = "error";

/// Layer forwarding every enabled event to the structured sink.
#[derive(Debug, Clone)]
pub struct StructuredLogLayer {
    sink: Arc<LogSink>,
}

impl StructuredLogLayer {
    /// Forward events to `sink`.
    #[must_use]
    pub const fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for StructuredLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let level = Level::from_tracing(*metadata.level(), visitor.critical);
        let caller = Caller::new(
            metadata.file().unwrap_or_else(|| metadata.target()),
            metadata.line().unwrap_or_default(),
        );
        let mut record = LogRecord::new(level, caller, visitor.message);
        record.extra = visitor.extra;
        record.error = visitor.error.resolve();

        // No return channel from a layer; a failed write drops the line.
        let _ = self.sink.emit(record);
    }
}

#[derive(Default)]
struct ErrorFields {
    source: Option<Failure>,
    error_type: Option<String>,
    error_message: Option<String>,
    error_traceback: Option<String>,
}

impl ErrorFields {
    fn resolve(self) -> Option<Failure> {
        let explicit =
            self.error_type.is_some() || self.error_message.is_some() || self.error_traceback.is_some();
        if self.source.is_none() && !explicit {
            return None;
        }
        let base = self.source.unwrap_or_else(|| Failure::new("Error", "", ""));
        Some(Failure::new(
            self.error_type.unwrap_or(base.error_type),
            self.error_message.unwrap_or(base.message),
            self.error_traceback.unwrap_or(base.traceback),
        ))
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    critical: bool,
    extra: Vec<(String, Value)>,
    error: ErrorFields,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: Value) {
        self.extra.push((field.name().to_string(), value));
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, float_value(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == CRITICAL_FIELD {
            self.critical = value;
        } else {
            self.push(field, Value::from(value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            MESSAGE_FIELD => self.message = value.to_string(),
            "error_type" => self.error.error_type = Some(value.to_string()),
            "error_message" => self.error.error_message = Some(value.to_string()),
            "error_traceback" => self.error.error_traceback = Some(value.to_string()),
            _ => self.push(field, Value::from(value)),
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        if field.name() == ERROR_FIELD {
            self.error.source = Some(Failure::from_dyn(value));
        } else {
            self.push(field, Value::from(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        let rendered = format!("{value:?}");
        match field.name() {
            MESSAGE_FIELD => self.message = rendered,
            "error_type" => self.error.error_type = Some(rendered),
            "error_message" => self.error.error_message = Some(rendered),
            "error_traceback" => self.error.error_traceback = Some(rendered),
            _ => self.push(field, Value::from(rendered)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::LogFormat;
    use crate::log::test_support::SharedBuffer;
    use crate::metrics::Metrics;
    use std::fmt;
    use tracing_subscriber::layer::SubscriberExt as _;

    #[derive(Debug)]
    struct ValueError;

    impl fmt::Display for ValueError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl Error for ValueError {}

    fn capture(run: impl FnOnce()) -> Result<(Vec<Value>, Metrics), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        let buffer = SharedBuffer::default();
        let sink = Arc::new(LogSink::new(
            "flows",
            LogFormat::Json,
            buffer.clone(),
            metrics.clone(),
        ));
        let subscriber = tracing_subscriber::registry().with(StructuredLogLayer::new(sink));
        tracing::subscriber::with_default(subscriber, run);
        Ok((buffer.json_lines()?, metrics))
    }

    #[test]
    fn events_become_ordered_records() -> Result<(), Box<dyn Error>> {
        let (lines, metrics) = capture(|| {
            tracing::info!(value = 42, source = "poller", "received value");
        })?;
        let line = lines.first().ok_or("no line written")?;
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["value"], 42);
        assert_eq!(line["source"], "poller");
        assert_eq!(line["message"], "received value");
        assert!(
            line["caller"]
                .as_str()
                .is_some_and(|caller| caller.starts_with("layer.rs:"))
        );
        assert_eq!(metrics.log_count("flows", "INFO"), 1);
        Ok(())
    }

    #[test]
    fn error_fields_fill_the_error_keys() -> Result<(), Box<dyn Error>> {
        let (lines, _) = capture(|| {
            let err = ValueError;
            tracing::error!(error = &err as &(dyn Error + 'static), "task failed");
            tracing::error!(
                error_type = "KeyError",
                error_message = "missing",
                error_traceback = "trace",
                "explicit"
            );
        })?;
        assert_eq!(lines[0]["error_type"], "ValueError");
        assert_eq!(lines[0]["error_message"], "boom");
        assert_eq!(lines[1]["error_type"], "KeyError");
        assert_eq!(lines[1]["error_message"], "missing");
        assert_eq!(lines[1]["error_traceback"], "trace");
        Ok(())
    }

    #[test]
    fn critical_flag_escalates_errors() -> Result<(), Box<dyn Error>> {
        let (lines, metrics) = capture(|| {
            tracing::error!(critical = true, "cannot continue");
        })?;
        assert_eq!(lines[0]["level"], "CRITICAL");
        assert!(lines[0].get("critical").is_none());
        assert_eq!(metrics.log_count("flows", "CRITICAL"), 1);
        Ok(())
    }

    #[test]
    fn non_finite_floats_are_serializable() -> Result<(), Box<dyn Error>> {
        let (lines, _) = capture(|| {
            tracing::warn!(ratio = f64::INFINITY, "odd ratio");
        })?;
        assert_eq!(lines[0]["ratio"], "inf");
        assert_eq!(lines[0]["level"], "WARNING");
        Ok(())
    }
}
