//! Structured log sink: correlation, counting, and line output.

use std::fmt::{self, Debug, Formatter};
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use opentelemetry::Context;
use opentelemetry::trace::TraceContextExt as _;

use super::record::{LogRecord, TraceIds};
use crate::init::LogFormat;
use crate::metrics::Metrics;

/// Name of the span event carrying a copy of each record.
pub const LOG_EVENT_NAME: &str = "log";

/// Writes one line per record to the configured stream.
pub struct LogSink {
    service: String,
    format: LogFormat,
    writer: Mutex<Box<dyn Write + Send>>,
    metrics: Metrics,
    span_events: bool,
}

impl Debug for LogSink {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LogSink")
            .field("service", &self.service)
            .field("format", &self.format)
            .field("span_events", &self.span_events)
            .finish_non_exhaustive()
    }
}

impl LogSink {
    /// Build a sink writing to `writer`.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        format: LogFormat,
        writer: impl Write + Send + 'static,
        metrics: Metrics,
    ) -> Self {
        Self {
            service: service.into(),
            format,
            writer: Mutex::new(Box::new(writer)),
            metrics,
            span_events: true,
        }
    }

    /// Build a sink writing to standard error.
    #[must_use]
    pub fn stderr(service: impl Into<String>, format: LogFormat, metrics: Metrics) -> Self {
        Self::new(service, format, io::stderr(), metrics)
    }

    /// Toggle copying each record onto the active span as an event.
    #[must_use]
    pub const fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Service name stamped on every record.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Encoding used for output lines.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }

    /// Count, correlate, and write one record.
    ///
    /// # Errors
    ///
    /// Returns the writer's error when the line cannot be written.
    pub fn emit(&self, mut record: LogRecord) -> io::Result<()> {
        record.service.clone_from(&self.service);
        self.metrics.inc_log(&self.service, record.level.as_str());

        let cx = Context::current();
        let span = cx.span();
        record.trace = TraceIds::from_span_context(span.span_context());

        let line = record.render(self.format);
        if record.trace.is_some() && self.span_events {
            span.add_event_with_timestamp(
                LOG_EVENT_NAME,
                SystemTime::from(record.time),
                record.span_attributes(),
            );
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Flush the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns the writer's flush error.
    pub fn flush(&self) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Failure;
    use crate::log::record::{Caller, Level};
    use crate::log::test_support::SharedBuffer;
    use crate::trace::{TracerRegistry, start_server_span};
    use opentelemetry_sdk::trace::InMemorySpanExporter;
    use serde_json::Value;
    use std::error::Error;

    fn sink(buffer: &SharedBuffer, metrics: &Metrics) -> LogSink {
        LogSink::new("receiver", LogFormat::Json, buffer.clone(), metrics.clone())
    }

    #[test]
    fn records_without_span_have_no_trace_ids() -> Result<(), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        let buffer = SharedBuffer::default();
        let sink = sink(&buffer, &metrics);

        sink.emit(LogRecord::new(Level::Info, Caller::new("main.rs", 3), "ready"))?;

        let lines = buffer.json_lines()?;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["service"], "receiver");
        assert!(lines[0].get("trace_id").is_none());
        assert!(lines[0].get("span_id").is_none());
        assert_eq!(metrics.log_count("receiver", "INFO"), 1);
        Ok(())
    }

    #[test]
    fn records_inside_span_are_correlated() -> Result<(), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        let buffer = SharedBuffer::default();
        let sink = sink(&buffer, &metrics);
        let exporter = InMemorySpanExporter::default();
        let registry = TracerRegistry::capturing(exporter.clone());
        let tracer = registry.tracer("receiver");
        let cx = start_server_span(&tracer, "GET /".to_string(), &Context::new());

        {
            let _attached = cx.clone().attach();
            let record = LogRecord::new(Level::Error, Caller::new("main.rs", 9), "failed")
                .with_field("value", 3)
                .with_error(Failure::new("ValueError", "boom", ""));
            sink.emit(record)?;
        }
        cx.span().end();
        registry.force_flush();

        let lines = buffer.json_lines()?;
        let line = &lines[0];
        let span_context = cx.span().span_context().clone();
        assert_eq!(
            line["trace_id"],
            Value::from(format!("{:032x}", span_context.trace_id()))
        );
        assert_eq!(
            line["span_id"],
            Value::from(format!("{:016x}", span_context.span_id()))
        );
        assert_eq!(line["trace_id"].as_str().map(str::len), Some(32));
        assert_eq!(line["span_id"].as_str().map(str::len), Some(16));
        assert_eq!(line["error_type"], "ValueError");

        let spans = exporter.get_finished_spans()?;
        let span = spans.first().ok_or("span not exported")?;
        assert!(span.events.iter().any(|event| event.name == LOG_EVENT_NAME));
        Ok(())
    }

    #[test]
    fn span_events_can_be_disabled() -> Result<(), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        let buffer = SharedBuffer::default();
        let sink = sink(&buffer, &metrics).with_span_events(false);
        let exporter = InMemorySpanExporter::default();
        let registry = TracerRegistry::capturing(exporter.clone());
        let cx = start_server_span(&registry.tracer("receiver"), "GET /".to_string(), &Context::new());

        {
            let _attached = cx.clone().attach();
            sink.emit(LogRecord::new(Level::Info, Caller::new("main.rs", 1), "quiet"))?;
        }
        cx.span().end();
        registry.force_flush();

        let spans = exporter.get_finished_spans()?;
        let span = spans.first().ok_or("span not exported")?;
        assert!(span.events.iter().all(|event| event.name != LOG_EVENT_NAME));
        assert!(buffer.json_lines()?[0].get("trace_id").is_some());
        Ok(())
    }

    #[test]
    fn logfmt_lines_end_with_message() -> Result<(), Box<dyn Error>> {
        let metrics = Metrics::new()?;
        let buffer = SharedBuffer::default();
        let sink = LogSink::new("flows", LogFormat::Logfmt, buffer.clone(), metrics);
        sink.emit(LogRecord::new(Level::Warning, Caller::new("a.rs", 2), "slow"))?;
        let text = buffer.contents();
        assert!(text.starts_with("service=flows "));
        assert!(text.trim_end().ends_with("level=WARNING caller=a.rs:2 message=slow"));
        Ok(())
    }
}
