//! Bridge from the `log` facade into the structured sink.
//!
//! Dependencies such as `reqwest` and `hyper` log through `log`; their records are re-emitted
//! with the call-site the facade recorded, so the caller key names the real emission site.

use std::fmt;
use std::sync::Arc;

use log::{LevelFilter, Log, Metadata, Record};

use super::record::{Caller, Level, LogRecord};
use super::sink::LogSink;

/// Extra key carrying the `log` target of bridged records.
const TARGET_FIELD: &str = "logger";

/// `log::Log` implementation feeding [`LogSink`].
#[derive(Debug, Clone)]
pub struct NativeLogBridge {
    sink: Arc<LogSink>,
    max_level: LevelFilter,
}

impl NativeLogBridge {
    /// Forward records up to `max_level` to `sink`.
    #[must_use]
    pub const fn new(sink: Arc<LogSink>, max_level: LevelFilter) -> Self {
        Self { sink, max_level }
    }

    fn translate(record: &Record<'_>) -> LogRecord {
        let caller = Caller::new(
            record.file().unwrap_or_else(|| record.target()),
            record.line().unwrap_or_default(),
        );
        let mut message = String::new();
        let translated = match fmt::write(&mut message, *record.args()) {
            Ok(()) => LogRecord::new(Level::from_log(record.level()), caller, message),
            Err(err) => LogRecord::new(
                Level::Warning,
                caller,
                format!(
                    "could not format native log message from {}: {message:?} ({err})",
                    record.target()
                ),
            ),
        };
        translated.with_field(TARGET_FIELD, record.target())
    }
}

impl Log for NativeLogBridge {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = self.sink.emit(Self::translate(record));
    }

    fn flush(&self) {
        let _ = self.sink.flush();
    }
}
