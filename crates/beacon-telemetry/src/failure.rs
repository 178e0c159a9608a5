//! Failure descriptions shared by the log sink, the HTTP middleware, and the work wrappers.
//!
//! # Design
//! - A failure is reduced to `(type, message, traceback)` once, at the boundary where it is
//!   observed, so spans, counters, and log records all agree on the same labels.
//! - Type names come from the static error type when it is known and fall back to the
//!   `Debug` rendering for trait objects.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error;
use std::fmt::Write as _;

/// Type label used for panics caught at an instrumentation boundary.
pub const PANIC_TYPE: &str = "panic";

/// A failure reduced to the fields every telemetry sink records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Short type name (e.g. `ValueError`).
    pub error_type: String,
    /// Display rendering of the failure.
    pub message: String,
    /// Formatted cause chain and, when captured, the backtrace.
    pub traceback: String,
}

impl Failure {
    /// Assemble a failure from its parts.
    #[must_use]
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }

    /// Describe a concrete error; the type label is the error's own type name.
    #[must_use]
    pub fn from_error<E>(err: &E) -> Self
    where
        E: Error + 'static,
    {
        Self::new(short_type_name::<E>(), err.to_string(), cause_chain(err))
    }

    /// Describe a type-erased error; the type label is recovered from its `Debug` output.
    #[must_use]
    pub fn from_dyn(err: &(dyn Error + 'static)) -> Self {
        Self::new(debug_type_name(err), err.to_string(), cause_chain(err))
    }

    /// Describe a panic payload caught with `catch_unwind`.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(PANIC_TYPE, panic_message(payload), String::new())
    }

    /// Append a captured backtrace to the traceback, if the runtime recorded one.
    #[must_use]
    pub fn with_backtrace(mut self, backtrace: &Backtrace) -> Self {
        if backtrace.status() == BacktraceStatus::Captured {
            if !self.traceback.is_empty() {
                self.traceback.push('\n');
            }
            let _ = write!(self.traceback, "{backtrace}");
        }
        self
    }

    /// Render the `"<type>: <message>"` description used for span statuses.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{}: {}", self.error_type, self.message)
    }
}

/// Last path segment of a type name with generic arguments removed.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Render the `source()` chain of an error, one cause per line.
#[must_use]
pub fn cause_chain(err: &(dyn Error + 'static)) -> String {
    let mut rendered = String::new();
    let mut current = err.source();
    while let Some(cause) = current {
        if !rendered.is_empty() {
            rendered.push('\n');
        }
        let _ = write!(rendered, "caused by: {cause}");
        current = cause.source();
    }
    rendered
}

/// Extract the human-readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&'static str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}

fn debug_type_name(err: &(dyn Error + 'static)) -> String {
    let debug = format!("{err:?}");
    let ident: String = debug
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .collect();
    if ident.chars().next().is_some_and(|ch| ch.is_ascii_uppercase()) {
        ident
    } else {
        "Error".to_string()
    }
}
