//! # Design
//!
//! - Centralize application-level errors for bootstrap and the demo services.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::io;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: beacon_telemetry::TelemetryError,
    },
    /// HTTP client operations failed.
    #[error("http operation failed")]
    Http {
        /// Operation identifier.
        operation: &'static str,
        /// URL used for the request.
        url: String,
        /// Source HTTP client error.
        source: reqwest::Error,
    },
    /// HTTP response returned a non-success status.
    #[error("http response status error")]
    HttpStatus {
        /// Operation identifier.
        operation: &'static str,
        /// URL used for the request.
        url: String,
        /// HTTP status code returned by the server.
        status: u16,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Source IO error.
        source: io::Error,
    },
    /// A background task could not be joined.
    #[error("background task failed")]
    Join {
        /// Operation identifier.
        operation: &'static str,
        /// Source join error.
        source: tokio::task::JoinError,
    },
}

impl AppError {
    pub(crate) const fn telemetry(
        operation: &'static str,
        source: beacon_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn http(operation: &'static str, url: String, source: reqwest::Error) -> Self {
        Self::Http {
            operation,
            url,
            source,
        }
    }

    pub(crate) const fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }

    pub(crate) const fn join(operation: &'static str, source: tokio::task::JoinError) -> Self {
        Self::Join { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn app_error_helpers_build_variants() {
        let io_err = AppError::io("http.bind", io::Error::other("address in use"));
        assert!(matches!(
            io_err,
            AppError::Io {
                operation: "http.bind",
                ..
            }
        ));
        assert_eq!(io_err.to_string(), "io operation failed");
        assert!(io_err.source().is_some());

        let status = AppError::HttpStatus {
            operation: "poller.fetch",
            url: "http://receiver:8000/slow".to_string(),
            status: 404,
        };
        assert_eq!(status.to_string(), "http response status error");
        assert!(status.source().is_none());
    }

    #[tokio::test]
    async fn join_errors_keep_their_source() {
        let handle = tokio::spawn(async { std::future::pending::<()>().await });
        handle.abort();
        let Err(source) = handle.await else {
            panic!("aborted task should not complete");
        };
        let err = AppError::join("poller.join", source);
        assert!(matches!(err, AppError::Join { .. }));
        assert!(err.source().is_some());
    }
}
