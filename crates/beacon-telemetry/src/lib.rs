//! Telemetry primitives shared by every Beacon service.
//!
//! This crate centralises structured logging, HTTP request metrics, span propagation, and
//! task/flow lifecycle instrumentation so the receiver, poller, and flow runner emit the same
//! signals.
//!
//! Layout: `log/` (records, sink, `tracing` layer, `log` bridge), `http.rs` (request
//! middleware), `work.rs` (task/flow wrappers), `lifecycle.rs` + `push.rs` (push-gateway
//! partitions), `trace.rs` + `context.rs` (span plumbing).

pub mod context;
pub mod error;
pub mod failure;
pub mod http;
pub mod init;
pub mod lifecycle;
pub mod log;
pub mod metrics;
pub mod push;
pub mod settings;
pub mod trace;
pub mod work;

pub use context::{extract_parent, in_context, inject_current};
pub use error::{Result, TelemetryError};
pub use failure::Failure;
pub use http::{
    FailureKind, FailureReport, HandlerError, HttpMetricsLayer, HttpMetricsService,
    PROMETHEUS_CONTENT_TYPE, metrics_router,
};
pub use init::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, init_logging};
pub use lifecycle::{Checkpoint, CompletionTracking, UnitKind, UnitSnapshot, WorkMetrics};
pub use self::log::{Level, LogRecord, LogSink};
pub use metrics::{Metrics, RouteMetricKey, RouteSnapshot};
pub use push::{MetricsGateway, PushGateway};
pub use settings::Settings;
pub use trace::{SpanOutcome, TracerRegistry};
pub use work::{
    Flow, FlowFinalizer, FlowHooks, FlowOptions, FlowRun, Instrumentation, RunState, StateHook,
    StateType, Task, TaskOptions,
};
