//! HTTP metrics middleware with trace propagation and failure interception.
//!
//! # Design
//! - Attached to each method router through [`HttpMetricsLayer::instrument`], so only requests
//!   that matched both a path and one of its methods are measured. The 405 fallback of a method
//!   router and unrouted paths are never wrapped, which keeps the label set bounded by the route
//!   table even when clients send arbitrary extension methods.
//! - A request reaching the service without a `MatchedPath` passes through untouched.
//! - Handlers classify failures explicitly through [`HandlerError`]; the rendered response
//!   carries a [`FailureReport`] extension the middleware reads back.
//! - Panics inside handlers are unhandled application failures of type `panic`.

use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use axum::{Json, Router};
use futures_util::FutureExt as _;
use opentelemetry::Context;
use opentelemetry::trace::TraceContextExt as _;
use opentelemetry_sdk::trace::SdkTracer;
use serde_json::json;
use tower::{Layer, Service};
use tracing::error;

use crate::context::{extract_parent, in_context};
use crate::failure::{Failure, short_type_name};
use crate::metrics::{Metrics, RouteMetricKey};
use crate::trace::{SpanOutcome, TracerRegistry, fail_span, start_server_span};

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Failure returned by an HTTP handler, classified at the boundary.
#[derive(Debug)]
pub enum HandlerError {
    /// The failure already carries the status the client should see.
    Protocol {
        /// Client-facing status.
        status: StatusCode,
        /// Client-facing detail.
        detail: String,
    },
    /// An unhandled application failure.
    Application(Failure),
}

impl HandlerError {
    /// A failure that maps to `status` for the client.
    #[must_use]
    pub fn protocol(status: StatusCode, detail: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            detail: detail.into(),
        }
    }

    /// Status this failure renders with when it is not intercepted.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Protocol { status, .. } => *status,
            Self::Application(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn report(&self) -> FailureReport {
        match self {
            Self::Protocol { status, detail } => FailureReport {
                kind: FailureKind::Protocol,
                failure: Failure::new(
                    short_type_name::<Self>(),
                    protocol_message(*status, detail),
                    "",
                ),
            },
            Self::Application(failure) => FailureReport {
                kind: FailureKind::Application,
                failure: failure.clone(),
            },
        }
    }
}

impl Display for HandlerError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { status, detail } => {
                formatter.write_str(&protocol_message(*status, detail))
            }
            Self::Application(failure) => formatter.write_str(&failure.describe()),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: Error + 'static,
{
    fn from(err: E) -> Self {
        Self::Application(Failure::from_error(&err).with_backtrace(&Backtrace::force_capture()))
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let report = self.report();
        let mut response = match self {
            Self::Protocol { status, detail } => {
                (status, Json(json!({ "detail": detail }))).into_response()
            }
            Self::Application(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        };
        response.extensions_mut().insert(report);
        response
    }
}

fn protocol_message(status: StatusCode, detail: &str) -> String {
    format!("{}: {detail}", status.as_u16())
}

/// Whether a reported failure already carries its client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Passes through unchanged.
    Protocol,
    /// Eligible for interception.
    Application,
}

/// Response extension describing the failure a handler returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Classification of the failure.
    pub kind: FailureKind,
    /// Labels recorded on the span, counters, and logs.
    pub failure: Failure,
}

/// Wraps routed HTTP services to record request metrics and spans per route template.
#[derive(Clone)]
pub struct HttpMetricsLayer {
    service: String,
    metrics: Metrics,
    tracer: SdkTracer,
    intercept_exceptions: bool,
}

impl HttpMetricsLayer {
    /// Construct the layer for `service`; the service is announced on the registry.
    #[must_use]
    pub fn new(service: impl Into<String>, metrics: Metrics, tracers: &TracerRegistry) -> Self {
        let service = service.into();
        metrics.register_service(&service);
        let tracer = tracers.tracer(&service);
        Self {
            service,
            metrics,
            tracer,
            intercept_exceptions: true,
        }
    }

    /// Wrap the method endpoints of `method_router`, leaving its 405 fallback unmeasured.
    ///
    /// `Router::route_layer` would also wrap that fallback, so a known path hit with an
    /// unsupported method would be counted under `"<METHOD> <template>"`.
    #[must_use]
    pub fn instrument<S>(&self, method_router: MethodRouter<S>) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        method_router.route_layer(self.clone())
    }

    /// Choose whether application failures are converted into a JSON 500 response.
    #[must_use]
    pub const fn intercept_exceptions(mut self, intercept: bool) -> Self {
        self.intercept_exceptions = intercept;
        self
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`HttpMetricsLayer`].
#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
    layer: HttpMetricsLayer,
}

impl<S, B> Service<Request<B>> for HttpMetricsService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let Some(template) = req
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
        else {
            return Box::pin(self.inner.call(req));
        };

        let key = RouteMetricKey::new(
            self.layer.service.as_str(),
            req.method().as_str(),
            &template,
        );
        let parent = extract_parent(req.headers());
        let cx = start_server_span(&self.layer.tracer, key.function.clone(), &parent);
        let metrics = self.layer.metrics.clone();
        let intercept = self.layer.intercept_exceptions;
        let fut = in_context(cx.clone(), self.inner.call(req));

        Box::pin(async move {
            let in_flight = InFlight::enter(&metrics, &key);
            let started = Instant::now();
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;

            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    cx.span().end();
                    return Err(err);
                }
                Err(payload) => {
                    let failure = Failure::from_panic(payload.as_ref())
                        .with_backtrace(&Backtrace::force_capture());
                    record_failure(&cx, &metrics, &key, &failure);
                    if intercept {
                        log_intercepted(&cx, &key, &failure);
                        cx.span().end();
                        return Ok(internal_error_response(&failure));
                    }
                    cx.span().end();
                    drop(in_flight);
                    std::panic::resume_unwind(payload);
                }
            };

            let response = match response.extensions().get::<FailureReport>().cloned() {
                None => {
                    SpanOutcome::Ok.apply(&cx.span());
                    metrics.invocation_succeeded(&key, started.elapsed());
                    response
                }
                Some(report) => {
                    record_failure(&cx, &metrics, &key, &report.failure);
                    if intercept && report.kind == FailureKind::Application {
                        log_intercepted(&cx, &key, &report.failure);
                        internal_error_response(&report.failure)
                    } else {
                        response
                    }
                }
            };
            cx.span().end();
            drop(in_flight);
            Ok(response)
        })
    }
}

/// In-flight slot for one request; released on drop so every exit path decrements.
struct InFlight {
    metrics: Metrics,
    key: RouteMetricKey,
}

impl InFlight {
    fn enter(metrics: &Metrics, key: &RouteMetricKey) -> Self {
        metrics.invocation_started(key);
        Self {
            metrics: metrics.clone(),
            key: key.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.metrics.invocation_exited(&self.key);
    }
}

fn record_failure(cx: &Context, metrics: &Metrics, key: &RouteMetricKey, failure: &Failure) {
    fail_span(&cx.span(), failure);
    metrics.invocation_failed(key, &failure.error_type);
}

fn log_intercepted(cx: &Context, key: &RouteMetricKey, failure: &Failure) {
    let _attached = cx.clone().attach();
    error!(
        function = %key.function,
        error_type = %failure.error_type,
        error_message = %failure.message,
        error_traceback = %failure.traceback,
        "Exception in {}: {}",
        key.function,
        failure.message
    );
}

fn internal_error_response(failure: &Failure) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": failure.message })),
    )
        .into_response()
}

/// Router exposing `GET /metrics` for the given registry.
pub fn metrics_router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
