//! Trace-context propagation helpers for inbound requests, outbound calls, and async work.
//!
//! # Design
//! - Uses the W3C `traceparent`/`tracestate` headers only.
//! - Keeps the OpenTelemetry context attached across suspension points by re-attaching it on
//!   every poll, so the active span follows a request through its handler.

use std::future::Future;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator as _};
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Read-only view of request headers for trace-context extraction.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// Mutable view of outbound headers for trace-context injection.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            return;
        };
        let Ok(value) = HeaderValue::from_str(&value) else {
            return;
        };
        self.0.insert(name, value);
    }
}

/// Extract the caller's trace context from inbound headers.
///
/// Without a valid `traceparent` header the returned context carries no span, so spans started
/// from it become new roots.
#[must_use]
pub fn extract_parent(headers: &HeaderMap) -> Context {
    TraceContextPropagator::new().extract_with_context(&Context::new(), &HeaderExtractor(headers))
}

/// Inject the current trace context into outbound headers.
pub fn inject_current(headers: &mut HeaderMap) {
    TraceContextPropagator::new().inject_context(&Context::current(), &mut HeaderInjector(headers));
}

/// Drive `fut` with `cx` attached as the current context on every poll.
pub fn in_context<F>(cx: Context, fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let mut fut = Box::pin(fut);
    std::future::poll_fn(move |task| {
        let _attached = cx.clone().attach();
        fut.as_mut().poll(task)
    })
}
