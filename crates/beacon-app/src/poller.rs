//! Poller service: periodically fetches a random number from the receiver.
//!
//! # Design
//! - The poll loop runs as a background task next to the status endpoint and stops
//!   cooperatively through a watch channel once the HTTP server has drained.
//! - Every poll opens its own root span and propagates it to the receiver.

use std::error::Error;
use std::future::Future;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use beacon_telemetry::trace::SpanOutcome;
use beacon_telemetry::{TracerRegistry, in_context, inject_current, metrics_router};
use opentelemetry::Context;
use opentelemetry::trace::{SpanKind, TraceContextExt as _, Tracer as _};
use opentelemetry_sdk::trace::SdkTracer;
use rand::Rng as _;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::bootstrap::{Telemetry, serve_http};
use crate::cli::PollerArgs;
use crate::error::{AppError, AppResult};
use crate::receiver::RandomNumber;

/// Span opened around each poll.
pub const POLL_SPAN_NAME: &str = "polling_for_random_number";
/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Share of polls sent to the receiver's unrouted `/slow` path.
pub const SLOW_PATH_PROBABILITY: f64 = 0.2;

/// Background client polling the receiver.
#[derive(Debug, Clone)]
pub struct Poller {
    client: reqwest::Client,
    endpoint: String,
    interval: Duration,
    tracer: SdkTracer,
}

impl Poller {
    /// Build a poller for `endpoint` tracing under `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        endpoint: impl Into<String>,
        interval: Duration,
        tracers: &TracerRegistry,
        service: &str,
    ) -> AppResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::http("poller.client", endpoint.clone(), err))?;
        Ok(Self {
            client,
            endpoint,
            interval,
            tracer: tracers.tracer(service),
        })
    }

    /// Start the poll loop; it exits once `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Polling {} for new random numbers.", self.endpoint);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Poller stopped");
    }

    /// Poll once, choosing the slow path at random.
    pub async fn poll_once(&self) -> Option<u32> {
        let slow = rand::rng().random_bool(SLOW_PATH_PROBABILITY);
        self.poll(slow).await
    }

    /// Poll once under a fresh root span; failures are logged and yield `None`.
    pub async fn poll(&self, slow: bool) -> Option<u32> {
        let span = self
            .tracer
            .span_builder(POLL_SPAN_NAME)
            .with_kind(SpanKind::Internal)
            .start(&self.tracer);
        let cx = Context::new().with_span(span);
        let url = self.target(slow);

        let value = in_context(cx.clone(), async {
            match self.fetch(&url).await {
                Ok(number) => {
                    info!("Received random number: {}", number.value);
                    Some(number.value)
                }
                Err(err) => {
                    error!(
                        error = &err as &(dyn Error + 'static),
                        url = %url,
                        "Failed to fetch random number"
                    );
                    None
                }
            }
        })
        .await;

        let outcome = if value.is_some() {
            SpanOutcome::Ok
        } else {
            SpanOutcome::Error(format!("request to {url} failed"))
        };
        outcome.apply(&cx.span());
        cx.span().end();
        value
    }

    fn target(&self, slow: bool) -> String {
        if slow {
            format!("{}/slow", self.endpoint)
        } else {
            self.endpoint.clone()
        }
    }

    async fn fetch(&self, url: &str) -> AppResult<RandomNumber> {
        let mut headers = HeaderMap::new();
        inject_current(&mut headers);
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|err| AppError::http("poller.fetch", url.to_string(), err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                operation: "poller.fetch",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .json::<RandomNumber>()
            .await
            .map_err(|err| AppError::http("poller.decode", url.to_string(), err))
    }
}

/// Status endpoint plus metrics, instrumented per route template.
pub fn router(telemetry: &Telemetry) -> Router {
    let layer = telemetry.http_layer();
    Router::new()
        .route("/", layer.instrument(get(status)))
        .merge(metrics_router(telemetry.metrics.clone()))
}

/// Run the poll loop and the status endpoint until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the client or listener cannot be set up, or the poll loop panicked.
pub async fn serve<F>(telemetry: &Telemetry, args: &PollerArgs, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let poller = Poller::new(
        args.endpoint.clone(),
        args.interval(),
        &telemetry.tracers,
        &telemetry.settings.service,
    )?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = poller.spawn(stop_rx);

    let served = serve_http(router(telemetry), args.listen, shutdown).await;

    let _ = stop_tx.send(true);
    handle
        .await
        .map_err(|err| AppError::join("poller.join", err))?;
    served
}

async fn status() -> Json<Value> {
    Json(json!({ "message": "Poller is running!" }))
}
