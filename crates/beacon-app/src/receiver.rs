//! Receiver service: hands out random numbers.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::get;
use axum::{Json, Router};
use beacon_telemetry::metrics_router;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bootstrap::{Telemetry, serve_http};
use crate::error::AppResult;

/// Largest value the receiver hands out (inclusive).
pub const MAX_RANDOM_VALUE: u32 = 100;

/// Payload returned by `GET /`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomNumber {
    /// Value in `0..=MAX_RANDOM_VALUE`.
    pub value: u32,
}

/// Routes served by the receiver, instrumented per route template.
pub fn router(telemetry: &Telemetry) -> Router {
    let layer = telemetry.http_layer();
    Router::new()
        .route("/", layer.instrument(get(random_number)))
        .merge(metrics_router(telemetry.metrics.clone()))
}

/// Serve the receiver on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve<F>(telemetry: &Telemetry, addr: SocketAddr, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    serve_http(router(telemetry), addr, shutdown).await
}

async fn random_number() -> Json<RandomNumber> {
    info!("Received request for a new random number. How exciting!");
    let value = rand::rng().random_range(0..=MAX_RANDOM_VALUE);
    Json(RandomNumber { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use beacon_telemetry::{RouteMetricKey, Settings};
    use std::error::Error;
    use tower::ServiceExt as _;

    fn telemetry() -> Result<Telemetry, Box<dyn Error>> {
        Ok(Telemetry::new(Settings::default().for_service("receiver"))?)
    }

    #[tokio::test]
    async fn root_returns_a_bounded_value() -> Result<(), Box<dyn Error>> {
        let telemetry = telemetry()?;
        let response = router(&telemetry)
            .oneshot(Request::builder().uri("/").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let payload: RandomNumber = serde_json::from_slice(&body)?;
        assert!(payload.value <= MAX_RANDOM_VALUE);

        let key = RouteMetricKey::new("receiver", "GET", "/");
        let snapshot = telemetry.metrics.route_snapshot(&key);
        assert_eq!(snapshot.invocations, 1);
        assert_eq!(snapshot.responses, 1);
        assert_eq!(snapshot.in_progress, 0);
        Ok(())
    }

    #[tokio::test]
    async fn slow_path_is_unrouted_and_unmeasured() -> Result<(), Box<dyn Error>> {
        let telemetry = telemetry()?;
        let response = router(&telemetry)
            .oneshot(Request::builder().uri("/slow").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!telemetry.metrics.render()?.contains("/slow"));
        Ok(())
    }

    #[tokio::test]
    async fn metrics_endpoint_is_not_measured() -> Result<(), Box<dyn Error>> {
        let telemetry = telemetry()?;
        let response = router(&telemetry)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let key = RouteMetricKey::new("receiver", "GET", "/metrics");
        assert_eq!(telemetry.metrics.route_snapshot(&key).invocations, 0);
        Ok(())
    }

    #[tokio::test]
    async fn other_methods_on_root_are_unmeasured() -> Result<(), Box<dyn Error>> {
        let telemetry = telemetry()?;
        let response = router(&telemetry)
            .oneshot(Request::builder().method("POST").uri("/").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(!telemetry.metrics.render()?.contains("POST /"));
        Ok(())
    }
}
