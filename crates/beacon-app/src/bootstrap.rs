//! Boot sequence: settings, telemetry handles, logging, and service dispatch.
//!
//! # Design
//! - Telemetry is built once per process and handed to the selected service by reference.
//! - Tracer providers are shut down and the log sink flushed after the service returns.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use beacon_telemetry::{
    HttpMetricsLayer, LoggingConfig, Metrics, Settings, TracerRegistry, init_logging,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::cli::{Cli, Command};
use crate::error::{AppError, AppResult};
use crate::{flows, poller, receiver};

/// Telemetry handles shared by every service in the binary.
#[derive(Clone)]
pub struct Telemetry {
    /// Resolved settings, bound to the running service.
    pub settings: Settings,
    /// Request metrics scraped at `/metrics`.
    pub metrics: Metrics,
    /// Per-service tracer cache.
    pub tracers: TracerRegistry,
}

impl Telemetry {
    /// Build the metrics registry and tracer cache for `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics registry cannot be constructed.
    pub fn new(settings: Settings) -> AppResult<Self> {
        let metrics =
            Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        let tracers = TracerRegistry::new(settings.otlp_endpoint.clone());
        Ok(Self {
            settings,
            metrics,
            tracers,
        })
    }

    /// Request middleware for the running service.
    #[must_use]
    pub fn http_layer(&self) -> HttpMetricsLayer {
        HttpMetricsLayer::new(
            self.settings.service.clone(),
            self.metrics.clone(),
            &self.tracers,
        )
        .intercept_exceptions(self.settings.intercept_exceptions)
    }
}

/// Entry point for the Beacon boot sequence.
///
/// # Errors
///
/// Returns an error if telemetry cannot be installed or the selected service fails.
pub async fn run_app() -> AppResult<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().for_service(cli.service_name());
    let telemetry = Telemetry::new(settings)?;
    let sink = init_logging(
        &LoggingConfig::from_settings(&telemetry.settings),
        &telemetry.metrics,
    )
    .map_err(|err| AppError::telemetry("telemetry.init", err))?;

    info!(service = %telemetry.settings.service, "Beacon service starting");

    let result = match cli.command {
        Command::Receiver(args) => receiver::serve(&telemetry, args.listen, shutdown_signal()).await,
        Command::Poller(args) => poller::serve(&telemetry, &args, shutdown_signal()).await,
        Command::Flows(args) => flows::serve(&telemetry, args.interval(), shutdown_signal()).await,
    };
    if let Err(err) = &result {
        error!(error = %err, "service terminated with an error");
    }

    let tracers = telemetry.tracers.clone();
    tokio::task::spawn_blocking(move || tracers.shutdown())
        .await
        .map_err(|err| AppError::join("telemetry.shutdown", err))?;
    sink.flush()
        .map_err(|err| AppError::io("telemetry.flush", err))?;

    result
}

/// Bind `addr` and serve `router` until `shutdown` resolves.
pub(crate) async fn serve_http<F>(router: Router, addr: SocketAddr, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::io("http.bind", err))?;
    info!(addr = %addr, "Launching HTTP listener");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| AppError::io("http.serve", err))?;
    info!("HTTP listener stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            error!(error = %err, "failed to listen for the shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn telemetry_binds_the_service_name() -> Result<(), Box<dyn Error>> {
        let telemetry = Telemetry::new(Settings::default().for_service("receiver"))?;
        let _layer = telemetry.http_layer();
        let rendered = telemetry.metrics.render()?;
        assert!(rendered.contains("service{service=\"receiver\"} 1"));
        Ok(())
    }

    #[tokio::test]
    async fn serve_http_stops_on_shutdown() -> Result<(), Box<dyn Error>> {
        let addr: SocketAddr = "127.0.0.1:0".parse()?;
        serve_http(Router::new(), addr, async {}).await?;
        Ok(())
    }
}
