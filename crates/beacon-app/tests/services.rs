use std::error::Error;
use std::time::Duration;

use beacon_app::Telemetry;
use beacon_app::poller::Poller;
use beacon_app::receiver::{self, MAX_RANDOM_VALUE};
use beacon_telemetry::{RouteMetricKey, Settings, TracerRegistry};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[tokio::test]
async fn poller_reaches_a_served_receiver() -> Result<(), Box<dyn Error>> {
    let telemetry = Telemetry::new(Settings::default().for_service("receiver"))?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let router = receiver::router(&telemetry);
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let poller = Poller::new(
        format!("http://{addr}"),
        Duration::from_secs(10),
        &TracerRegistry::disabled(),
        "poller",
    )?;
    let first = poller.poll(false).await.ok_or("first poll failed")?;
    let second = poller.poll(false).await.ok_or("second poll failed")?;
    assert!(first <= MAX_RANDOM_VALUE && second <= MAX_RANDOM_VALUE);
    assert_eq!(poller.poll(true).await, None);

    let key = RouteMetricKey::new("receiver", "GET", "/");
    assert_eq!(telemetry.metrics.route_snapshot(&key).invocations, 2);
    assert!(!telemetry.metrics.render()?.contains("/slow"));

    let _ = stop_tx.send(());
    server.await??;
    Ok(())
}
