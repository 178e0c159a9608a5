#![forbid(unsafe_code)]

//! Binary entrypoint that runs one Beacon service until it is interrupted.

use beacon_app::{AppResult, run_app};

/// Boots the selected service and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
