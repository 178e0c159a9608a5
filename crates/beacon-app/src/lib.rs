#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]

//! Beacon application wiring: the receiver, poller, and flow services.
//!
//! Layout: `bootstrap.rs` (telemetry + service dispatch), `cli.rs` (arguments),
//! `receiver.rs` / `poller.rs` (HTTP services), `flows.rs` + `runner.rs` (flow service).

/// Application bootstrap and shared telemetry handles.
pub mod bootstrap;
/// Command-line arguments.
pub mod cli;
/// Application error types.
pub mod error;
/// Demo flows and their service loop.
pub mod flows;
/// Background poller and its status endpoint.
pub mod poller;
/// Random-number receiver.
pub mod receiver;
/// Local flow driver.
pub mod runner;

pub use bootstrap::{Telemetry, run_app};
pub use error::{AppError, AppResult};
