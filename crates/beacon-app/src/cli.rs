//! Command-line surface of the `beacon` binary.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

const DEFAULT_RECEIVER_LISTEN: &str = "0.0.0.0:8000";
const DEFAULT_POLLER_LISTEN: &str = "0.0.0.0:8002";
const DEFAULT_RECEIVER_ENDPOINT: &str = "http://localhost:8000";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_FLOW_INTERVAL_SECS: u64 = 2;

/// Instrumented demo services sharing one telemetry stack.
#[derive(Debug, Parser)]
#[command(name = "beacon", about = "Instrumented demo services for the Beacon telemetry stack")]
pub struct Cli {
    /// Logical service name; defaults to the subcommand name.
    #[arg(long, global = true, env = "SERVICE")]
    pub service: Option<String>,
    /// Service to run.
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Service name used for labels, spans, and push-gateway jobs.
    #[must_use]
    pub fn service_name(&self) -> String {
        self.service
            .clone()
            .filter(|service| !service.trim().is_empty())
            .unwrap_or_else(|| self.command.default_service().to_string())
    }
}

/// Services shipped in the binary.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve random numbers over HTTP.
    Receiver(ReceiverArgs),
    /// Poll the receiver in the background while serving a status endpoint.
    Poller(PollerArgs),
    /// Run the demo flows on a fixed interval.
    Flows(FlowsArgs),
}

impl Command {
    /// Service name used when none was configured.
    #[must_use]
    pub const fn default_service(&self) -> &'static str {
        match self {
            Self::Receiver(_) => "receiver",
            Self::Poller(_) => "poller",
            Self::Flows(_) => "flows",
        }
    }
}

/// Receiver options.
#[derive(Debug, Args)]
pub struct ReceiverArgs {
    /// Listen address.
    #[arg(long, env = "RECEIVER_LISTEN", default_value = DEFAULT_RECEIVER_LISTEN)]
    pub listen: SocketAddr,
}

/// Poller options.
#[derive(Debug, Args)]
pub struct PollerArgs {
    /// Listen address for the status endpoint.
    #[arg(long, env = "POLLER_LISTEN", default_value = DEFAULT_POLLER_LISTEN)]
    pub listen: SocketAddr,
    /// Base URL of the receiver.
    #[arg(long, env = "RECEIVER_ENDPOINT", default_value = DEFAULT_RECEIVER_ENDPOINT)]
    pub endpoint: String,
    /// Seconds between polls.
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub interval_secs: u64,
}

impl PollerArgs {
    /// Delay between polls.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Flow runner options.
#[derive(Debug, Args)]
pub struct FlowsArgs {
    /// Seconds between flow runs.
    #[arg(long, env = "FLOW_INTERVAL_SECS", default_value_t = DEFAULT_FLOW_INTERVAL_SECS)]
    pub interval_secs: u64,
}

impl FlowsArgs {
    /// Delay between flow runs.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn subcommand_names_the_service() -> Result<(), Box<dyn Error>> {
        let cli = Cli::try_parse_from(["beacon", "--service", "edge-receiver", "receiver"])?;
        assert_eq!(cli.service_name(), "edge-receiver");
        let Command::Receiver(args) = cli.command else {
            return Err("expected receiver command".into());
        };
        assert_eq!(args.listen.port(), 8000);
        Ok(())
    }

    #[test]
    fn poller_arguments_parse() -> Result<(), Box<dyn Error>> {
        let cli = Cli::try_parse_from([
            "beacon",
            "poller",
            "--endpoint",
            "http://receiver:8000",
            "--interval-secs",
            "3",
        ])?;
        assert_eq!(cli.command.default_service(), "poller");
        let Command::Poller(args) = cli.command else {
            return Err("expected poller command".into());
        };
        assert_eq!(args.endpoint, "http://receiver:8000");
        assert_eq!(args.interval(), Duration::from_secs(3));
        assert_eq!(args.listen.port(), 8002);
        Ok(())
    }

    #[test]
    fn flows_interval_defaults_to_two_seconds() -> Result<(), Box<dyn Error>> {
        let cli = Cli::try_parse_from(["beacon", "flows"])?;
        let Command::Flows(args) = cli.command else {
            return Err("expected flows command".into());
        };
        assert_eq!(args.interval(), Duration::from_secs(2));
        Ok(())
    }
}
