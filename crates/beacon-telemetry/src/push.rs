//! Push-gateway delivery of lifecycle partitions.

use std::collections::HashMap;
use std::fmt::Debug;

use prometheus::proto::MetricFamily;

use crate::error::{Result, TelemetryError};
use crate::lifecycle::Checkpoint;

/// Destination for lifecycle metric partitions.
pub trait MetricsGateway: Send + Sync + Debug {
    /// Deliver `families` for `job` at `checkpoint`; blocks until the gateway answered.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway rejected or never received the push.
    fn push(&self, job: &str, checkpoint: Checkpoint, families: Vec<MetricFamily>) -> Result<()>;
}

/// Prometheus push-gateway client.
///
/// Pushes use POST semantics: only the metric families contained in a push are replaced in the
/// job's group, so partitions pushed at different checkpoints do not erase each other.
#[derive(Debug, Clone)]
pub struct PushGateway {
    url: String,
}

impl PushGateway {
    /// Target the gateway at `url` (e.g. `http://pushgateway:9091`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Gateway base URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl MetricsGateway for PushGateway {
    fn push(&self, job: &str, _checkpoint: Checkpoint, families: Vec<MetricFamily>) -> Result<()> {
        prometheus::push_add_metrics(job, HashMap::new(), &self.url, families, None).map_err(
            |source| TelemetryError::MetricsPush {
                job: job.to_string(),
                source,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_gateway_reports_the_job() {
        let gateway = PushGateway::new("http://127.0.0.1:9");
        assert_eq!(gateway.url(), "http://127.0.0.1:9");
        let result = gateway.push("flows", Checkpoint::Started, Vec::new());
        match result {
            Err(TelemetryError::MetricsPush { job, .. }) => assert_eq!(job, "flows"),
            other => panic!("expected push failure, got {other:?}"),
        }
    }
}
