//! Demo flow service: one flow calling two tasks, served on an interval.

use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use beacon_telemetry::lifecycle::{CompletionTracking, WorkMetrics};
use beacon_telemetry::{Flow, FlowOptions, Instrumentation, PushGateway, Task, TaskOptions};
use rand::Rng as _;
use thiserror::Error;
use tracing::{info, warn};

use crate::bootstrap::Telemetry;
use crate::error::{AppError, AppResult};
use crate::runner::{self, call_with_retries};

/// Name of the top-level demo flow.
pub const FLOW_NAME: &str = "some_flow";
/// Name of the task called by the flow.
pub const TASK_NAME: &str = "some_task";
/// Name of the subtask called by both the flow and the task.
pub const SUBTASK_NAME: &str = "some_subtask";
/// Value returned by the subtask.
pub const SUBTASK_VALUE: u32 = 42;

/// Failure injected into `some_task`.
#[derive(Debug, Error)]
#[error("Random error!")]
pub struct RandomError;

/// Boxed unit body shared by the demo task and flow definitions.
pub type UnitBody<T> = Box<dyn Fn(()) -> Result<T, RandomError> + Send + Sync>;

/// Knobs controlling how the demo units behave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Behaviour {
    /// Probability that `some_task` fails after its subtask returned.
    pub failure_probability: f64,
    /// How long `some_task` sleeps before calling its subtask.
    pub task_sleep: Duration,
    /// Upper bound of the random sleep in `some_subtask`.
    pub subtask_max_sleep: Duration,
    /// Options applied to both tasks.
    pub task_options: TaskOptions,
    /// Options applied to the flow.
    pub flow_options: FlowOptions,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            failure_probability: 0.2,
            task_sleep: Duration::from_secs(1),
            subtask_max_sleep: Duration::from_secs(1),
            task_options: TaskOptions::default(),
            flow_options: FlowOptions::default(),
        }
    }
}

/// The demo flow wired to an [`Instrumentation`].
pub fn some_flow(instrumentation: &Instrumentation, behaviour: Behaviour) -> Flow<UnitBody<()>> {
    let subtask_sleep = behaviour.subtask_max_sleep;
    let subtask_body: UnitBody<u32> = Box::new(move |(): ()| -> Result<u32, RandomError> {
        let fraction: f64 = rand::rng().random();
        thread::sleep(subtask_sleep.mul_f64(fraction));
        Ok(SUBTASK_VALUE)
    });
    let some_subtask = Arc::new(instrumentation.task(
        SUBTASK_NAME,
        behaviour.task_options,
        subtask_body,
    ));

    let nested_subtask = Arc::clone(&some_subtask);
    let task_body: UnitBody<u32> = Box::new(move |(): ()| -> Result<u32, RandomError> {
        thread::sleep(behaviour.task_sleep);
        let value = call_with_retries(&*nested_subtask)?;
        if rand::rng().random_bool(behaviour.failure_probability) {
            return Err(RandomError);
        }
        Ok(value)
    });
    let some_task: Arc<Task<UnitBody<u32>>> =
        Arc::new(instrumentation.task(TASK_NAME, behaviour.task_options, task_body));

    let flow_body: UnitBody<()> = Box::new(move |(): ()| -> Result<(), RandomError> {
        let value = call_with_retries(&*some_task)?;
        info!(value, "{TASK_NAME} returned");
        call_with_retries(&*some_subtask)?;
        Ok(())
    });
    instrumentation.flow(FLOW_NAME, behaviour.flow_options, flow_body)
}

/// Serve the demo flow every `interval` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the lifecycle metrics cannot be built or the runner thread cannot be
/// started or joined.
pub async fn serve<F>(telemetry: &Telemetry, interval: Duration, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let settings = &telemetry.settings;
    let metrics = WorkMetrics::new(CompletionTracking::Gauge)
        .map_err(|err| AppError::telemetry("flows.metrics", err))?;
    let instrumentation = Instrumentation::new(
        settings.service.clone(),
        &telemetry.tracers,
        metrics,
        Arc::new(PushGateway::new(settings.push_gateway.clone())),
    );
    let flow = Arc::new(some_flow(&instrumentation, Behaviour::default()));

    let (stop_tx, stop_rx) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("flow-runner".to_string())
        .spawn(move || runner::serve(&flow, interval, &stop_rx))
        .map_err(|err| AppError::io("flows.spawn", err))?;
    info!(push_gateway = %settings.push_gateway, "flow runner started");

    shutdown.await;
    let _ = stop_tx.send(());
    let joined = tokio::task::spawn_blocking(move || worker.join())
        .await
        .map_err(|err| AppError::join("flows.join", err))?;
    if joined.is_err() {
        warn!("flow runner thread panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_telemetry::lifecycle::{Checkpoint, UnitKind};
    use beacon_telemetry::{MetricsGateway, StateType, TracerRegistry};
    use prometheus::proto::MetricFamily;
    use std::error::Error;
    use std::sync::{Mutex, PoisonError};

    #[derive(Debug, Default)]
    struct RecordingGateway {
        checkpoints: Mutex<Vec<Checkpoint>>,
    }

    impl MetricsGateway for RecordingGateway {
        fn push(
            &self,
            _job: &str,
            checkpoint: Checkpoint,
            _families: Vec<MetricFamily>,
        ) -> beacon_telemetry::Result<()> {
            self.checkpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(checkpoint);
            Ok(())
        }
    }

    fn quick(failure_probability: f64) -> Behaviour {
        Behaviour {
            failure_probability,
            task_sleep: Duration::ZERO,
            subtask_max_sleep: Duration::ZERO,
            task_options: TaskOptions::default()
                .with_retries(1)
                .with_retry_delay(Duration::ZERO),
            flow_options: FlowOptions::default(),
        }
    }

    fn instrumentation(
        gateway: Arc<RecordingGateway>,
    ) -> Result<Instrumentation, Box<dyn Error>> {
        Ok(Instrumentation::new(
            "flows",
            &TracerRegistry::disabled(),
            WorkMetrics::new(CompletionTracking::Gauge)?,
            gateway,
        ))
    }

    #[test]
    fn healthy_run_completes() -> Result<(), Box<dyn Error>> {
        let gateway = Arc::new(RecordingGateway::default());
        let instrumentation = instrumentation(Arc::clone(&gateway))?;
        let flow = Arc::new(some_flow(&instrumentation, quick(0.0)));

        let (_, state) = runner::run_once(&flow);
        assert!(state.is_completed());

        let metrics = instrumentation.metrics();
        assert_eq!(metrics.snapshot(UnitKind::Task, SUBTASK_NAME).invocations, 2);
        assert_eq!(metrics.snapshot(UnitKind::Task, TASK_NAME).invocations, 1);
        assert_eq!(
            metrics.status_count(UnitKind::Flow, FLOW_NAME, "COMPLETED"),
            1
        );
        assert_eq!(metrics.snapshot(UnitKind::Flow, FLOW_NAME).in_progress, 0);

        let checkpoints = gateway
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        assert_eq!(checkpoints.first(), Some(&Checkpoint::Started));
        assert_eq!(checkpoints.last(), Some(&Checkpoint::Final));
        Ok(())
    }

    #[test]
    fn random_errors_fail_the_run_after_retries() -> Result<(), Box<dyn Error>> {
        let gateway = Arc::new(RecordingGateway::default());
        let instrumentation = instrumentation(gateway)?;
        let flow = Arc::new(some_flow(&instrumentation, quick(1.0)));

        let (_, state) = runner::run_once(&flow);
        assert_eq!(state.state_type, StateType::Failed);
        assert_eq!(state.message.as_deref(), Some("Random error!"));

        let metrics = instrumentation.metrics();
        assert_eq!(metrics.status_count(UnitKind::Task, TASK_NAME, "FAILED"), 2);
        assert_eq!(metrics.snapshot(UnitKind::Task, TASK_NAME).in_progress, 0);
        assert_eq!(metrics.status_count(UnitKind::Flow, FLOW_NAME, "FAILED"), 1);
        Ok(())
    }
}
