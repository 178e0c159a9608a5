//! Minimal local driver for instrumented flows.
//!
//! # Design
//! - Each run executes on its own worker thread so the flow timeout can be enforced without
//!   cooperation from the body; a timed-out worker is left to finish on its own.
//! - The run's terminal state is classified here and handed to the flow's hooks, which settle
//!   the lifecycle metrics.
//! - Task retries happen at the call site through [`call_with_retries`].

use std::error::Error;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use beacon_telemetry::{Flow, FlowRun, RunState, StateType, Task};
use rand::Rng as _;
use tracing::{info, warn};

const RUN_NAME_ADJECTIVES: [&str; 8] = [
    "brave", "calm", "eager", "gentle", "keen", "lucky", "quiet", "swift",
];
const RUN_NAME_NOUNS: [&str; 8] = [
    "badger", "crane", "falcon", "heron", "lynx", "otter", "raven", "walrus",
];

/// Call `task`, retrying failed attempts according to its options.
///
/// Every attempt is a separate task invocation with its own span and lifecycle counters.
///
/// # Errors
///
/// Returns the error of the last attempt once retries are exhausted.
pub fn call_with_retries<F, T, E>(task: &Task<F>) -> Result<T, E>
where
    F: Fn(()) -> Result<T, E>,
    E: Error + 'static,
{
    let options = *task.options();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match task.call(()) {
            Ok(value) => return Ok(value),
            Err(err) if attempt <= options.retries => {
                warn!(
                    task = %task.name(),
                    attempt,
                    retry_delay_s = options.retry_delay.as_secs_f64(),
                    error = %err,
                    "task attempt failed; retrying"
                );
                thread::sleep(options.retry_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Human-friendly run name, e.g. `swift-otter`.
#[must_use]
pub fn generate_run_name() -> String {
    let mut rng = rand::rng();
    let adjective = RUN_NAME_ADJECTIVES[rng.random_range(0..RUN_NAME_ADJECTIVES.len())];
    let noun = RUN_NAME_NOUNS[rng.random_range(0..RUN_NAME_NOUNS.len())];
    format!("{adjective}-{noun}")
}

/// Run `flow` once on a worker thread, classify the outcome, and fire its terminal hooks.
pub fn run_once<F, E>(flow: &Arc<Flow<F>>) -> (FlowRun, RunState)
where
    F: Fn(()) -> Result<(), E> + Send + Sync + 'static,
    E: Error + 'static,
{
    let run_name = generate_run_name();
    let started = Instant::now();
    let (result_tx, result_rx) = mpsc::channel();
    let worker = Arc::clone(flow);
    let worker_run_name = run_name.clone();

    let spawned = thread::Builder::new()
        .name(format!("flow-{run_name}"))
        .spawn(move || {
            let result = worker
                .call_named(Some(&worker_run_name), ())
                .map_err(|err| err.to_string());
            let _ = result_tx.send(result);
        });

    let state = match spawned {
        Err(err) => RunState::with_message(
            StateType::Crashed,
            format!("could not start flow worker: {err}"),
        ),
        Ok(_detached) => match result_rx.recv_timeout(flow.options().timeout) {
            Ok(Ok(())) => RunState::completed(),
            Ok(Err(message)) => RunState::with_message(StateType::Failed, message),
            Err(RecvTimeoutError::Timeout) => RunState::with_message(
                StateType::Cancelled,
                format!(
                    "flow run exceeded its timeout of {}s",
                    flow.options().timeout.as_secs_f64()
                ),
            ),
            Err(RecvTimeoutError::Disconnected) => RunState::with_message(
                StateType::Crashed,
                "flow worker exited without reporting a result",
            ),
        },
    };

    let run = FlowRun {
        name: run_name,
        total_run_time: started.elapsed(),
    };
    flow.hooks().fire(flow.name(), &run, &state);
    info!(
        flow = %flow.name(),
        run = %run.name,
        state = %state.state_type,
        "flow run finished"
    );
    (run, state)
}

/// Run `flow` every `interval` until `stop` receives a message or its sender is dropped.
pub fn serve<F, E>(flow: &Arc<Flow<F>>, interval: Duration, stop: &Receiver<()>)
where
    F: Fn(()) -> Result<(), E> + Send + Sync + 'static,
    E: Error + 'static,
{
    info!(flow = %flow.name(), interval_s = interval.as_secs_f64(), "serving flow");
    loop {
        let _ = run_once(flow);
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(flow = %flow.name(), "flow runner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_telemetry::lifecycle::{Checkpoint, CompletionTracking, UnitKind, WorkMetrics};
    use beacon_telemetry::{
        FlowOptions, Instrumentation, MetricsGateway, TaskOptions, TracerRegistry,
    };
    use prometheus::proto::MetricFamily;
    use std::fmt::{self, Display, Formatter};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky;

    impl Display for Flaky {
        fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
            formatter.write_str("flaky")
        }
    }

    impl Error for Flaky {}

    #[derive(Debug)]
    struct DiscardGateway;

    impl MetricsGateway for DiscardGateway {
        fn push(
            &self,
            _job: &str,
            _checkpoint: Checkpoint,
            _families: Vec<MetricFamily>,
        ) -> beacon_telemetry::Result<()> {
            Ok(())
        }
    }

    fn instrumentation() -> Result<Instrumentation, Box<dyn Error>> {
        Ok(Instrumentation::new(
            "flows",
            &TracerRegistry::disabled(),
            WorkMetrics::new(CompletionTracking::Gauge)?,
            Arc::new(DiscardGateway),
        ))
    }

    #[test]
    fn retries_until_success() -> Result<(), Box<dyn Error>> {
        let instrumentation = instrumentation()?;
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let task = instrumentation.task(
            "flaky",
            TaskOptions::default().with_retry_delay(Duration::ZERO),
            move |(): ()| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky)
                } else {
                    Ok(7)
                }
            },
        );

        assert_eq!(call_with_retries(&task)?, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let metrics = instrumentation.metrics();
        assert_eq!(metrics.snapshot(UnitKind::Task, "flaky").invocations, 3);
        assert_eq!(metrics.status_count(UnitKind::Task, "flaky", "FAILED"), 2);
        assert_eq!(metrics.status_count(UnitKind::Task, "flaky", "COMPLETED"), 1);
        Ok(())
    }

    #[test]
    fn retries_are_bounded() -> Result<(), Box<dyn Error>> {
        let instrumentation = instrumentation()?;
        let task = instrumentation.task(
            "always_fails",
            TaskOptions::default()
                .with_retries(1)
                .with_retry_delay(Duration::ZERO),
            |(): ()| -> Result<(), Flaky> { Err(Flaky) },
        );
        assert!(call_with_retries(&task).is_err());
        assert_eq!(
            instrumentation
                .metrics()
                .snapshot(UnitKind::Task, "always_fails")
                .invocations,
            2
        );
        Ok(())
    }

    #[test]
    fn run_states_are_classified() -> Result<(), Box<dyn Error>> {
        let instrumentation = instrumentation()?;
        let metrics = instrumentation.metrics().clone();

        let ok = Arc::new(instrumentation.flow("ok_flow", FlowOptions::default(), |(): ()| {
            Ok::<(), Flaky>(())
        }));
        let failing = Arc::new(instrumentation.flow(
            "failing_flow",
            FlowOptions::default(),
            |(): ()| -> Result<(), Flaky> { Err(Flaky) },
        ));
        let crashing = Arc::new(instrumentation.flow(
            "crashing_flow",
            FlowOptions::default(),
            |(): ()| -> Result<(), Flaky> { panic!("worker blew up") },
        ));
        let slow = Arc::new(instrumentation.flow(
            "slow_flow",
            FlowOptions::default().with_timeout(Duration::from_millis(50)),
            |(): ()| -> Result<(), Flaky> {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            },
        ));

        assert!(run_once(&ok).1.is_completed());
        let (_, failed) = run_once(&failing);
        assert_eq!(failed.state_type, StateType::Failed);
        assert_eq!(failed.message.as_deref(), Some("flaky"));
        assert_eq!(run_once(&crashing).1.state_type, StateType::Crashed);
        assert_eq!(run_once(&slow).1.state_type, StateType::Cancelled);

        for (flow, status) in [
            ("ok_flow", "COMPLETED"),
            ("failing_flow", "FAILED"),
            ("crashing_flow", "CRASHED"),
            ("slow_flow", "CANCELLED"),
        ] {
            assert_eq!(metrics.status_count(UnitKind::Flow, flow, status), 1);
        }
        assert_eq!(metrics.snapshot(UnitKind::Flow, "ok_flow").in_progress, 0);
        Ok(())
    }

    #[test]
    fn serve_stops_when_signalled() -> Result<(), Box<dyn Error>> {
        let instrumentation = instrumentation()?;
        let flow = Arc::new(instrumentation.flow("tick", FlowOptions::default(), |(): ()| {
            Ok::<(), Flaky>(())
        }));
        let (stop_tx, stop_rx) = mpsc::channel();
        stop_tx.send(())?;
        serve(&flow, Duration::from_secs(60), &stop_rx);
        assert_eq!(
            instrumentation
                .metrics()
                .snapshot(UnitKind::Flow, "tick")
                .invocations,
            1
        );
        Ok(())
    }

    #[test]
    fn run_names_have_two_parts() {
        let name = generate_run_name();
        assert_eq!(name.split('-').count(), 2);
    }
}
