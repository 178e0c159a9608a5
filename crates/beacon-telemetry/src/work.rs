//! Task and flow instrumentation wrappers.
//!
//! # Design
//! - A wrapper brackets a synchronous unit of work with a server span, lifecycle counters, and
//!   blocking push-gateway calls at fixed checkpoints.
//! - Failures are recorded on the span and handed back unchanged; retry policy belongs to
//!   whatever drives the units.
//! - Flow terminal accounting runs from [`FlowHooks`], which the driver fires out of band, so a
//!   flow that never returns can still be finalised.
//! - Tasks have no such driver hook and settle their terminal state inline.

use std::any::Any;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::Context;
use opentelemetry::trace::TraceContextExt as _;
use opentelemetry_sdk::trace::SdkTracer;
use tracing::{info, warn};

use crate::failure::Failure;
use crate::lifecycle::{Checkpoint, UnitKind, WorkMetrics};
use crate::push::MetricsGateway;
use crate::trace::{SpanOutcome, TracerRegistry, fail_span, start_server_span};

/// Default number of task retries.
pub const DEFAULT_TASK_RETRIES: u32 = 2;
/// Default delay between task retries.
pub const DEFAULT_TASK_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Default task timeout (one hour).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default flow timeout (one week).
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(3600 * 24 * 7);

/// Execution policy for a task, honoured by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    /// Additional attempts after a failure.
    pub retries: u32,
    /// Pause before each retry.
    pub retry_delay: Duration,
    /// Upper bound for a single attempt.
    pub timeout: Duration,
    /// Whether results are kept in memory by the driver.
    pub cache_result_in_memory: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_TASK_RETRIES,
            retry_delay: DEFAULT_TASK_RETRY_DELAY,
            timeout: DEFAULT_TASK_TIMEOUT,
            cache_result_in_memory: false,
        }
    }
}

impl TaskOptions {
    /// Override the retry count.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Override the retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Execution policy for a flow, honoured by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOptions {
    /// Upper bound for a flow run.
    pub timeout: Duration,
    /// Whether results are kept in memory by the driver.
    pub cache_result_in_memory: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FLOW_TIMEOUT,
            cache_result_in_memory: false,
        }
    }
}

impl FlowOptions {
    /// Override the run timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    /// Finished normally.
    Completed,
    /// Returned an error.
    Failed,
    /// Panicked or died without returning.
    Crashed,
    /// Stopped by the driver (e.g. timeout).
    Cancelled,
}

impl StateType {
    /// Upper-case label written to the status counter.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Crashed => "CRASHED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl Display for StateType {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Terminal state plus an optional human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    /// Kind of terminal state.
    pub state_type: StateType,
    /// Explanation, e.g. the failure description.
    pub message: Option<String>,
}

impl RunState {
    /// A run that finished normally.
    #[must_use]
    pub const fn completed() -> Self {
        Self {
            state_type: StateType::Completed,
            message: None,
        }
    }

    /// A run in `state_type` with an explanation.
    #[must_use]
    pub fn with_message(state_type: StateType, message: impl Into<String>) -> Self {
        Self {
            state_type,
            message: Some(message.into()),
        }
    }

    /// Whether the run finished normally.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state_type == StateType::Completed
    }
}

/// Facts about a finished flow run handed to terminal hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRun {
    /// Run name resolved by the driver.
    pub name: String,
    /// Wall-clock time the run took, including retries.
    pub total_run_time: Duration,
}

/// Callback fired by the driver when a flow reaches a terminal state.
pub trait StateHook: Send + Sync {
    /// React to `flow` finishing `run` in `state`.
    fn on_state(&self, flow: &str, run: &FlowRun, state: &RunState);
}

/// Hook settling a flow's terminal lifecycle metrics and pushing the final partition.
#[derive(Debug, Clone)]
pub struct FlowFinalizer {
    instrumentation: Instrumentation,
}

impl StateHook for FlowFinalizer {
    fn on_state(&self, flow: &str, run: &FlowRun, state: &RunState) {
        let status = state.state_type.as_str();
        self.instrumentation
            .metrics
            .record_terminal(UnitKind::Flow, flow, status);
        self.instrumentation.push(Checkpoint::Final);
        info!(
            flow = %flow,
            run = %run.name,
            status = %status,
            total_run_time_s = run.total_run_time.as_secs_f64(),
            "flow reached a terminal state"
        );
    }
}

/// Terminal hooks for one flow, grouped by the state that triggers them.
#[derive(Clone, Default)]
pub struct FlowHooks {
    /// Fired on [`StateType::Completed`].
    pub on_completion: Vec<Arc<dyn StateHook>>,
    /// Fired on [`StateType::Failed`].
    pub on_failure: Vec<Arc<dyn StateHook>>,
    /// Fired on [`StateType::Crashed`].
    pub on_crashed: Vec<Arc<dyn StateHook>>,
    /// Fired on [`StateType::Cancelled`].
    pub on_cancelled: Vec<Arc<dyn StateHook>>,
}

impl Debug for FlowHooks {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("FlowHooks")
            .field("on_completion", &self.on_completion.len())
            .field("on_failure", &self.on_failure.len())
            .field("on_crashed", &self.on_crashed.len())
            .field("on_cancelled", &self.on_cancelled.len())
            .finish()
    }
}

impl FlowHooks {
    /// Run every hook registered for `state`.
    pub fn fire(&self, flow: &str, run: &FlowRun, state: &RunState) {
        let hooks = match state.state_type {
            StateType::Completed => &self.on_completion,
            StateType::Failed => &self.on_failure,
            StateType::Crashed => &self.on_crashed,
            StateType::Cancelled => &self.on_cancelled,
        };
        for hook in hooks {
            hook.on_state(flow, run, state);
        }
    }
}

struct InstrumentationInner {
    service: String,
    tracer: SdkTracer,
    gateway: Arc<dyn MetricsGateway>,
}

/// Shared wiring for every task and flow of one service.
#[derive(Clone)]
pub struct Instrumentation {
    inner: Arc<InstrumentationInner>,
    metrics: WorkMetrics,
}

impl Debug for Instrumentation {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Instrumentation")
            .field("service", &self.inner.service)
            .field("gateway", &self.inner.gateway)
            .finish_non_exhaustive()
    }
}

impl Instrumentation {
    /// Wire units of `service` to its tracer, the lifecycle metrics, and the gateway.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        tracers: &TracerRegistry,
        metrics: WorkMetrics,
        gateway: Arc<dyn MetricsGateway>,
    ) -> Self {
        let service = service.into();
        let tracer = tracers.tracer(&service);
        Self {
            inner: Arc::new(InstrumentationInner {
                service,
                tracer,
                gateway,
            }),
            metrics,
        }
    }

    /// Service name used as the push-gateway job.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Lifecycle metrics shared by the wrapped units.
    #[must_use]
    pub const fn metrics(&self) -> &WorkMetrics {
        &self.metrics
    }

    /// Wrap `body` as a task named `name`.
    pub fn task<F>(&self, name: impl Into<String>, options: TaskOptions, body: F) -> Task<F> {
        Task {
            name: name.into(),
            options,
            body,
            instrumentation: self.clone(),
        }
    }

    /// Wrap `body` as a flow named `name`.
    pub fn flow<F>(&self, name: impl Into<String>, options: FlowOptions, body: F) -> Flow<F> {
        Flow {
            name: name.into(),
            options,
            body,
            instrumentation: self.clone(),
        }
    }

    fn push(&self, checkpoint: Checkpoint) {
        let families = self.metrics.gather(checkpoint);
        if let Err(err) = self
            .inner
            .gateway
            .push(&self.inner.service, checkpoint, families)
        {
            warn!(
                job = %self.inner.service,
                checkpoint = %checkpoint,
                error = %err,
                "failed to push lifecycle metrics"
            );
        }
    }

    fn open_span(&self, name: &str) -> Context {
        start_server_span(&self.inner.tracer, name.to_string(), &Context::current())
    }

    fn begin(&self, kind: UnitKind, name: &str) {
        self.metrics.record_invocation(kind, name);
        self.push(Checkpoint::Started);
    }

    fn complete(&self, kind: UnitKind, name: &str, elapsed: Duration) {
        self.metrics.record_duration(kind, name, elapsed);
        self.push(Checkpoint::Interim);
    }
}

/// Result of running a wrapped body: normal return, returned error, or panic payload.
type Outcome<T, E> = std::result::Result<std::result::Result<T, E>, Box<dyn Any + Send>>;

fn run_body<T, E>(body: impl FnOnce() -> std::result::Result<T, E>) -> (Outcome<T, E>, Duration) {
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(body));
    (outcome, started.elapsed())
}

/// A unit of work called from within a flow.
pub struct Task<F> {
    name: String,
    options: TaskOptions,
    body: F,
    instrumentation: Instrumentation,
}

impl<F> Debug for Task<F> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Task")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<F> Task<F> {
    /// Task name used for the span and metric labels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution policy for the driver.
    #[must_use]
    pub const fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Run the task once.
    ///
    /// Opens a span (a child of the current context), pushes the started partition, runs the
    /// body, and settles the terminal state before returning.
    ///
    /// # Errors
    ///
    /// Returns the body's error unchanged.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by the body after it has been recorded as `CRASHED`.
    pub fn call<A, T, E>(&self, input: A) -> std::result::Result<T, E>
    where
        F: Fn(A) -> std::result::Result<T, E>,
        E: Error + 'static,
    {
        let instrumentation = &self.instrumentation;
        let cx = instrumentation.open_span(&self.name);
        let _attached = cx.clone().attach();
        let span = cx.span();

        instrumentation.begin(UnitKind::Task, &self.name);
        let (outcome, elapsed) = run_body(|| (self.body)(input));

        let state = match &outcome {
            Ok(Ok(_)) => {
                SpanOutcome::Ok.apply(&span);
                instrumentation.complete(UnitKind::Task, &self.name, elapsed);
                StateType::Completed
            }
            Ok(Err(err)) => {
                fail_span(&span, &Failure::from_error(err));
                StateType::Failed
            }
            Err(payload) => {
                fail_span(&span, &Failure::from_panic(payload.as_ref()));
                StateType::Crashed
            }
        };
        instrumentation
            .metrics
            .record_terminal(UnitKind::Task, &self.name, state.as_str());
        instrumentation.push(Checkpoint::Final);
        span.end();

        outcome.unwrap_or_else(|payload| resume_unwind(payload))
    }
}

/// A top-level unit of work driven by an orchestrator.
pub struct Flow<F> {
    name: String,
    options: FlowOptions,
    body: F,
    instrumentation: Instrumentation,
}

impl<F> Debug for Flow<F> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Flow")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<F> Flow<F> {
    /// Flow name used for metric labels and the default span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution policy for the driver.
    #[must_use]
    pub const fn options(&self) -> &FlowOptions {
        &self.options
    }

    /// Terminal hooks that settle this flow's lifecycle metrics.
    #[must_use]
    pub fn hooks(&self) -> FlowHooks {
        let finalizer: Arc<dyn StateHook> = Arc::new(FlowFinalizer {
            instrumentation: self.instrumentation.clone(),
        });
        FlowHooks {
            on_completion: vec![Arc::clone(&finalizer)],
            on_failure: vec![Arc::clone(&finalizer)],
            on_crashed: vec![Arc::clone(&finalizer)],
            on_cancelled: vec![finalizer],
        }
    }

    /// Run the flow once under its own name.
    ///
    /// # Errors
    ///
    /// Returns the body's error unchanged.
    pub fn call<A, T, E>(&self, input: A) -> std::result::Result<T, E>
    where
        F: Fn(A) -> std::result::Result<T, E>,
        T: 'static,
        E: Error + 'static,
    {
        self.call_named(None, input)
    }

    /// Run the flow once; the span is named after `run_name` when the driver resolved one.
    ///
    /// Terminal accounting is left to [`FlowHooks::fire`].
    ///
    /// # Errors
    ///
    /// Returns the body's error unchanged.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by the body after recording it on the span.
    pub fn call_named<A, T, E>(&self, run_name: Option<&str>, input: A) -> std::result::Result<T, E>
    where
        F: Fn(A) -> std::result::Result<T, E>,
        T: 'static,
        E: Error + 'static,
    {
        let instrumentation = &self.instrumentation;
        let cx = instrumentation.open_span(run_name.unwrap_or(&self.name));
        let _attached = cx.clone().attach();
        let span = cx.span();

        instrumentation.begin(UnitKind::Flow, &self.name);
        let (outcome, elapsed) = run_body(|| (self.body)(input));

        match &outcome {
            Ok(Ok(value)) => {
                match (value as &dyn Any).downcast_ref::<RunState>() {
                    Some(state) if !state.is_completed() => {
                        SpanOutcome::Error(state.message.clone().unwrap_or_default()).apply(&span);
                    }
                    _ => SpanOutcome::Ok.apply(&span),
                }
                instrumentation.complete(UnitKind::Flow, &self.name, elapsed);
            }
            Ok(Err(err)) => fail_span(&span, &Failure::from_error(err)),
            Err(payload) => fail_span(&span, &Failure::from_panic(payload.as_ref())),
        }
        span.end();

        outcome.unwrap_or_else(|payload| resume_unwind(payload))
    }
}
