//! Partitioned metric registries for task and flow lifecycles.
//!
//! # Design
//! - One registry per push checkpoint, so each push-gateway call only carries the families
//!   relevant to that stage of a unit's life.
//! - A collector may belong to several partitions (the in-progress gauge is sent both when a
//!   unit starts and when it finishes).

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use prometheus::proto::MetricFamily;
use prometheus::{HistogramVec, IntCounterVec, IntGaugeVec, Registry};

use crate::error::Result;
use crate::metrics::{counter_vec, encode_text, gauge_vec, histogram_vec, register};

/// Bucket boundaries (seconds) for task and flow processing time.
pub const WORK_DURATION_BUCKETS: [f64; 16] = [
    0.1, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
    7200.0,
];

/// Kind of instrumented unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// A sub-unit called from within a flow.
    Task,
    /// A top-level unit driven by the orchestrator.
    Flow,
}

impl UnitKind {
    /// Metric prefix and label name for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Flow => "flow",
        }
    }
}

/// Lifecycle stage at which a partition is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Before the body runs.
    Started,
    /// After the body returned normally.
    Interim,
    /// When the unit reached a terminal state.
    Final,
}

impl Checkpoint {
    /// Lowercase stage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Interim => "interim",
            Self::Final => "final",
        }
    }
}

impl Display for Checkpoint {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// How terminal transitions are accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionTracking {
    /// Increment an in-progress gauge on start and decrement it on termination.
    #[default]
    Gauge,
    /// Leave the gauge alone and count finished units instead.
    FinishedCounter,
}

/// Point-in-time values for one named unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitSnapshot {
    /// Times the unit was invoked.
    pub invocations: u64,
    /// Units currently running (gauge tracking only).
    pub in_progress: i64,
    /// Units that reached a terminal state (finished-counter tracking only).
    pub finished: u64,
    /// Duration observations.
    pub observations: u64,
    /// Sum of observed durations, in seconds.
    pub duration_seconds: f64,
}

struct UnitCollectors {
    invocations: IntCounterVec,
    in_progress: IntGaugeVec,
    finished: IntCounterVec,
    processing_time: HistogramVec,
    status: IntCounterVec,
}

impl UnitCollectors {
    fn new(kind: UnitKind) -> Result<Self> {
        let [invocations, in_progress, finished, processing_time, status] = Self::names(kind);
        let label = kind.as_str();
        Ok(Self {
            invocations: counter_vec(
                invocations,
                "Counting the number of invocations",
                &[label],
            )?,
            in_progress: gauge_vec(
                in_progress,
                "Gauge of units currently being processed",
                &[label],
            )?,
            finished: counter_vec(
                finished,
                "Counting the number of units that reached a terminal state",
                &[label],
            )?,
            processing_time: histogram_vec(
                processing_time,
                "Histogram of processing time (in seconds)",
                &[label],
                WORK_DURATION_BUCKETS.to_vec(),
            )?,
            status: counter_vec(
                status,
                "Counting the terminal states of units",
                &[label, "status"],
            )?,
        })
    }

    fn register(&self, kind: UnitKind, partitions: &Partitions) -> Result<()> {
        let [invocations, in_progress, finished, processing_time, status] = Self::names(kind);
        register(&partitions.started, invocations, &self.invocations)?;
        register(&partitions.started, in_progress, &self.in_progress)?;
        register(&partitions.interim, processing_time, &self.processing_time)?;
        register(&partitions.finished, status, &self.status)?;
        register(&partitions.finished, in_progress, &self.in_progress)?;
        register(&partitions.finished, finished, &self.finished)?;
        Ok(())
    }

    const fn names(kind: UnitKind) -> [&'static str; 5] {
        match kind {
            UnitKind::Task => [
                "task_invocations",
                "tasks_in_progress",
                "tasks_finished",
                "task_processing_time",
                "task_status",
            ],
            UnitKind::Flow => [
                "flow_invocations",
                "flows_in_progress",
                "flows_finished",
                "flow_processing_time",
                "flow_status",
            ],
        }
    }
}

struct Partitions {
    started: Registry,
    interim: Registry,
    finished: Registry,
}

struct WorkMetricsInner {
    tracking: CompletionTracking,
    partitions: Partitions,
    task: UnitCollectors,
    flow: UnitCollectors,
}

/// Lifecycle metrics for tasks and flows, split into push partitions.
#[derive(Clone)]
pub struct WorkMetrics {
    inner: Arc<WorkMetricsInner>,
}

impl WorkMetrics {
    /// Build the partitions with every collector registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any collector cannot be built or registered.
    pub fn new(tracking: CompletionTracking) -> Result<Self> {
        let partitions = Partitions {
            started: Registry::new(),
            interim: Registry::new(),
            finished: Registry::new(),
        };
        let task = UnitCollectors::new(UnitKind::Task)?;
        let flow = UnitCollectors::new(UnitKind::Flow)?;
        task.register(UnitKind::Task, &partitions)?;
        flow.register(UnitKind::Flow, &partitions)?;

        Ok(Self {
            inner: Arc::new(WorkMetricsInner {
                tracking,
                partitions,
                task,
                flow,
            }),
        })
    }

    /// Terminal accounting mode.
    #[must_use]
    pub fn tracking(&self) -> CompletionTracking {
        self.inner.tracking
    }

    /// Count an invocation of `name`.
    pub fn record_invocation(&self, kind: UnitKind, name: &str) {
        let collectors = self.collectors(kind);
        collectors.invocations.with_label_values(&[name]).inc();
        if self.inner.tracking == CompletionTracking::Gauge {
            collectors.in_progress.with_label_values(&[name]).inc();
        }
    }

    /// Observe how long the body of `name` ran.
    pub fn record_duration(&self, kind: UnitKind, name: &str, elapsed: Duration) {
        self.collectors(kind)
            .processing_time
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());
    }

    /// Count a terminal transition of `name` into `status`.
    pub fn record_terminal(&self, kind: UnitKind, name: &str, status: &str) {
        let collectors = self.collectors(kind);
        collectors.status.with_label_values(&[name, status]).inc();
        match self.inner.tracking {
            CompletionTracking::Gauge => collectors.in_progress.with_label_values(&[name]).dec(),
            CompletionTracking::FinishedCounter => {
                collectors.finished.with_label_values(&[name]).inc();
            }
        }
    }

    /// Families belonging to one partition.
    #[must_use]
    pub fn gather(&self, checkpoint: Checkpoint) -> Vec<MetricFamily> {
        self.partition(checkpoint).gather()
    }

    /// Render one partition in the text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the families cannot be encoded.
    pub fn render(&self, checkpoint: Checkpoint) -> Result<String> {
        encode_text(&self.gather(checkpoint))
    }

    /// Read the current values for one unit.
    #[must_use]
    pub fn snapshot(&self, kind: UnitKind, name: &str) -> UnitSnapshot {
        let collectors = self.collectors(kind);
        let histogram = collectors.processing_time.with_label_values(&[name]);
        UnitSnapshot {
            invocations: collectors.invocations.with_label_values(&[name]).get(),
            in_progress: collectors.in_progress.with_label_values(&[name]).get(),
            finished: collectors.finished.with_label_values(&[name]).get(),
            observations: histogram.get_sample_count(),
            duration_seconds: histogram.get_sample_sum(),
        }
    }

    /// Read the terminal-state counter for one unit and status.
    #[must_use]
    pub fn status_count(&self, kind: UnitKind, name: &str, status: &str) -> u64 {
        self.collectors(kind)
            .status
            .with_label_values(&[name, status])
            .get()
    }

    fn collectors(&self, kind: UnitKind) -> &UnitCollectors {
        match kind {
            UnitKind::Task => &self.inner.task,
            UnitKind::Flow => &self.inner.flow,
        }
    }

    fn partition(&self, checkpoint: Checkpoint) -> &Registry {
        let partitions = &self.inner.partitions;
        match checkpoint {
            Checkpoint::Started => &partitions.started,
            Checkpoint::Interim => &partitions.interim,
            Checkpoint::Final => &partitions.finished,
        }
    }
}
