use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerSettings;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    dispatch::Dispatcher,
    error::{panic_message, Result, TaskError},
    executor::{Executor, ShutdownReport},
    metrics::WorkerMetrics,
    registry::WorkerRegistry,
    runner::TaskRunner,
    schedule::{NextRun, Schedule},
    types::{ShutdownMode, StartOutcome, StopOutcome, WorkerConfig, WorkerName, WorkerSpec},
};

/// A running worker: its schedule, its two executors and its counters.
pub struct WorkerEntry {
    name: WorkerName,
    instance_id: Uuid,
    started_at: DateTime<Utc>,
    interval: Duration,
    timeout: Duration,
    jitter: Duration,
    metrics: Arc<WorkerMetrics>,
    next_run: Arc<NextRun>,
    jobs: Arc<Executor>,
    watcher: Arc<Executor>,
    dispatcher: Dispatcher,
    stopping: AtomicBool,
}

impl WorkerEntry {
    /// Allocate threads and start ticking. The entry is not registered here.
    pub fn spawn(config: WorkerConfig) -> Result<Self> {
        let WorkerConfig {
            name,
            body,
            interval,
            timeout,
            jitter,
        } = config;

        let jobs = Arc::new(Executor::single_threaded(format!("cadence-job-{name}"))?);
        let watcher = Arc::new(Executor::single_threaded(format!("cadence-watch-{name}"))?);
        let metrics = Arc::new(WorkerMetrics::new());
        let next_run = Arc::new(NextRun::default());
        let started_at = Utc::now();

        let schedule = Schedule::new(started_at, interval, jitter, Arc::clone(&next_run));
        let runner = TaskRunner::new(
            name.clone(),
            body,
            timeout,
            Arc::clone(&metrics),
            Arc::clone(&jobs),
            Arc::clone(&watcher),
        );
        let panic_metrics = Arc::clone(&metrics);
        let dispatcher = Dispatcher::start(
            format!("cadence-sched-{name}"),
            schedule,
            move |at| runner.on_tick(at),
            move |message| {
                panic_metrics.set_last_error(TaskError::Unknown {
                    detail: format!("tick dispatch panicked: {message}"),
                })
            },
        )?;

        Ok(Self {
            name,
            instance_id: Uuid::now_v7(),
            started_at,
            interval,
            timeout,
            jitter,
            metrics,
            next_run,
            jobs,
            watcher,
            dispatcher,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &WorkerName {
        &self.name
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Effective jitter after clamping.
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Most recently realized tick; see [`NextRun`].
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run.get()
    }

    pub fn job_executor(&self) -> &Executor {
        &self.jobs
    }

    pub fn watcher_executor(&self) -> &Executor {
        &self.watcher
    }

    /// True once any of the worker's resources has been released.
    pub fn is_shut_down(&self) -> bool {
        self.dispatcher.is_cancelled() || self.jobs.is_shutdown() || self.watcher.is_shutdown()
    }

    /// Claim the right to stop this entry. Only the first caller gets `true`.
    pub fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::AcqRel)
    }

    /// Tear down in order: schedule, job executor, watcher executor.
    pub fn shutdown(&self, mode: ShutdownMode, grace: Duration) -> (ShutdownReport, ShutdownReport) {
        self.dispatcher.cancel();
        let jobs = self.jobs.shutdown(mode, grace);
        let watcher = self.watcher.shutdown(mode, grace);
        info!(
            worker = %self.name,
            instance = %self.instance_id,
            ?mode,
            ?jobs,
            ?watcher,
            "worker resources released"
        );
        (jobs, watcher)
    }
}

/// Starts, stops and tracks workers.
pub struct WorkerManager {
    registry: WorkerRegistry,
    grace: Duration,
}

impl WorkerManager {
    pub fn new(settings: &SchedulerSettings) -> Self {
        Self::with_grace(Duration::from_millis(settings.shutdown_grace_ms))
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            grace,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Validate `spec` and start it unless a worker with that name exists.
    ///
    /// Configuration errors are returned before anything is allocated. The
    /// entry becomes visible in the registry only once fully running.
    pub fn start(&self, spec: WorkerSpec) -> Result<StartOutcome> {
        let config = spec.validate()?;
        if self.registry.contains(config.name.as_str()) {
            debug!(worker = %config.name, "worker already running, start ignored");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let entry = Arc::new(WorkerEntry::spawn(config)?);
        match self.registry.insert_if_absent(Arc::clone(&entry)) {
            Ok(()) => {
                info!(
                    worker = %entry.name,
                    instance = %entry.instance_id,
                    interval_ms = entry.interval.as_millis() as u64,
                    timeout_ms = entry.timeout.as_millis() as u64,
                    jitter_ms = entry.jitter.as_millis() as u64,
                    "worker started"
                );
                Ok(StartOutcome::Started)
            }
            Err(entry) => {
                debug!(worker = %entry.name, "lost start race, releasing duplicate");
                entry.shutdown(ShutdownMode::Forced, Duration::ZERO);
                Ok(StartOutcome::AlreadyRunning)
            }
        }
    }

    /// Graceful stop: let the current run finish within the grace window.
    pub fn stop(&self, name: &str) -> StopOutcome {
        self.stop_with(name, ShutdownMode::Graceful)
    }

    /// Cancel the current run immediately.
    pub fn force_stop(&self, name: &str) -> StopOutcome {
        self.stop_with(name, ShutdownMode::Forced)
    }

    pub fn stop_with(&self, name: &str, mode: ShutdownMode) -> StopOutcome {
        let Some(entry) = WorkerName::new(name).and_then(|n| self.registry.get(n.as_str())) else {
            debug!(worker = name.trim(), "stop requested for unknown worker");
            return StopOutcome::NotFound;
        };
        if !entry.begin_stop() {
            debug!(worker = %entry.name, "worker already being stopped");
            return StopOutcome::NotFound;
        }

        let teardown = catch_unwind(AssertUnwindSafe(|| entry.shutdown(mode, self.grace)));
        // Removal is last so readers never see an entry whose resources
        // vanished without a trace.
        self.registry.remove_entry(&entry);

        match teardown {
            Ok(_) => {
                info!(worker = %entry.name, instance = %entry.instance_id, "worker stopped");
                StopOutcome::Stopped
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker = %entry.name, error = %message, "worker teardown panicked");
                StopOutcome::Failed(message)
            }
        }
    }

    /// Stop every registered worker independently.
    pub fn stop_all(&self, mode: ShutdownMode) -> BTreeMap<String, StopOutcome> {
        let names: Vec<String> = self.registry.snapshot().into_keys().collect();
        info!(count = names.len(), ?mode, "stopping all workers");
        names
            .into_iter()
            .map(|name| {
                let outcome = self.stop_with(&name, mode);
                (name, outcome)
            })
            .collect()
    }
}
