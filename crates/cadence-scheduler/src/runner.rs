//! Per-tick execution: decide run-or-drop, hand the body to the job thread,
//! and let the watcher thread bound, classify and record the outcome.
//!
//! [`TaskRunner::on_tick`] never blocks. Whatever happens afterwards, the
//! in-flight claim taken here is released exactly once: by the watcher on a
//! classified outcome, by `on_tick` itself when a submission is rejected, or
//! by a drop guard if the watcher is torn down mid-wait.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, TaskError};
use crate::executor::Executor;
use crate::format;
use crate::metrics::WorkerMetrics;
use crate::types::{JobBody, WorkerName};

pub struct TaskRunner {
    name: WorkerName,
    body: JobBody,
    timeout: Duration,
    metrics: Arc<WorkerMetrics>,
    jobs: Arc<Executor>,
    watcher: Arc<Executor>,
}

impl TaskRunner {
    pub fn new(
        name: WorkerName,
        body: JobBody,
        timeout: Duration,
        metrics: Arc<WorkerMetrics>,
        jobs: Arc<Executor>,
        watcher: Arc<Executor>,
    ) -> Self {
        Self {
            name,
            body,
            timeout,
            metrics,
            jobs,
            watcher,
        }
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Handle one tick. `scheduled` is the nominal instant, for logs only.
    pub fn on_tick(&self, scheduled: DateTime<Utc>) {
        // A timed-out body still holding the job thread is an overlap too.
        let holding = self.jobs.active();
        // Claim before submitting so two ticks can never race into one run.
        if holding > 0 || !self.metrics.try_begin() {
            let dropped = self.metrics.record_drop();
            warn!(
                worker = %self.name,
                scheduled = %format::timestamp(scheduled),
                dropped,
                holding,
                "previous run still in flight, tick dropped"
            );
            return;
        }

        let completion = Completion::new(self.name.clone(), Arc::clone(&self.metrics));

        // Invoke the body on the job thread; its synchronous prefix is part
        // of the timed run.
        let body = Arc::clone(&self.body);
        let job = async move {
            AssertUnwindSafe(async move { body().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!(
                        "job body panicked: {}",
                        panic_message(payload.as_ref())
                    ))
                })
        };

        let handle = match self.jobs.spawn(job) {
            Ok(handle) => handle,
            Err(rejected) => {
                completion.record(Err(TaskError::Rejected {
                    reason: rejected.to_string(),
                }));
                return;
            }
        };
        let abort = handle.abort_handle();

        let watch = watch(handle, self.timeout, WatchGuard(completion.clone()));
        if let Err(rejected) = self.watcher.spawn(watch) {
            // Nobody will observe the job, so don't let it run unaccounted.
            abort.abort();
            completion.record(Err(TaskError::Rejected {
                reason: rejected.to_string(),
            }));
        }
    }
}

/// Watcher task: bounded wait on the job, then record.
async fn watch(job: JoinHandle<anyhow::Result<()>>, timeout: Duration, guard: WatchGuard) {
    let outcome = AssertUnwindSafe(classify(job, timeout, guard.0.started()))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(TaskError::Unknown {
                detail: format!("watcher panicked: {}", panic_message(payload.as_ref())),
            })
        });
    guard.0.record(outcome);
}

async fn classify(
    mut job: JoinHandle<anyhow::Result<()>>,
    timeout: Duration,
    started: Instant,
) -> Result<Duration, TaskError> {
    match tokio::time::timeout(timeout, &mut job).await {
        Ok(Ok(Ok(()))) => Ok(started.elapsed()),
        Ok(Ok(Err(cause))) => Err(TaskError::exception(cause)),
        Ok(Err(join)) if join.is_cancelled() => Err(TaskError::Cancelled),
        Ok(Err(join)) => match join.try_into_panic() {
            Ok(payload) => Err(TaskError::exception(anyhow::anyhow!(
                "job panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(join) => Err(TaskError::Unknown {
                detail: join.to_string(),
            }),
        },
        Err(_elapsed) => {
            // Best effort: async bodies stop at their next await, blocking
            // bodies keep the job thread until they return.
            job.abort();
            Err(TaskError::Timeout { timeout })
        }
    }
}

/// Records one run's outcome, at most once.
#[derive(Clone)]
struct Completion(Arc<CompletionState>);

struct CompletionState {
    name: WorkerName,
    metrics: Arc<WorkerMetrics>,
    started_at: DateTime<Utc>,
    started: Instant,
    recorded: AtomicBool,
}

impl Completion {
    fn new(name: WorkerName, metrics: Arc<WorkerMetrics>) -> Self {
        Self(Arc::new(CompletionState {
            name,
            metrics,
            started_at: Utc::now(),
            started: Instant::now(),
            recorded: AtomicBool::new(false),
        }))
    }

    fn started(&self) -> Instant {
        self.0.started
    }

    fn record(&self, outcome: Result<Duration, TaskError>) {
        let state = &self.0;
        if state.recorded.swap(true, Ordering::AcqRel) {
            return;
        }

        match outcome {
            Ok(elapsed) => {
                debug!(
                    worker = %state.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "run completed"
                );
                state.metrics.record_success(elapsed);
            }
            Err(err) => {
                log_failure(&state.name, &err);
                state.metrics.record_failure(err);
            }
        }
        state.metrics.finish(state.started_at);
    }
}

fn log_failure(name: &WorkerName, err: &TaskError) {
    let kind = err.kind();
    match err {
        TaskError::Timeout { timeout } => {
            warn!(worker = %name, %kind, timeout_ms = timeout.as_millis() as u64, "run timed out, cancellation requested");
        }
        TaskError::Exception { cause } => {
            warn!(worker = %name, %kind, error = %format!("{cause:#}"), "run failed");
        }
        TaskError::Rejected { reason } => {
            warn!(worker = %name, %kind, %reason, "run rejected by executor");
        }
        TaskError::Cancelled => {
            info!(worker = %name, %kind, "run cancelled");
        }
        TaskError::Interrupted => {
            warn!(worker = %name, %kind, "watcher interrupted before the run finished");
        }
        TaskError::Unknown { detail } => {
            error!(worker = %name, %kind, %detail, "run ended in an unexpected state");
        }
    }
}

/// Owned by the watcher future. If that future is dropped before it records
/// (runtime torn down mid-wait), the run is closed out as interrupted.
struct WatchGuard(Completion);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.record(Err(TaskError::Interrupted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::ShutdownMode;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        runner: TaskRunner,
        jobs: Arc<Executor>,
        watcher: Arc<Executor>,
    }

    impl Harness {
        fn new(tag: &str, timeout: Duration, body: JobBody) -> Self {
            let jobs = Arc::new(Executor::single_threaded(format!("test-job-{tag}")).unwrap());
            let watcher =
                Arc::new(Executor::single_threaded(format!("test-watch-{tag}")).unwrap());
            let runner = TaskRunner::new(
                WorkerName::new(tag).unwrap(),
                body,
                timeout,
                Arc::new(WorkerMetrics::new()),
                Arc::clone(&jobs),
                Arc::clone(&watcher),
            );
            Self {
                runner,
                jobs,
                watcher,
            }
        }

        fn metrics(&self) -> &WorkerMetrics {
            self.runner.metrics()
        }

        fn tick_and_settle(&self) {
            self.runner.on_tick(Utc::now());
            assert!(
                wait_for(|| !self.metrics().in_flight(), Duration::from_secs(3)),
                "run never settled"
            );
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.jobs.shutdown(ShutdownMode::Forced, Duration::ZERO);
            self.watcher.shutdown(ShutdownMode::Forced, Duration::ZERO);
        }
    }

    fn wait_for(cond: impl Fn() -> bool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn body<F, Fut>(f: F) -> JobBody
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move || f().boxed())
    }

    fn last_kind(h: &Harness) -> Option<ErrorKind> {
        h.metrics().last_error().map(|e| e.kind())
    }

    #[test]
    fn success_records_run_and_start_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let h = Harness::new(
            "ok",
            Duration::from_secs(1),
            body(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        );
        assert!(!h.metrics().in_flight());

        let before = Utc::now();
        h.tick_and_settle();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics().run_count(), 1);
        assert_eq!(h.metrics().error_count(), 0);
        assert!(h.metrics().last_error().is_none());
        assert!(h.metrics().last_run_start().unwrap() >= before);
    }

    #[test]
    fn error_is_an_exception_with_cause() {
        let h = Harness::new(
            "err",
            Duration::from_secs(1),
            body(|| async { Err(anyhow::anyhow!("database unreachable")) }),
        );
        h.tick_and_settle();

        assert_eq!(h.metrics().run_count(), 0);
        assert_eq!(h.metrics().error_count(), 1);
        let err = h.metrics().last_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Exception);
        assert_eq!(err.cause().unwrap().to_string(), "database unreachable");
        assert!(h.metrics().last_run_start().is_some());
    }

    #[test]
    fn panicking_future_is_an_exception() {
        let h = Harness::new(
            "panic",
            Duration::from_secs(1),
            body(|| async { panic!("kaboom") }),
        );
        h.tick_and_settle();

        let err = h.metrics().last_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Exception);
        assert!(err.to_string().contains("kaboom"), "{err}");
    }

    #[test]
    fn panicking_body_factory_is_an_exception() {
        let body: JobBody = Arc::new(|| panic!("no future for you"));
        let h = Harness::new("factory", Duration::from_secs(1), body);
        h.tick_and_settle();

        assert_eq!(h.metrics().error_count(), 1);
        let err = h.metrics().last_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Exception);
        assert!(err.to_string().contains("no future for you"), "{err}");
    }

    #[test]
    fn body_factory_runs_on_job_thread_within_timeout() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&seen);
        let body: JobBody = Arc::new(move || {
            *slot.lock().unwrap() = std::thread::current().name().map(str::to_string);
            // Synchronous work before the future exists.
            std::thread::sleep(Duration::from_millis(300));
            async { Ok(()) }.boxed()
        });
        let h = Harness::new("slow-factory", Duration::from_millis(50), body);

        let began = Instant::now();
        h.runner.on_tick(Utc::now());
        assert!(began.elapsed() < Duration::from_millis(100), "on_tick blocked");

        assert!(wait_for(|| !h.metrics().in_flight(), Duration::from_secs(2)));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("test-job-slow-factory"));
        assert_eq!(last_kind(&h), Some(ErrorKind::Timeout));
        assert_eq!(h.metrics().run_count(), 0);
    }

    #[test]
    fn slow_async_body_times_out_and_is_cancelled() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let h = Harness::new(
            "timeout",
            Duration::from_millis(30),
            body(move || {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        h.tick_and_settle();

        assert_eq!(last_kind(&h), Some(ErrorKind::Timeout));
        assert_eq!(h.metrics().run_count(), 0);
        assert_eq!(h.metrics().error_count(), 1);

        std::thread::sleep(Duration::from_millis(400));
        assert!(!finished.load(Ordering::SeqCst), "aborted body kept running");
    }

    #[test]
    fn blocking_body_times_out_but_holds_the_thread() {
        let h = Harness::new(
            "blocking",
            Duration::from_millis(30),
            body(|| async {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }),
        );
        h.tick_and_settle();
        assert_eq!(last_kind(&h), Some(ErrorKind::Timeout));
        // The job thread is still busy; the abort could not reach it.
        assert_eq!(h.jobs.active(), 1);
        assert!(wait_for(|| h.jobs.active() == 0, Duration::from_secs(2)));
    }

    #[test]
    fn ticks_are_dropped_while_a_timed_out_body_holds_the_thread() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let h = Harness::new(
            "held",
            Duration::from_millis(30),
            body(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(())
                }
            }),
        );
        h.tick_and_settle();
        assert_eq!(last_kind(&h), Some(ErrorKind::Timeout));
        let first_start = h.metrics().last_run_start();

        for _ in 0..3 {
            h.runner.on_tick(Utc::now());
        }
        assert_eq!(h.metrics().dropped_count(), 3);
        assert_eq!(h.metrics().error_count(), 1);
        assert!(!h.metrics().in_flight());
        assert_eq!(h.metrics().last_run_start(), first_start);

        // Once the thread is free, ticks run again.
        assert!(wait_for(|| h.jobs.active() == 0, Duration::from_secs(2)));
        calls.store(0, Ordering::SeqCst);
        h.tick_and_settle();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics().dropped_count(), 3);
    }

    #[test]
    fn overlapping_tick_is_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let h = Harness::new(
            "overlap",
            Duration::from_secs(2),
            body(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                }
            }),
        );

        h.runner.on_tick(Utc::now());
        assert!(h.metrics().in_flight());
        let before_drops = Utc::now();
        h.runner.on_tick(Utc::now());
        h.runner.on_tick(Utc::now());

        assert_eq!(h.metrics().dropped_count(), 2);
        assert!(h.metrics().in_flight());
        assert_eq!(h.metrics().error_count(), 0);
        // Only the accepted run stamps a start time, and only when it ends.
        assert!(h.metrics().last_run_start().is_none());

        assert!(wait_for(|| !h.metrics().in_flight(), Duration::from_secs(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics().run_count(), 1);
        assert_eq!(h.metrics().dropped_count(), 2);
        let stamped = h.metrics().last_run_start().unwrap();
        assert!(stamped <= before_drops);

        // A drop during a later run leaves the previous stamp alone.
        h.runner.on_tick(Utc::now());
        h.runner.on_tick(Utc::now());
        assert_eq!(h.metrics().dropped_count(), 3);
        assert_eq!(h.metrics().last_run_start(), Some(stamped));
        assert!(wait_for(|| !h.metrics().in_flight(), Duration::from_secs(3)));
    }

    #[test]
    fn job_executor_down_is_rejected() {
        let h = Harness::new("rej-job", Duration::from_secs(1), body(|| async { Ok(()) }));
        h.jobs.shutdown(ShutdownMode::Forced, Duration::ZERO);

        let before = Utc::now();
        h.runner.on_tick(Utc::now());

        assert!(!h.metrics().in_flight());
        assert_eq!(last_kind(&h), Some(ErrorKind::Rejected));
        assert_eq!(h.metrics().error_count(), 1);
        assert!(h.metrics().last_run_start().unwrap() >= before);
    }

    #[test]
    fn watcher_executor_down_is_rejected_and_job_aborted() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let h = Harness::new(
            "rej-watch",
            Duration::from_secs(1),
            body(move || {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        h.watcher.shutdown(ShutdownMode::Forced, Duration::ZERO);

        h.runner.on_tick(Utc::now());
        assert!(!h.metrics().in_flight());
        assert_eq!(last_kind(&h), Some(ErrorKind::Rejected));

        std::thread::sleep(Duration::from_millis(250));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn forced_job_shutdown_is_cancelled() {
        let h = Harness::new(
            "cancel",
            Duration::from_secs(5),
            body(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        );
        h.runner.on_tick(Utc::now());
        std::thread::sleep(Duration::from_millis(30));
        h.jobs.shutdown(ShutdownMode::Forced, Duration::ZERO);

        assert!(wait_for(|| !h.metrics().in_flight(), Duration::from_secs(3)));
        assert_eq!(last_kind(&h), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn torn_down_watcher_is_interrupted() {
        let h = Harness::new(
            "interrupt",
            Duration::from_secs(5),
            body(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        );
        h.runner.on_tick(Utc::now());
        std::thread::sleep(Duration::from_millis(30));
        h.watcher.shutdown(ShutdownMode::Forced, Duration::ZERO);

        assert!(wait_for(|| !h.metrics().in_flight(), Duration::from_secs(3)));
        assert_eq!(last_kind(&h), Some(ErrorKind::Interrupted));
        assert_eq!(h.metrics().error_count(), 1);
    }

    #[test]
    fn runs_after_failure_recover() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let h = Harness::new(
            "recover",
            Duration::from_secs(1),
            body(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("first run fails");
                    }
                    Ok(())
                }
            }),
        );
        h.tick_and_settle();
        assert_eq!(last_kind(&h), Some(ErrorKind::Exception));
        h.tick_and_settle();
        assert!(h.metrics().last_error().is_none());
        assert_eq!(h.metrics().run_count(), 1);
        assert_eq!(h.metrics().error_count(), 1);
    }
}
