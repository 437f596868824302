use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::WorkerSettings;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::schedule;

/// The unit of work a worker runs on every accepted tick.
///
/// Called once per tick on the worker's job thread; the returned future is
/// the run. Bodies report failure through `Err`; panics are caught and
/// classified the same way.
pub type JobBody = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Normalized worker identifier: surrounding whitespace is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkerName(String);

impl WorkerName {
    /// Returns `None` when nothing is left after normalization.
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Worker start request. Every field is optional until [`validate`] runs.
///
/// ```no_run
/// use std::time::Duration;
/// use cadence_scheduler::WorkerSpec;
///
/// let spec = WorkerSpec::new("cache-refresh")
///     .interval(Duration::from_secs(30))
///     .timeout(Duration::from_secs(5))
///     .jitter_fraction(0.1)
///     .body(|| async { Ok(()) });
/// ```
///
/// [`validate`]: WorkerSpec::validate
#[derive(Clone, Default)]
pub struct WorkerSpec {
    name: Option<String>,
    body: Option<JobBody>,
    interval: Option<Duration>,
    timeout: Option<Duration>,
    jitter: Option<Duration>,
    jitter_fraction: Option<f64>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Async body. Cancellation (timeout, forced stop) takes effect at its
    /// next `.await`.
    pub fn body<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.body = Some(Arc::new(move || f().boxed()));
        self
    }

    /// Synchronous body. It occupies the job thread until it returns and
    /// cannot be interrupted; ticks arriving meanwhile are dropped.
    pub fn blocking_body<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.body = Some(Arc::new(move || {
            let f = Arc::clone(&f);
            async move { f() }.boxed()
        }));
        self
    }

    pub fn job_body(mut self, body: JobBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Absolute jitter, in `[0, interval)`. Exclusive with `jitter_fraction`.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Jitter as a fraction of the interval, in `[0, 1)`.
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = Some(fraction);
        self
    }

    /// Check every field and produce the immutable config a worker runs with.
    pub fn validate(self) -> Result<WorkerConfig> {
        let name = self
            .name
            .as_deref()
            .and_then(WorkerName::new)
            .ok_or(SchedulerError::MissingField { field: "name" })?;
        let body = self.body.ok_or(SchedulerError::MissingField { field: "body" })?;
        let interval = self
            .interval
            .ok_or(SchedulerError::MissingField { field: "interval" })?;
        let timeout = self
            .timeout
            .ok_or(SchedulerError::MissingField { field: "timeout" })?;

        if interval < schedule::RESOLUTION {
            return Err(SchedulerError::InvalidConfig(format!(
                "{name}: interval must be at least 1ms, got {interval:?}"
            )));
        }
        if timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(format!(
                "{name}: timeout must be positive"
            )));
        }

        let requested = match (self.jitter, self.jitter_fraction) {
            (Some(_), Some(_)) => {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name}: jitter and jitter_fraction are mutually exclusive"
                )));
            }
            (Some(jitter), None) => {
                if jitter >= interval {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "{name}: jitter {jitter:?} must be less than interval {interval:?}"
                    )));
                }
                jitter
            }
            (None, Some(fraction)) => {
                if !fraction.is_finite() || !(0.0..1.0).contains(&fraction) {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "{name}: jitter_fraction must be in [0, 1), got {fraction}"
                    )));
                }
                interval.mul_f64(fraction)
            }
            (None, None) => Duration::ZERO,
        };

        Ok(WorkerConfig {
            name,
            body,
            interval,
            timeout,
            jitter: schedule::effective_jitter(interval, requested),
        })
    }
}

impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name)
            .field("has_body", &self.body.is_some())
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("jitter", &self.jitter)
            .field("jitter_fraction", &self.jitter_fraction)
            .finish()
    }
}

/// Everything but the body; config files cannot carry code.
impl From<&WorkerSettings> for WorkerSpec {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            name: Some(settings.name.clone()),
            body: None,
            interval: Some(Duration::from_millis(settings.interval_ms)),
            timeout: Some(Duration::from_millis(settings.timeout_ms)),
            jitter: settings.jitter_ms.map(Duration::from_millis),
            jitter_fraction: settings.jitter_fraction,
        }
    }
}

/// Validated, immutable worker configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    pub name: WorkerName,
    pub body: JobBody,
    pub interval: Duration,
    pub timeout: Duration,
    /// Effective jitter, already clamped to `[0, interval)`.
    pub jitter: Duration,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

/// How hard to push when tearing a worker down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Stop accepting work, wait up to the grace window, then force.
    Graceful,
    /// Cancel in-progress work immediately.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    /// A worker with the same normalized name exists; it was left untouched.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotFound,
    /// Teardown panicked; the entry was still removed.
    Failed(String),
}
