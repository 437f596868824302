//! Single-thread executors: one dedicated, named OS thread per executor.
//!
//! Each worker owns two of these (job and watcher) so a slow job can only
//! ever starve its own worker.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::types::ShutdownMode;

/// Returned by [`Executor::spawn`] once the executor is shut down. Carries
/// the task back so the caller decides how to account for it.
pub struct Rejected<F> {
    pub task: F,
    pub executor: String,
}

impl<F> fmt::Debug for Rejected<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl<F> fmt::Display for Rejected<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor '{}' is shut down", self.executor)
    }
}

/// What [`Executor::shutdown`] managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReport {
    /// Every submitted task finished before the runtime was released.
    Drained,
    /// Tasks were still running and were cancelled.
    Forced { pending: usize },
    /// An earlier call already shut this executor down.
    AlreadyShutdown,
}

pub struct Executor {
    name: String,
    runtime: Mutex<Option<Runtime>>,
    tracker: TaskTracker,
}

impl Executor {
    /// Build a runtime with exactly one worker thread, named `name`.
    pub fn single_threaded(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(name.clone())
            .enable_all()
            .build()
            .map_err(|source| SchedulerError::Spawn {
                what: format!("executor {name}"),
                source,
            })?;
        debug!(executor = %name, "executor started");
        Ok(Self {
            name,
            runtime: Mutex::new(Some(runtime)),
            tracker: TaskTracker::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a task. Never blocks.
    pub fn spawn<F>(&self, task: F) -> std::result::Result<JoinHandle<F::Output>, Rejected<F>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        match runtime.as_ref() {
            Some(rt) => Ok(self.tracker.spawn_on(task, rt.handle())),
            None => Err(Rejected {
                task,
                executor: self.name.clone(),
            }),
        }
    }

    /// Tasks submitted and not yet finished.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting work and release the thread.
    ///
    /// `Graceful` waits up to `grace` for running tasks, then cancels
    /// whatever is left. `Forced` cancels immediately. Cancellation takes
    /// effect at the task's next `.await`; code that blocks the thread keeps
    /// it until it returns, but no longer holds up the caller.
    pub fn shutdown(&self, mode: ShutdownMode, grace: Duration) -> ShutdownReport {
        let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return ShutdownReport::AlreadyShutdown;
        };
        self.tracker.close();

        let drained = match mode {
            ShutdownMode::Graceful => self.wait_drained(grace),
            ShutdownMode::Forced => self.tracker.is_empty(),
        };
        let pending = self.tracker.len();
        runtime.shutdown_background();

        if drained {
            debug!(executor = %self.name, "executor drained");
            ShutdownReport::Drained
        } else {
            warn!(executor = %self.name, pending, ?mode, "executor force-stopped with tasks in progress");
            ShutdownReport::Forced { pending }
        }
    }

    /// Bounded wait for the tracker to empty.
    ///
    /// Runs on a helper thread with its own timer so it works from any
    /// calling context, and so a task blocking this executor's only thread
    /// cannot stall the grace timer. If the wait cannot complete, shutdown
    /// escalates to forced.
    fn wait_drained(&self, grace: Duration) -> bool {
        let tracker = self.tracker.clone();
        let waiter = std::thread::Builder::new()
            .name(format!("{}-drain", self.name))
            .spawn(move || -> std::io::Result<bool> {
                let rt = Builder::new_current_thread().enable_time().build()?;
                Ok(rt.block_on(async {
                    tokio::time::timeout(grace, tracker.wait()).await.is_ok()
                }))
            });

        match waiter.map(|handle| handle.join()) {
            Ok(Ok(Ok(drained))) => drained,
            Ok(Ok(Err(e))) => {
                warn!(executor = %self.name, error = %e, "drain wait unavailable, escalating to forced");
                false
            }
            Ok(Err(_)) => {
                warn!(executor = %self.name, "drain wait interrupted, escalating to forced");
                false
            }
            Err(e) => {
                warn!(executor = %self.name, error = %e, "could not spawn drain waiter, escalating to forced");
                false
            }
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .field("active", &self.active())
            .finish()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Dropping a Runtime blocks, which panics inside async contexts.
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rt) = runtime {
            rt.shutdown_background();
        }
    }
}
