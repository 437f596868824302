//! Scheduler thread: pull the next tick, sleep until it, hand it off.
//!
//! The thread never runs user code. Its tick callback is expected to return
//! immediately ([`crate::runner::TaskRunner::on_tick`] does); if it panics
//! anyway, the panic is reported and the schedule keeps going.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{panic_message, Result, SchedulerError};

/// Cancelable handle to a running scheduler thread.
pub struct Dispatcher {
    name: String,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the scheduler thread `thread_name`.
    ///
    /// `schedule` is pulled one tick ahead of time; `on_tick` runs on the
    /// scheduler thread at each tick; `on_panic` receives the message of any
    /// panic escaping `on_tick`.
    pub fn start<S, T, P>(
        thread_name: impl Into<String>,
        schedule: S,
        on_tick: T,
        on_panic: P,
    ) -> Result<Self>
    where
        S: Iterator<Item = DateTime<Utc>> + Send + 'static,
        T: Fn(DateTime<Utc>) + Send + 'static,
        P: Fn(String) + Send + 'static,
    {
        let name = thread_name.into();
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|source| SchedulerError::Spawn {
                what: format!("scheduler runtime {name}"),
                source,
            })?;

        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let loop_token = token.clone();
        let loop_finished = Arc::clone(&finished);
        let loop_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(run(schedule, &loop_token, &loop_name, on_tick, on_panic));
                loop_finished.store(true, Ordering::Release);
                info!(scheduler = %loop_name, "schedule finished");
            })
            .map_err(|source| SchedulerError::Spawn {
                what: format!("scheduler thread {name}"),
                source,
            })?;

        Ok(Self {
            name,
            token,
            finished,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop pulling ticks and release the thread. Safe to call repeatedly
    /// and from any thread; failures are logged, never returned.
    pub fn cancel(&self) {
        self.token.cancel();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Cancelled from inside a tick; the loop exits once we return.
            return;
        }
        if handle.join().is_err() {
            error!(scheduler = %self.name, "scheduler thread panicked during teardown");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the scheduler thread has left its loop.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run<S, T, P>(schedule: S, token: &CancellationToken, name: &str, on_tick: T, on_panic: P)
where
    S: Iterator<Item = DateTime<Utc>>,
    T: Fn(DateTime<Utc>),
    P: Fn(String),
{
    for at in schedule {
        // Ticks already in the past fire immediately.
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_tick(at))) {
            let message = panic_message(payload.as_ref());
            warn!(scheduler = %name, error = %message, "tick handler panicked, schedule continues");
            on_panic(message);
        }
    }
}
