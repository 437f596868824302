//! `cadence-scheduler` — periodic named background workers with jitter,
//! overlap prevention and per-run timeouts.
//!
//! # Overview
//!
//! Each worker owns three threads: a scheduler thread that sleeps until the
//! next tick ([`dispatch`]), a job thread that runs the body, and a watcher
//! thread that bounds the wait and records the outcome ([`runner`]).
//! [`engine::WorkerManager`] wires them together and keeps running workers
//! in a [`registry::WorkerRegistry`].
//!
//! # Outcomes
//!
//! | Kind          | Meaning                                            |
//! |---------------|----------------------------------------------------|
//! | `timeout`     | Body outlived its timeout; abort was requested      |
//! | `exception`   | Body returned an error or panicked                 |
//! | `rejected`    | An executor refused the submission                 |
//! | `cancelled`   | The job was cancelled, e.g. by a forced stop       |
//! | `interrupted` | The watcher was torn down before classifying       |
//! | `unknown`     | Anything else                                      |
//!
//! Ticks that arrive while a run is in flight are dropped and counted.

pub mod admin;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod format;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod types;

pub use admin::{WorkerRow, WorkerStatus};
pub use engine::{WorkerEntry, WorkerManager};
pub use error::{ErrorKind, Result, SchedulerError, TaskError};
pub use metrics::{MetricsSnapshot, WorkerMetrics};
pub use registry::WorkerRegistry;
pub use types::{
    JobBody, ShutdownMode, StartOutcome, StopOutcome, WorkerConfig, WorkerName, WorkerSpec,
};
