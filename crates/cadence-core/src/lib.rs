//! `cadence-core` — configuration and process-level errors shared by the
//! scheduler library and the `cadence` binary.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, LoggingConfig, SchedulerSettings, TaskSettings, WorkerSettings};
pub use error::{CadenceError, Result};
