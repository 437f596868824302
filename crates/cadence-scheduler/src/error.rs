use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::format;

/// Errors surfaced synchronously to callers of the scheduling machinery.
///
/// Only worker start can fail this way; everything that happens after a
/// worker is running is recorded as a [`TaskError`] instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A required worker field was not supplied.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    /// A worker field was supplied but is out of range or conflicting.
    #[error("Invalid worker config: {0}")]
    InvalidConfig(String),

    /// A worker thread or runtime could not be created.
    #[error("Failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::MissingField { .. } => "MISSING_FIELD",
            SchedulerError::InvalidConfig(_) => "INVALID_CONFIG",
            SchedulerError::Spawn { .. } => "SPAWN_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Classification of a failed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Exception,
    Rejected,
    Cancelled,
    Interrupted,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Exception => write!(f, "exception"),
            Self::Rejected => write!(f, "rejected"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a tick that did not complete successfully.
///
/// The `Display` text is what operators see in the admin view.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The body outlived its timeout; cancellation was requested.
    #[error("timed out after {}", format::duration(*.timeout))]
    Timeout { timeout: Duration },

    /// The body returned an error or panicked.
    #[error("job failed: {cause:#}")]
    Exception { cause: Arc<anyhow::Error> },

    /// The job or watcher executor refused the submission.
    #[error("executor unavailable: {reason}")]
    Rejected { reason: String },

    /// The job was cancelled before it could finish, e.g. by a forced stop.
    #[error("job was cancelled")]
    Cancelled,

    /// The watcher was torn down while waiting on the job.
    #[error("watcher interrupted while waiting for job")]
    Interrupted,

    /// Anything the classifier did not anticipate.
    #[error("unexpected failure: {detail}")]
    Unknown { detail: String },
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Timeout { .. } => ErrorKind::Timeout,
            TaskError::Exception { .. } => ErrorKind::Exception,
            TaskError::Rejected { .. } => ErrorKind::Rejected,
            TaskError::Cancelled => ErrorKind::Cancelled,
            TaskError::Interrupted => ErrorKind::Interrupted,
            TaskError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn exception(cause: anyhow::Error) -> Self {
        TaskError::Exception {
            cause: Arc::new(cause),
        }
    }

    /// The preserved body error, for `Exception` outcomes.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Exception { cause } => Some(cause),
            _ => None,
        }
    }
}

/// Best-effort text for a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
