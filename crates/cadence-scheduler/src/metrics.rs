//! Per-worker run statistics.
//!
//! Every field is its own synchronized cell; there is no lock across
//! fields. The only ordering guarantee is that `last_run_start` is written
//! before `in_flight` is cleared (release/acquire on `in_flight`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::TaskError;

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    in_flight: AtomicBool,
    run_count: AtomicU64,
    error_count: AtomicU64,
    dropped_count: AtomicU64,
    last_error: RwLock<Option<TaskError>>,
    last_run_start: RwLock<Option<DateTime<Utc>>>,
    last_duration_ms: AtomicU64,
    total_runtime_ms: AtomicU64,
    avg_duration_ms: AtomicU64,
}

/// Point-in-time copy of [`WorkerMetrics`], field by field.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub in_flight: bool,
    pub run_count: u64,
    pub error_count: u64,
    pub dropped_count: u64,
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<TaskError>,
    pub last_run_start: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
    pub total_runtime_ms: u64,
    pub avg_duration_ms: u64,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<TaskError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the worker for one run. `false` means a run is already in flight.
    pub fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Count a skipped tick; returns the new total.
    pub fn record_drop(&self) -> u64 {
        self.dropped_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self, elapsed: Duration) {
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let runs = self.run_count.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self
            .total_runtime_ms
            .fetch_add(ms, Ordering::Relaxed)
            .saturating_add(ms);
        // Nearest-integer average: (total + runs/2) / runs.
        self.avg_duration_ms
            .store(total.saturating_add(runs / 2) / runs, Ordering::Relaxed);
        self.last_duration_ms.store(ms, Ordering::Relaxed);
    }

    /// Durations and averages are left untouched on failure.
    pub fn record_failure(&self, error: TaskError) {
        self.set_last_error(error);
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite the last error without counting a failed run.
    pub fn set_last_error(&self, error: TaskError) {
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Close out a run: stamp its start time, then release the in-flight claim.
    pub fn finish(&self, started: DateTime<Utc>) {
        *self
            .last_run_start
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(started);
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<TaskError> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_run_start(&self) -> Option<DateTime<Utc>> {
        *self
            .last_run_start
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_duration(&self) -> Duration {
        Duration::from_millis(self.last_duration_ms.load(Ordering::Relaxed))
    }

    pub fn total_runtime(&self) -> Duration {
        Duration::from_millis(self.total_runtime_ms.load(Ordering::Relaxed))
    }

    pub fn avg_duration(&self) -> Duration {
        Duration::from_millis(self.avg_duration_ms.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        // in_flight first: if it reads false, the matching last_run_start
        // is already visible.
        let in_flight = self.in_flight();
        MetricsSnapshot {
            in_flight,
            run_count: self.run_count(),
            error_count: self.error_count(),
            dropped_count: self.dropped_count(),
            last_error: self.last_error(),
            last_run_start: self.last_run_start(),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            total_runtime_ms: self.total_runtime_ms.load(Ordering::Relaxed),
            avg_duration_ms: self.avg_duration_ms.load(Ordering::Relaxed),
        }
    }
}
