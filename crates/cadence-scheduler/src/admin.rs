//! Read-only introspection: one display row per registered worker.
//!
//! Nothing here writes to a worker. Rows are assembled field by field from
//! independently updated cells, so a row is not a transactional snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::engine::WorkerEntry;
use crate::error::ErrorKind;
use crate::format;
use crate::registry::WorkerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// A run is in flight.
    Running,
    Idle,
    /// Resources have been released.
    Stopped,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRow {
    pub name: String,
    pub instance_id: Uuid,
    pub status: WorkerStatus,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub jitter_ms: u64,
    pub run_count: u64,
    pub error_count: u64,
    pub dropped_count: u64,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
    pub avg_duration_ms: u64,
    pub uptime_ms: u64,
    /// Since the start of the most recent attempted run.
    pub since_last_run_ms: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Zero when the next tick is already due.
    pub until_next_run_ms: Option<u64>,
}

fn ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Project one entry as of `now`.
pub fn row(entry: &WorkerEntry, now: DateTime<Utc>) -> WorkerRow {
    let metrics = entry.metrics().snapshot();
    let status = if entry.is_shut_down() {
        WorkerStatus::Stopped
    } else if metrics.in_flight {
        WorkerStatus::Running
    } else {
        WorkerStatus::Idle
    };
    let next_run_at = entry.next_run();

    WorkerRow {
        name: entry.name().to_string(),
        instance_id: entry.instance_id(),
        status,
        interval_ms: ms(entry.interval()),
        timeout_ms: ms(entry.timeout()),
        jitter_ms: ms(entry.jitter()),
        run_count: metrics.run_count,
        error_count: metrics.error_count,
        dropped_count: metrics.dropped_count,
        last_error_kind: metrics.last_error.as_ref().map(|e| e.kind()),
        last_error: metrics.last_error.as_ref().map(ToString::to_string),
        last_duration_ms: metrics.last_duration_ms,
        avg_duration_ms: metrics.avg_duration_ms,
        uptime_ms: format::span(entry.started_at(), now).map_or(0, ms),
        since_last_run_ms: metrics
            .last_run_start
            .map(|at| format::span(at, now).map_or(0, ms)),
        next_run_at,
        until_next_run_ms: next_run_at.map(|at| format::span(now, at).map_or(0, ms)),
    }
}

/// Rows for every registered worker, sorted by name.
pub fn rows(registry: &WorkerRegistry) -> Vec<WorkerRow> {
    let now = Utc::now();
    registry
        .snapshot()
        .values()
        .map(|entry| row(entry, now))
        .collect()
}

const HEADERS: [&str; 11] = [
    "NAME", "STATUS", "RUNS", "ERRORS", "DROPPED", "LAST", "AVG", "UPTIME", "SINCE", "NEXT IN",
    "LAST ERROR",
];

fn cells(row: &WorkerRow) -> [String; 11] {
    let last_error = match (&row.last_error_kind, &row.last_error) {
        (Some(kind), Some(message)) => format!("[{kind}] {message}"),
        _ => "-".to_string(),
    };
    [
        row.name.clone(),
        row.status.to_string(),
        row.run_count.to_string(),
        row.error_count.to_string(),
        row.dropped_count.to_string(),
        format::millis(row.last_duration_ms),
        format::millis(row.avg_duration_ms),
        format::millis(row.uptime_ms),
        row.since_last_run_ms.map_or_else(|| "-".into(), format::millis),
        match row.until_next_run_ms {
            None => "-".into(),
            Some(0) => "due".into(),
            Some(left) => format::millis(left),
        },
        last_error,
    ]
}

/// Fixed-width text table; the last column is left unpadded.
pub fn render_table(rows: &[WorkerRow]) -> String {
    if rows.is_empty() {
        return "no workers registered\n".to_string();
    }

    let body: Vec<[String; 11]> = rows.iter().map(cells).collect();
    let mut widths = HEADERS.map(str::len);
    for line in &body {
        for (w, cell) in widths.iter_mut().zip(line) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut push_line = |cols: &[&str]| {
        let last = cols.len() - 1;
        for (i, col) in cols.iter().enumerate() {
            if i == last {
                out.push_str(col);
            } else {
                out.push_str(&format!("{col:<width$}  ", width = widths[i]));
            }
        }
        out.push('\n');
    };

    push_line(&HEADERS[..]);
    for line in &body {
        let cols: Vec<&str> = line.iter().map(String::as_str).collect();
        push_line(&cols[..]);
    }
    out
}
