//! Tick generation: an endless, pull-based sequence of execution instants.
//!
//! Without jitter the sequence is `start, start+I, start+2I, …`. With jitter
//! `J` it is a bounded random walk: the first tick lands in `[start,
//! start+J)` and every later tick is `previous + I + [-J, +J)`. Offsets
//! accumulate instead of being re-anchored to `start`, so schedules on
//! different workers drift apart over time and a late pull never triggers a
//! catch-up burst.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// Granularity of intervals, jitter and offsets.
pub const RESOLUTION: Duration = Duration::from_millis(1);

/// Clamp requested jitter into `[0, interval)` at millisecond resolution.
pub fn effective_jitter(interval: Duration, jitter: Duration) -> Duration {
    let interval_ms = interval.as_millis();
    if interval_ms == 0 {
        return Duration::ZERO;
    }
    let jitter_ms = jitter.as_millis().min(interval_ms - 1);
    Duration::from_millis(jitter_ms as u64)
}

/// The most recently realized tick of a schedule.
///
/// Updated when a tick is pulled, which happens before the dispatcher
/// starts waiting for it, so readers can compute "time until next run"
/// while the previous run is still going.
#[derive(Debug, Default)]
pub struct NextRun(RwLock<Option<DateTime<Utc>>>);

impl NextRun {
    pub fn get(&self) -> Option<DateTime<Utc>> {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, at: DateTime<Utc>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }
}

/// One-way tick iterator. Ends only if the clock arithmetic overflows.
#[derive(Debug)]
pub struct Schedule {
    start: DateTime<Utc>,
    interval_ms: i64,
    jitter_ms: i64,
    previous: Option<DateTime<Utc>>,
    next_run: Arc<NextRun>,
}

impl Schedule {
    /// `jitter` is clamped with [`effective_jitter`]; zero disables it.
    pub fn new(
        start: DateTime<Utc>,
        interval: Duration,
        jitter: Duration,
        next_run: Arc<NextRun>,
    ) -> Self {
        let jitter = effective_jitter(interval, jitter);
        Self {
            start,
            interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
            jitter_ms: jitter.as_millis() as i64,
            previous: None,
            next_run,
        }
    }

    pub fn next_run(&self) -> &Arc<NextRun> {
        &self.next_run
    }

    /// Uniform offset in `[lo, hi)` from the calling thread's RNG.
    fn draw(lo: i64, hi: i64) -> i64 {
        if lo >= hi {
            return lo;
        }
        rand::thread_rng().gen_range(lo..hi)
    }
}

impl Iterator for Schedule {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let (base, offset_ms) = match self.previous {
            None => (self.start, Self::draw(0, self.jitter_ms)),
            Some(prev) => (
                prev,
                self.interval_ms
                    .checked_add(Self::draw(-self.jitter_ms, self.jitter_ms))?,
            ),
        };
        let at = base.checked_add_signed(TimeDelta::try_milliseconds(offset_ms)?)?;

        self.previous = Some(at);
        self.next_run.set(at);
        Some(at)
    }
}
