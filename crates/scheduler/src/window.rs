//! Tumbling-window calculator.
//!
//! Pure and deterministic: the current instant is an explicit argument so
//! callers (and tests) control it. No I/O, no side effects.

use chrono::{DateTime, Utc};

use crate::error::ScheduleError;
use crate::schedule::{parse_cron, JobSchedule};

/// One computed execution window, the half-open range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Compute the next tumbling window after `previous_upper_bound`.
///
/// Without a previous bound the first window is synthesized to end at
/// `now`. With a cron expression the window's upper bound snaps to the
/// first occurrence strictly after the previous bound; the window width is
/// `run_interval_seconds` or, when absent, the cron's own period inferred
/// from two consecutive occurrences anchored at the previous bound (at
/// `now` for a first window).
///
/// Returns `Ok(None)` when the schedule has ended — the upper bound would
/// pass `schedule_end_time`, or a bounded cron has no further occurrence.
/// Later calls with later bounds keep returning `None` from that point on.
pub fn next_window(
    schedule: &JobSchedule,
    previous_upper_bound: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<TimeWindow>, ScheduleError> {
    let cron_schedule = match schedule.cron_expression.as_deref() {
        Some(expression) if !expression.trim().is_empty() => Some(parse_cron(expression)?),
        _ => None,
    };

    let interval_seconds = match schedule.run_interval_seconds {
        Some(seconds) if seconds > 0 => seconds,
        Some(seconds) => return Err(ScheduleError::InvalidInterval(seconds)),
        None => match &cron_schedule {
            None => return Err(ScheduleError::MissingDefinition),
            Some(cron) => {
                let anchor = previous_upper_bound.unwrap_or(now);
                let mut occurrences = cron.after(&anchor);
                match (occurrences.next(), occurrences.next()) {
                    (Some(first), Some(second)) => (second - first).num_seconds(),
                    _ => return Ok(None),
                }
            }
        },
    };
    let interval = chrono::Duration::seconds(interval_seconds);

    let previous = previous_upper_bound.unwrap_or(now - interval);
    let (from, to) = match &cron_schedule {
        Some(cron) => match cron.after(&previous).next() {
            Some(to) => (to - interval, to),
            None => return Ok(None),
        },
        None => (previous, previous + interval),
    };

    if let Some(end) = schedule.schedule_end_time {
        if to > end {
            return Ok(None);
        }
    }
    Ok(Some(TimeWindow { from, to }))
}
