//! Schedule descriptor and cron expression helpers.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// How a job recurs.
///
/// Either `run_interval_seconds` spaces tumbling windows at a fixed width,
/// or `cron_expression` pins window upper bounds to cron occurrences (with
/// the window width inferred from the cron's own period when no explicit
/// interval is given). A cron expression takes precedence over the interval
/// for window placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSchedule {
    /// Standard 5-field cron expression (e.g. `*/5 * * * *`); 6-field
    /// expressions with a leading seconds column are accepted as-is.
    #[serde(default)]
    pub cron_expression: Option<String>,

    /// Tumbling-window width in seconds. When absent and a cron expression
    /// is set, the width is inferred from two consecutive occurrences.
    #[serde(default)]
    pub run_interval_seconds: Option<i64>,

    /// Delay between a window closing and its dispatch for execution —
    /// models ingestion lag of the data the window covers.
    #[serde(default)]
    pub run_delay_upon_due_time_seconds: Option<i64>,

    /// False makes the job one-shot: no window is ever re-armed.
    #[serde(default)]
    pub periodic: bool,

    /// Hard stop: no window whose upper bound exceeds this is produced.
    #[serde(default)]
    pub schedule_end_time: Option<DateTime<Utc>>,

    /// All windows of this schedule skip staleness validation. Meant to
    /// accompany `schedule_end_time` for bounded backfill chains.
    #[serde(default)]
    pub force_suppress_window_validation: bool,
}

impl JobSchedule {
    /// The post-due-time dispatch delay as a duration.
    pub fn run_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.run_delay_upon_due_time_seconds.unwrap_or(0))
    }
}

/// Normalize a 5-field cron expression to the 6-field form the `cron`
/// crate requires, by prepending a seconds column.
pub(crate) fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Parse a cron expression, normalizing 5-field input first.
pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(&normalize_cron(expression)).map_err(|source| {
        ScheduleError::InvalidCron {
            expression: expression.to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_cron_5_to_6_fields() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 6 * * 1-5"), "0 0 6 * * 1-5");
    }

    #[test]
    fn normalize_cron_leaves_6_fields_alone() {
        assert_eq!(normalize_cron("30 */5 * * * *"), "30 */5 * * * *");
    }

    #[test]
    fn normalize_cron_trims_whitespace() {
        assert_eq!(normalize_cron("  */5 * * * *  "), "0 */5 * * * *");
    }

    #[test]
    fn parse_cron_accepts_standard_expression() {
        assert!(parse_cron("*/5 * * * *").is_ok());
    }

    #[test]
    fn parse_cron_rejects_garbage() {
        assert!(matches!(
            parse_cron("not a cron"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn run_delay_defaults_to_zero() {
        let schedule = JobSchedule::default();
        assert_eq!(schedule.run_delay(), chrono::Duration::zero());

        let schedule = JobSchedule {
            run_delay_upon_due_time_seconds: Some(90),
            ..Default::default()
        };
        assert_eq!(schedule.run_delay(), chrono::Duration::seconds(90));
    }
}
