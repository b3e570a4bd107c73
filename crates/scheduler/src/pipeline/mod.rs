//! Built-in pipeline stages.
//!
//! Four subscribers move a job through its lifecycle:
//! schedule → window-ready → validate → valid, with the valid topic fanning
//! out to the user's execution handler and an independent reschedule loop.
//! Stages communicate only through published messages; each one decodes its
//! own copy of the job.

mod schedule_next_run;
mod window_validator;


pub use self::schedule_next_run::ScheduleNextRun;
pub use self::window_validator::WindowValidator;
