//! fahrplan-scheduler — recurring jobs as tumbling windows over a message
//! bus.
//!
//! A submitted [`Job`] flows through four pub/sub stages: the schedule
//! stage computes its next execution window, the validator checks the
//! definition is still current, the user's execution handler consumes the
//! validated window, and an independent reschedule loop arms the window
//! after that. Failures ride the bus's two-tier retry model; stale
//! definitions drop their chain quietly.

pub mod builder;
pub mod change;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod topics;
pub mod window;

pub use builder::JobSchedulerBuilder;
pub use change::{ChangeType, JobChangeProvider, NoChangeProvider};
pub use config::WorkerConfig;
pub use error::{ScheduleError, SchedulerError};
pub use job::{Job, JobStatus, JobWindow};
pub use pipeline::{ScheduleNextRun, WindowValidator};
pub use schedule::JobSchedule;
pub use scheduler::JobScheduler;
pub use store::{InMemoryJobStore, JobStore, StoreChangeProvider};
pub use window::{next_window, TimeWindow};
