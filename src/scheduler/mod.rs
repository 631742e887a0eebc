//! Cron-driven recurring agent jobs.

pub mod job;
pub mod scheduler;

pub use job::{RunStatus, ScheduledJob, validate_cron};
pub use scheduler::JobScheduler;
