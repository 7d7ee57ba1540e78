//! Persisted entities (§3) and the `Record` CRUD trait they implement.

pub mod periodic_task;
pub mod queue_control;
pub mod rate_limit;
pub mod record;
pub mod task_run;
pub mod worker;
pub mod workflow_run;

pub use periodic_task::PeriodicTask;
pub use queue_control::QueueControl;
pub use rate_limit::RateLimit;
pub use record::Record;
pub use task_run::{ErrorRecord, TaskRun, TaskStatus};
pub use worker::Worker;
pub use workflow_run::WorkflowRun;
