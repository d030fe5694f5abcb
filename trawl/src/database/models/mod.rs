//! Database models.

pub mod credential;
pub mod job;
pub mod queue_task;
pub mod usage_record;

pub use credential::CredentialDbModel;
pub use job::{JobDbModel, JobStatus, JobUpdate, Platform, SearchParams};
pub use queue_task::{QueueTaskDbModel, TaskStatus};
pub use usage_record::UsageRecordDbModel;
