//! Database repositories.

pub mod credential;
pub mod job;

pub use credential::{CredentialRepository, SqlxCredentialRepository};
pub use job::{JobFilters, JobRepository, SqlxJobRepository};
