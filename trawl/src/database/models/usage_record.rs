//! Usage record database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// Immutable audit row for one credential use.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageRecordDbModel {
    pub id: String,
    pub credential_id: String,
    pub job_id: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub items_scraped: i64,
    pub duration_seconds: i64,
    pub recorded_at: String,
}

impl UsageRecordDbModel {
    pub fn new(
        credential_id: impl Into<String>,
        job_id: impl Into<String>,
        success: bool,
        items_scraped: i64,
        duration_seconds: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            credential_id: credential_id.into(),
            job_id: job_id.into(),
            success,
            error_message: None,
            items_scraped,
            duration_seconds,
            recorded_at: time::now_rfc3339(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
