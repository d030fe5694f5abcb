//! Credential database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::job::Platform;

/// An automation account usable for one platform.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CredentialDbModel {
    pub id: String,
    pub platform: String,
    pub username: String,
    /// Opaque secret handed to the scrape backend; never logged.
    #[serde(skip_serializing)]
    pub secret: String,
    pub is_active: bool,
    pub last_used_at: Option<String>,
    pub use_count: i64,
    pub daily_use_count: i64,
    /// Running success average in [0, 1].
    pub success_rate: f64,
}

impl CredentialDbModel {
    pub fn new(
        platform: Platform,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: platform.as_str().to_string(),
            username: username.into(),
            secret: secret.into(),
            is_active: true,
            last_used_at: None,
            use_count: 0,
            daily_use_count: 0,
            success_rate: 1.0,
        }
    }
}

/// Running weighted average of the success rate after one more use.
///
/// `rate' = (rate * n + outcome) / (n + 1)` where `outcome` is 1 for a
/// successful use and 0 otherwise. This is the only way the rate moves.
pub fn next_success_rate(current_rate: f64, use_count: i64, success: bool) -> f64 {
    let outcome = if success { 1.0 } else { 0.0 };
    if use_count <= 0 {
        outcome
    } else {
        (current_rate * use_count as f64 + outcome) / (use_count as f64 + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_credential_defaults() {
        let cred = CredentialDbModel::new(Platform::Bluesky, "alice.bsky.social", "hunter2");
        assert!(cred.is_active);
        assert_eq!(cred.use_count, 0);
        assert_eq!(cred.success_rate, 1.0);
        assert!(cred.last_used_at.is_none());
    }

    #[test]
    fn test_first_use_sets_rate_to_outcome() {
        assert_eq!(next_success_rate(1.0, 0, true), 1.0);
        assert_eq!(next_success_rate(1.0, 0, false), 0.0);
    }

    #[test]
    fn test_weighted_average() {
        // 4 successful uses at 1.0, then one failure: 4/5.
        let rate = next_success_rate(1.0, 4, false);
        assert!((rate - 0.8).abs() < 1e-9);

        // 1 failure at 0.0, then one success: 1/2.
        let rate = next_success_rate(0.0, 1, true);
        assert!((rate - 0.5).abs() < 1e-9);
    }
}
