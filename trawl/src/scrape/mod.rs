//! Scrape backend boundary.
//!
//! The actual page scraping lives in an external browser-automation
//! process; this module defines the contract the orchestrator holds it to:
//! take a search request and a credential, call back into the cancellation
//! token at every natural pause point, and return whatever was collected.

pub mod command;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::database::models::{CredentialDbModel, Platform, SearchParams};
use crate::{Error, Result};

/// A scrape request handed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub job_id: String,
    pub platform: Platform,
    pub search_params: SearchParams,
}

/// Outcome of a backend run.
///
/// `success = false` with non-empty `items` is a partial result: the run
/// failed midway but salvaged data worth keeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub items: Vec<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The opaque scraping capability.
///
/// Implementations must poll `cancel` between scroll/page iterations and
/// abort promptly with [`Error::Cancelled`] once it fires. There is no
/// hard preemption: a backend that never reaches a checkpoint cannot be
/// cancelled.
#[async_trait]
pub trait ScrapeBackend: Send + Sync {
    async fn execute(
        &self,
        request: &ScrapeRequest,
        credential: &CredentialDbModel,
        cancel: CancellationToken,
    ) -> Result<ScrapeOutcome>;
}

/// Build the platform search term from the structured criteria.
///
/// Mirrors the search-box syntax of the target platforms: bare keywords,
/// quoted exact phrase, hashtags OR-ed together, `from:` author filter and
/// `since:`/`until:` window. An inverted window is swapped rather than
/// rejected.
pub fn build_search_term(params: &SearchParams) -> String {
    let mut term = String::new();

    if let Some(keywords) = &params.keywords {
        term.push_str(keywords);
    }
    if let Some(phrase) = &params.exact_phrase {
        if !term.is_empty() {
            term.push(' ');
        }
        term.push('"');
        term.push_str(phrase);
        term.push('"');
    }
    if let Some(hashtags) = &params.hashtags {
        if !term.is_empty() {
            term.push(' ');
        }
        term.push_str(&hashtags.split_whitespace().collect::<Vec<_>>().join(" OR "));
    }
    if let Some(author) = &params.author_filter {
        if !term.is_empty() {
            term.push(' ');
        }
        term.push_str("from:");
        term.push_str(author);
    }

    let (mut from, mut to) = (params.date_from, params.date_to);
    if let (Some(f), Some(t)) = (from, to)
        && f > t
    {
        debug!("Inverted date window, swapping");
        (from, to) = (Some(t), Some(f));
    }
    if let Some(f) = from {
        term.push_str(&format!(" since:{}", f.format("%Y-%m-%d")));
    }
    if let Some(t) = to {
        term.push_str(&format!(" until:{}", t.format("%Y-%m-%d")));
    }

    term.trim().to_string()
}

/// Derive a result file name from the search criteria.
///
/// Keeps only filename-safe characters, joins the criteria with
/// underscores and truncates to a sane length before the extension.
pub fn result_file_name(platform: Platform, params: &SearchParams) -> String {
    const MAX_STEM_LEN: usize = 150;

    let mut parts: Vec<String> = vec![platform.as_str().to_string()];
    if let Some(keywords) = &params.keywords {
        parts.push(sanitize_term(keywords));
    }
    if let Some(phrase) = &params.exact_phrase {
        parts.push(sanitize_term(phrase));
    }
    if let Some(hashtags) = &params.hashtags {
        parts.push(sanitize_term(hashtags));
    }
    if let Some(author) = &params.author_filter {
        parts.push(sanitize_term(author));
    }
    if let Some(from) = params.date_from {
        parts.push(from.format("%Y-%m-%d").to_string());
    }
    if let Some(to) = params.date_to {
        parts.push(to.format("%Y-%m-%d").to_string());
    }

    let mut stem = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    stem.truncate(MAX_STEM_LEN);
    format!("{stem}.json")
}

fn sanitize_term(term: &str) -> String {
    term.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect::<String>()
        .to_lowercase()
}

/// Result artifact storage: one directory per platform under a base dir.
pub struct ResultStore {
    base_dir: PathBuf,
}

impl ResultStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn full_path(&self, platform: &str, file_name: &str) -> PathBuf {
        self.base_dir.join(platform).join(file_name)
    }

    /// Persist collected items as pretty-printed JSON. Returns the stored
    /// file name (the job's `file_path`).
    pub async fn save(
        &self,
        platform: Platform,
        file_name: &str,
        items: &[serde_json::Value],
    ) -> Result<String> {
        let dir = self.base_dir.join(platform.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(file_name);
        let content = serde_json::to_vec_pretty(items)?;
        tokio::fs::write(&path, content).await?;

        info!(path = %path.display(), count = items.len(), "Saved result file");
        Ok(file_name.to_string())
    }

    /// Delete a result file. "Already absent" counts as deleted; any other
    /// IO error is surfaced for the caller to retry on a later tick.
    pub async fn delete(&self, platform: &str, file_name: &str) -> Result<()> {
        let path = self.full_path(platform, file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted expired result file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Result file already absent");
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn params() -> SearchParams {
        SearchParams {
            keywords: Some("madrid".to_string()),
            exact_phrase: Some("plaza mayor".to_string()),
            hashtags: Some("#viaje #foto".to_string()),
            author_filter: Some("alice.bsky.social".to_string()),
            date_from: NaiveDate::from_ymd_opt(2025, 7, 1),
            date_to: NaiveDate::from_ymd_opt(2025, 7, 2),
            limit: None,
        }
    }

    #[test]
    fn test_build_search_term() {
        let term = build_search_term(&params());
        assert_eq!(
            term,
            "madrid \"plaza mayor\" #viaje OR #foto from:alice.bsky.social since:2025-07-01 until:2025-07-02"
        );
    }

    #[test]
    fn test_build_search_term_swaps_inverted_window() {
        let mut p = params();
        (p.date_from, p.date_to) = (p.date_to, p.date_from);
        let term = build_search_term(&p);
        assert!(term.contains("since:2025-07-01 until:2025-07-02"));
    }

    #[test]
    fn test_result_file_name_is_safe() {
        let name = result_file_name(Platform::Bluesky, &params());
        assert!(name.starts_with("bluesky_madrid_plaza-mayor_"));
        assert!(name.ends_with("_2025-07-01_2025-07-02.json"));
        assert!(!name.contains(' '));
        assert!(!name.contains('#'));
    }

    #[test]
    fn test_result_file_name_truncates() {
        let p = SearchParams {
            keywords: Some("x".repeat(400)),
            ..Default::default()
        };
        let name = result_file_name(Platform::Twitter, &p);
        assert!(name.len() <= 150 + ".json".len());
    }

    #[tokio::test]
    async fn test_result_store_save_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        let items = vec![serde_json::json!({"id": "1", "text": "hola"})];

        let file_name = store
            .save(Platform::Bluesky, "bluesky_test.json", &items)
            .await
            .unwrap();
        assert!(dir.path().join("bluesky").join(&file_name).exists());

        store.delete("bluesky", &file_name).await.unwrap();
        assert!(!dir.path().join("bluesky").join(&file_name).exists());

        // Deleting again is not an error.
        store.delete("bluesky", &file_name).await.unwrap();
    }
}
