//! External-command scrape backend.
//!
//! Runs the browser-automation script as a child process: the request
//! (search term, window, credential) goes in as JSON on stdin, collected
//! items come back as JSON on stdout. Cancellation kills the child, which
//! is the strongest checkpoint an external process can offer between
//! invocations.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ScrapeBackend, ScrapeOutcome, ScrapeRequest, build_search_term};
use crate::database::models::CredentialDbModel;
use crate::{Error, Result};

/// Default command timeout (one hour, matching the queue task ceiling).
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

#[derive(Serialize)]
struct CommandInput<'a> {
    platform: &'a str,
    term: String,
    search_params: &'a crate::database::models::SearchParams,
    username: &'a str,
    secret: &'a str,
    limit: u32,
}

/// Scrape backend that shells out to a configured automation command.
pub struct CommandScrapeBackend {
    command: String,
    timeout: Duration,
}

impl CommandScrapeBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn parse_output(stdout: &[u8]) -> Result<ScrapeOutcome> {
        let text = String::from_utf8_lossy(stdout);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(ScrapeOutcome {
                items: vec![],
                success: true,
                error: None,
            });
        }

        // The script reports either a full outcome object or a bare array
        // of collected items.
        if let Ok(outcome) = serde_json::from_str::<ScrapeOutcome>(trimmed) {
            return Ok(outcome);
        }
        let items: Vec<serde_json::Value> = serde_json::from_str(trimmed)
            .map_err(|e| Error::backend(format!("unparseable backend output: {e}")))?;
        Ok(ScrapeOutcome {
            items,
            success: true,
            error: None,
        })
    }
}

#[async_trait]
impl ScrapeBackend for CommandScrapeBackend {
    async fn execute(
        &self,
        request: &ScrapeRequest,
        credential: &CredentialDbModel,
        cancel: CancellationToken,
    ) -> Result<ScrapeOutcome> {
        let input = CommandInput {
            platform: request.platform.as_str(),
            term: build_search_term(&request.search_params),
            search_params: &request.search_params,
            username: &credential.username,
            secret: &credential.secret,
            limit: request.search_params.effective_limit(),
        };
        let input_json = serde_json::to_vec(&input)?;

        info!(
            job_id = %request.job_id,
            platform = request.platform.as_str(),
            "Spawning scrape command"
        );

        let mut child = Command::new("sh")
            .args(["-c", &self.command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::backend(format!("failed to spawn scrape command: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input_json).await?;
            // Close stdin so the script sees EOF.
            drop(stdin);
        }

        // Drain the pipes concurrently so a chatty script cannot fill the
        // pipe buffer and stall against our wait.
        let stdout_pipe = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(job_id = %request.job_id, "Cancellation observed, killing scrape command");
                let _ = child.kill().await;
                return Err(Error::cancelled("scrape command killed on cancellation"));
            }
            result = tokio::time::timeout(self.timeout, child.wait()) => {
                match result {
                    Ok(status) => status
                        .map_err(|e| Error::backend(format!("scrape command failed: {e}")))?,
                    Err(_) => {
                        let _ = child.kill().await;
                        return Err(Error::backend(format!(
                            "scrape command timed out after {}s",
                            self.timeout.as_secs()
                        )));
                    }
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(Error::backend(format!(
                "scrape command exited with {}: {}",
                status,
                stderr.trim()
            )));
        }

        Self::parse_output(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_item_array() {
        let outcome =
            CommandScrapeBackend::parse_output(br#"[{"id":"1"},{"id":"2"}]"#).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.items.len(), 2);
    }

    #[test]
    fn test_parse_outcome_object() {
        let outcome = CommandScrapeBackend::parse_output(
            br#"{"items":[{"id":"1"}],"success":false,"error":"login failed"}"#,
        )
        .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.error.as_deref(), Some("login failed"));
    }

    #[test]
    fn test_parse_empty_output() {
        let outcome = CommandScrapeBackend::parse_output(b"").unwrap();
        assert!(outcome.success);
        assert!(outcome.items.is_empty());
    }

    #[test]
    fn test_parse_garbage_is_backend_error() {
        assert!(matches!(
            CommandScrapeBackend::parse_output(b"not json"),
            Err(Error::Backend(_))
        ));
    }
}
