//! Shared test harness: a file-backed SQLite database in a temp dir, the
//! full service container, and a scriptable scrape backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use trawl::config::AppConfig;
use trawl::database::models::{CredentialDbModel, Platform};
use trawl::database::repositories::CredentialRepository;
use trawl::database::{init_pool, run_migrations};
use trawl::scrape::{ScrapeBackend, ScrapeOutcome, ScrapeRequest};
use trawl::services::ServiceContainer;
use trawl::worker::WorkerContext;
use trawl::{Error, Result};

/// What the scripted backend should do for a given request.
#[derive(Debug, Clone)]
pub enum Behave {
    /// Return `n` items successfully.
    Succeed(usize),
    /// Report failure but hand back `n` salvaged items.
    FailPartial(usize, &'static str),
    /// Return an opaque backend error (retried by the queue).
    Transient(&'static str),
    /// Fail the first `fails` calls for the job, then succeed with items.
    TransientThenSucceed { fails: u32, items: usize },
    /// Spin on the cancellation token until it fires.
    BlockUntilCancelled,
}

/// Scrape backend driven by per-window rules.
///
/// Rules are keyed on the request's `date_from` (as `YYYY-MM-DD`), which
/// is stable across queue ordering; requests without a matching rule get
/// the default behaviour.
pub struct ScriptedBackend {
    default: Behave,
    rules: HashMap<String, Behave>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedBackend {
    pub fn new(default: Behave) -> Self {
        Self {
            default,
            rules: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rule(mut self, date_from: &str, behave: Behave) -> Self {
        self.rules.insert(date_from.to_string(), behave);
        self
    }

    fn items(n: usize) -> Vec<serde_json::Value> {
        (0..n)
            .map(|i| serde_json::json!({"id": format!("post-{i}"), "text": "hola"}))
            .collect()
    }
}

#[async_trait]
impl ScrapeBackend for ScriptedBackend {
    async fn execute(
        &self,
        request: &ScrapeRequest,
        _credential: &CredentialDbModel,
        cancel: CancellationToken,
    ) -> Result<ScrapeOutcome> {
        let key = request
            .search_params
            .date_from
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let behave = self.rules.get(&key).unwrap_or(&self.default).clone();

        match behave {
            Behave::Succeed(n) => Ok(ScrapeOutcome {
                items: Self::items(n),
                success: true,
                error: None,
            }),
            Behave::FailPartial(n, message) => Ok(ScrapeOutcome {
                items: Self::items(n),
                success: false,
                error: Some(message.to_string()),
            }),
            Behave::Transient(message) => Err(Error::backend(message)),
            Behave::TransientThenSucceed { fails, items } => {
                let mut calls = self.calls.lock().await;
                let seen = calls.entry(request.job_id.clone()).or_insert(0);
                *seen += 1;
                if *seen <= fails {
                    Err(Error::backend("transient failure"))
                } else {
                    Ok(ScrapeOutcome {
                        items: Self::items(items),
                        success: true,
                        error: None,
                    })
                }
            }
            Behave::BlockUntilCancelled => {
                for _ in 0..600 {
                    if cancel.is_cancelled() {
                        return Err(Error::cancelled("cancelled at checkpoint"));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(Error::backend("blocked backend was never cancelled"))
            }
        }
    }
}

/// Full application wiring over a temp-dir database.
pub struct Harness {
    pub container: ServiceContainer,
    pub ctx: Arc<WorkerContext>,
    // Held for the lifetime of the harness so the database and result
    // files survive until the test ends.
    _dir: TempDir,
}

impl Harness {
    pub async fn new(backend: ScriptedBackend) -> Self {
        Self::with_config_tweak(backend, |_| {}).await
    }

    pub async fn with_config_tweak(
        backend: ScriptedBackend,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = AppConfig {
            database_url: format!("sqlite:{}/test.db?mode=rwc", dir.path().display()),
            results_dir: dir.path().join("results"),
            // Tests drive the loop directly; keep the limiter out of the way.
            rate_limit_max_starts: 10_000,
            rate_limit_window_secs: 60,
            ..Default::default()
        };
        tweak(&mut config);

        let pool = init_pool(&config.database_url).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");

        let container =
            ServiceContainer::new(pool, &config, Arc::new(backend)).expect("container");
        let ctx = container.worker_context();
        Self {
            container,
            ctx,
            _dir: dir,
        }
    }

    /// Seed one active credential for a platform.
    pub async fn seed_credential(&self, platform: Platform, username: &str) -> CredentialDbModel {
        let credential = CredentialDbModel::new(platform, username, "secret");
        self.container
            .credentials
            .create(&credential)
            .await
            .expect("seed credential");
        credential
    }

    /// Process queued tasks until the queue has nothing runnable.
    pub async fn drain_queue(&self) {
        while trawl::worker::process_next_task(&self.ctx).await.expect("process task") {}
    }
}
