use std::sync::Arc;

use trawl::config::AppConfig;
use trawl::database;
use trawl::logging;
use trawl::scrape::command::CommandScrapeBackend;
use trawl::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before anything reads them.
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let _log_guard = logging::init(config.log_dir.as_deref());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let scrape_command = config.scrape_command.clone().ok_or_else(|| {
        anyhow::anyhow!("TRAWL_SCRAPE_COMMAND must point at the browser-automation command")
    })?;
    let backend = Arc::new(CommandScrapeBackend::new(scrape_command));

    let container = ServiceContainer::new(pool, &config, backend)?;
    container.start().await?;

    tracing::info!("trawl started; waiting for jobs");

    tokio::signal::ctrl_c().await?;
    container.shutdown().await;

    Ok(())
}
