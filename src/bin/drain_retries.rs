use anyhow::{bail, Result};
use clap::Parser;
use post_sync::config::{self, SharedConfig};
use post_sync::db;
use post_sync::dispatcher::{DispatchSettings, Dispatcher};
use post_sync::model::Mode;
use post_sync::outbox;
use post_sync::store::SqliteContentStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Redeliver all pending retry tasks and exit when the queue is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit as soon as only tasks in backoff remain
    #[arg(long)]
    skip_failed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    if cfg.mode != Mode::Host {
        bail!("retry queue is only drained in host mode");
    }
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteContentStore::new(
        pool.clone(),
        Path::new(&cfg.app.data_dir).join("media"),
    ));
    let dispatcher = Dispatcher::new(
        pool.clone(),
        store,
        Arc::new(SharedConfig::new(cfg.clone())),
        DispatchSettings::from_config(&cfg),
    );
    // A zero budget still allows one redelivery per task here.
    let max_attempts = cfg.app.max_retry_attempts.max(1);
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    let remaining = db::count_pending_retries(&pool).await?;
    info!(remaining, "starting retry drain");
    if remaining == 0 {
        info!("no retry tasks, exiting");
        return Ok(());
    }

    let mut processed = 0u64;
    loop {
        match outbox::process_next_retry(&pool, &dispatcher, max_attempts, max_backoff).await {
            Ok(true) => {
                processed += 1;
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                error!(?err, "error processing retry task");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        let remaining = db::count_pending_retries(&pool).await?;
        if remaining == 0 {
            info!(processed, "retry queue drained");
            break;
        }
        if args.skip_failed {
            warn!(remaining, "only tasks in backoff remain; exiting");
            break;
        }
        warn!(remaining, "all remaining tasks are in backoff; waiting");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    Ok(())
}
