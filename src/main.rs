use anyhow::{Context, Result};
use clap::Parser;
use post_sync::config::{self, SharedConfig};
use post_sync::db;
use post_sync::dispatcher::{DispatchSettings, Dispatcher, DELIVERY_TIMEOUT};
use post_sync::media::HttpMediaFetcher;
use post_sync::model::Mode;
use post_sync::outbox;
use post_sync::receiver::Receiver;
use post_sync::store::SqliteContentStore;
use post_sync::translate::{OpenAiClient, TranslationClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let shared = SharedConfig::new(cfg.clone());
    let store = Arc::new(SqliteContentStore::new(
        pool.clone(),
        Path::new(&cfg.app.data_dir).join("media"),
    ));
    let translator = TranslationClient::new(Arc::new(OpenAiClient::from_settings(&cfg.translation)?));
    let media = Arc::new(HttpMediaFetcher::new(DELIVERY_TIMEOUT));

    if cfg.mode == Mode::Host && cfg.app.max_retry_attempts > 0 {
        let dispatcher = Dispatcher::new(
            pool.clone(),
            store.clone(),
            Arc::new(shared.clone()),
            DispatchSettings::from_config(&cfg),
        );
        let worker_pool = pool.clone();
        let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
        let max_attempts = cfg.app.max_retry_attempts;
        let max_backoff = cfg.app.max_backoff_seconds as i64;
        tokio::spawn(async move {
            loop {
                match outbox::process_next_retry(&worker_pool, &dispatcher, max_attempts, max_backoff)
                    .await
                {
                    Ok(processed) => {
                        if !processed {
                            tokio::time::sleep(poll_sleep).await;
                        }
                    }
                    Err(err) => {
                        error!(?err, "retry worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        let shared = shared.clone();
        let path = args.config.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hangups) = signal(SignalKind::hangup()) else {
                return;
            };
            while hangups.recv().await.is_some() {
                match shared.reload(&path) {
                    Ok(()) => info!(path = %path.display(), "configuration reloaded"),
                    Err(err) => error!(%err, "configuration reload failed; keeping current"),
                }
            }
        });
    }

    let receiver = Arc::new(Receiver::new(
        pool,
        store,
        Arc::new(shared),
        translator,
        media,
    ));
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind_addr))?;

    info!(mode = cfg.mode.as_str(), "starting post sync node");
    receiver
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
}
