use anyhow::{anyhow, Result};
use clap::Parser;
use post_sync::config::{self, SharedConfig};
use post_sync::db;
use post_sync::dispatcher::{DispatchSettings, Dispatcher};
use post_sync::model::PostStatus;
use post_sync::store::SqliteContentStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Replay a status transition for one item and push it to every target"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Local item id
    #[arg(long)]
    item: i64,

    /// Status the item moved to; stored before pushing
    #[arg(long, default_value = "publish")]
    new_status: String,

    /// Status the item moved from
    #[arg(long, default_value = "publish")]
    old_status: String,

    /// Link this already hosted image as the item's featured image before pushing
    #[arg(long)]
    image_url: Option<String>,
}

fn parse_status(s: &str) -> Result<PostStatus> {
    PostStatus::parse_status(s).ok_or_else(|| anyhow!("unknown status: {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let new_status = parse_status(&args.new_status)?;
    let old_status = parse_status(&args.old_status)?;

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteContentStore::new(
        pool.clone(),
        Path::new(&cfg.app.data_dir).join("media"),
    ));
    store.set_status(args.item, new_status).await?;
    if let Some(url) = args.image_url.as_deref() {
        store.set_featured_image_url(args.item, url).await?;
        info!(item = args.item, url, "featured image linked");
    }
    let dispatcher = Dispatcher::new(
        pool,
        store,
        Arc::new(SharedConfig::new(cfg.clone())),
        DispatchSettings::from_config(&cfg),
    );

    let outcomes = dispatcher
        .on_transition(new_status, old_status, args.item)
        .await?;
    if outcomes.is_empty() {
        info!(item = args.item, "nothing pushed");
    }
    for o in &outcomes {
        println!(
            "{}\t{}\t{}\t{:.3}s\t{}",
            o.target_url,
            o.status.as_str(),
            o.target_post_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            o.elapsed.as_secs_f64(),
            o.message
        );
    }
    Ok(())
}
