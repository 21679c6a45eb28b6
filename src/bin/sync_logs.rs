use anyhow::Result;
use clap::Parser;
use post_sync::config;
use post_sync::db;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Print the most recent delivery log entries")]
struct Args {
    /// Path to YAML config file (reads only `app.data_dir`)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Number of entries to show
    #[arg(long, default_value_t = 50)]
    limit: i64,

    /// Only show failed entries
    #[arg(long)]
    failed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let rows = db::recent_logs(&pool, args.limit).await?;
    for row in rows.iter().filter(|r| !args.failed || r.status == "failed") {
        let id_or_dash = |v: Option<i64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{} [{}] {} {} host={} target={} {} ({:.3}s) {}",
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
            row.site_role,
            row.action,
            row.status,
            id_or_dash(row.host_post_id),
            id_or_dash(row.target_post_id),
            row.url,
            row.time_taken,
            row.message
        );
    }
    Ok(())
}
