use super::model::{IdentityMapping, LogRow, RetryTask};
use crate::config::normalize_url;
use crate::model::{DeliveryLogEntry, SyncAction};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url: {}", normalized))?
        .create_if_missing(true)
        .foreign_keys(true)
        // WAL and stricter durability on every connection.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    // Every connection to an in-memory URL is a fresh database, so pin to one
    // that never expires.
    let pool_options = if normalized.starts_with("sqlite::memory") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

/// Create all tables. Run once at startup; every statement is create-if-absent.
pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Identity map
// ---------------------------------------------------------------------------

#[instrument(skip(pool, peer_url))]
pub async fn get_mapping(pool: &Pool, host_post_id: i64, peer_url: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT target_post_id FROM id_map WHERE host_post_id = ? AND peer_url = ?",
    )
    .bind(host_post_id)
    .bind(normalize_url(peer_url))
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[instrument(skip(pool, peer_url))]
pub async fn find_mapping(
    pool: &Pool,
    host_post_id: i64,
    peer_url: &str,
) -> Result<Option<IdentityMapping>> {
    let row = sqlx::query_as::<_, IdentityMapping>(
        "SELECT host_post_id, peer_url, target_post_id, last_synced FROM id_map WHERE host_post_id = ? AND peer_url = ?",
    )
    .bind(host_post_id)
    .bind(normalize_url(peer_url))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Insert or update the mapping for `(host_post_id, peer_url)` in one statement.
#[instrument(skip(pool, peer_url))]
pub async fn save_mapping(
    pool: &Pool,
    host_post_id: i64,
    peer_url: &str,
    target_post_id: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO id_map (host_post_id, peer_url, target_post_id, last_synced) VALUES (?, ?, ?, ?) \
         ON CONFLICT (host_post_id, peer_url) DO UPDATE SET target_post_id = excluded.target_post_id, last_synced = excluded.last_synced",
    )
    .bind(host_post_id)
    .bind(normalize_url(peer_url))
    .bind(target_post_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Delivery log
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn append_log(pool: &Pool, entry: &DeliveryLogEntry) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO sync_logs (site_role, action, host_post_id, target_post_id, url, status, message, time_taken, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(entry.role.as_str())
    .bind(entry.action.as_str())
    .bind(entry.host_post_id)
    .bind(entry.target_post_id)
    .bind(&entry.url)
    .bind(entry.status.as_str())
    .bind(&entry.message)
    .bind(entry.time_taken)
    .bind(entry.created_at)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Newest entries first. For operators only; protocol code never reads the log.
#[instrument(skip_all)]
pub async fn recent_logs(pool: &Pool, limit: i64) -> Result<Vec<LogRow>> {
    let rows = sqlx::query_as::<_, LogRow>(
        "SELECT id, site_role, action, host_post_id, target_post_id, url, status, message, time_taken, created_at \
         FROM sync_logs ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Retry outbox
// ---------------------------------------------------------------------------

#[instrument(skip(pool, target_url, due_at))]
pub async fn enqueue_retry(
    pool: &Pool,
    host_post_id: i64,
    target_url: &str,
    action: SyncAction,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO retry_queue (host_post_id, target_url, action, attempt, due_at) VALUES (?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(host_post_id)
    .bind(normalize_url(target_url))
    .bind(action.as_str())
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn next_due_retry(pool: &Pool) -> Result<Option<RetryTask>> {
    let task = sqlx::query_as::<_, RetryTask>(
        "SELECT id, host_post_id, target_url, action, attempt FROM retry_queue \
         WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(task)
}

#[instrument(skip_all)]
pub async fn delete_retry(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM retry_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (no cap when <= 0).
#[instrument(skip_all)]
pub async fn backoff_retry_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE retry_queue SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

pub async fn count_pending_retries(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, SyncStatus};

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn entry(status: SyncStatus) -> DeliveryLogEntry {
        DeliveryLogEntry {
            role: Role::Target,
            action: SyncAction::Receive,
            host_post_id: None,
            target_post_id: None,
            url: "t.example".into(),
            status,
            message: "invalid key".into(),
            time_taken: 0.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mapping_upsert_keeps_one_row_per_key() {
        let pool = setup_pool().await;
        assert_eq!(get_mapping(&pool, 42, "https://t.example").await.unwrap(), None);

        save_mapping(&pool, 42, "https://t.example", 7).await.unwrap();
        save_mapping(&pool, 42, "https://t.example/", 9).await.unwrap();
        save_mapping(&pool, 42, "https://other.example", 3).await.unwrap();

        assert_eq!(get_mapping(&pool, 42, "https://t.example").await.unwrap(), Some(9));
        assert_eq!(get_mapping(&pool, 42, "https://other.example").await.unwrap(), Some(3));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM id_map WHERE host_post_id = 42")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 2);

        let full = find_mapping(&pool, 42, "https://t.example").await.unwrap().unwrap();
        assert_eq!(full.peer_url, "https://t.example");
        assert_eq!(full.target_post_id, 9);
    }

    #[tokio::test]
    async fn log_is_append_only_with_nullable_ids() {
        let pool = setup_pool().await;
        let a = append_log(&pool, &entry(SyncStatus::Failed)).await.unwrap();
        let mut ok = entry(SyncStatus::Ok);
        ok.host_post_id = Some(42);
        ok.target_post_id = Some(5);
        let b = append_log(&pool, &ok).await.unwrap();
        assert!(b > a);

        let rows = recent_logs(&pool, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, "ok");
        assert_eq!(rows[0].host_post_id, Some(42));
        assert_eq!(rows[1].status, "failed");
        assert_eq!(rows[1].host_post_id, None);
        assert_eq!(rows[1].site_role, "target");
    }

    #[tokio::test]
    async fn retry_backoff_and_delete_flow() {
        let pool = setup_pool().await;
        let id = enqueue_retry(&pool, 42, "https://t.example/", SyncAction::Publish, Utc::now())
            .await
            .unwrap();

        let task = next_due_retry(&pool).await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.target_url, "https://t.example");
        assert_eq!(task.attempt, 0);

        backoff_retry_with_cap(&pool, id, task.attempt, 60).await.unwrap();
        assert!(next_due_retry(&pool).await.unwrap().is_none());
        assert_eq!(count_pending_retries(&pool).await.unwrap(), 1);

        delete_retry(&pool, id).await.unwrap();
        assert_eq!(count_pending_retries(&pool).await.unwrap(), 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(0, 3600), 5);
        assert_eq!(backoff_secs(3, 3600), 40);
        assert_eq!(backoff_secs(20, 3600), 3600);
        assert_eq!(backoff_secs(10, 0), 5120);
    }
}
