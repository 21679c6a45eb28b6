use crate::db::{self, Pool};
use crate::dispatcher::Dispatcher;
use crate::model::SyncAction;
use anyhow::Result;
use tracing::{info, instrument, warn};

/// Redeliver the oldest due retry, if any. Returns whether a task was handled.
///
/// Succeeded, vanished and exhausted tasks are removed; anything else is
/// pushed back with exponential backoff.
#[instrument(skip_all)]
pub async fn process_next_retry(
    pool: &Pool,
    dispatcher: &Dispatcher,
    max_attempts: u32,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(task) = db::next_due_retry(pool).await? else {
        return Ok(false);
    };
    let action = SyncAction::parse_action(&task.action).unwrap_or(SyncAction::Update);

    match dispatcher
        .deliver_to(task.host_post_id, &task.target_url, action)
        .await
    {
        Ok(Some(outcome)) if outcome.is_ok() => {
            db::delete_retry(pool, task.id).await?;
            info!(id = task.id, host_post_id = task.host_post_id, target = %task.target_url, "retry succeeded");
        }
        Ok(None) => {
            db::delete_retry(pool, task.id).await?;
            info!(id = task.id, host_post_id = task.host_post_id, "retry dropped; item or target gone");
        }
        Ok(Some(_)) | Err(_) if task.attempt as u32 + 1 >= max_attempts => {
            db::delete_retry(pool, task.id).await?;
            warn!(id = task.id, host_post_id = task.host_post_id, target = %task.target_url, attempt = task.attempt, "retry attempts exhausted; giving up");
        }
        Ok(Some(outcome)) => {
            warn!(id = task.id, attempt = task.attempt, message = %outcome.message, "retry failed; backoff");
            db::backoff_retry_with_cap(pool, task.id, task.attempt, max_backoff_secs).await?;
        }
        Err(err) => {
            warn!(?err, id = task.id, attempt = task.attempt, "retry errored; backoff");
            db::backoff_retry_with_cap(pool, task.id, task.attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}
