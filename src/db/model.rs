//! Row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Protocol logic
//! lives in the dispatcher and receiver.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Durable host item id to target item id correspondence for one peer.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct IdentityMapping {
    pub host_post_id: i64,
    pub peer_url: String,
    pub target_post_id: i64,
    pub last_synced: DateTime<Utc>,
}

/// Delivery log row as stored.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct LogRow {
    pub id: i64,
    pub site_role: String,
    pub action: String,
    pub host_post_id: Option<i64>,
    pub target_post_id: Option<i64>,
    pub url: String,
    pub status: String,
    pub message: String,
    pub time_taken: f64,
    pub created_at: DateTime<Utc>,
}

/// Failed delivery waiting in the retry outbox.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RetryTask {
    pub id: i64,
    pub host_post_id: i64,
    pub target_url: String,
    pub action: String,
    pub attempt: i32,
}
