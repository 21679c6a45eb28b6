use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Receiver route, relative to a target's base URL.
pub const RECEIVE_PATH: &str = "wsts/v1/receive";
pub const HEALTH_PATH: &str = "wsts/v1/health";
pub const HEADER_KEY: &str = "X-WSTS-Key";
pub const HEADER_SIGNATURE: &str = "X-WSTS-Signature";
pub const HEADER_DOMAIN: &str = "X-WSTS-Domain";

/// Only items of this kind are replicated.
pub const SYNCED_KIND: &str = "post";

/// Which side of the replication protocol this node plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Host,
    Target,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Host => "host",
            Mode::Target => "target",
        }
    }
}

/// Role column of the delivery log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Target,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Target => "target",
        }
    }
}

/// What kind of sync the log entry describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Publish,
    Update,
    Receive,
    Upsert,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Publish => "publish",
            SyncAction::Update => "update",
            SyncAction::Receive => "receive",
            SyncAction::Upsert => "upsert",
        }
    }

    pub fn parse_action(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(SyncAction::Publish),
            "update" => Some(SyncAction::Update),
            "receive" => Some(SyncAction::Receive),
            "upsert" => Some(SyncAction::Upsert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Ok,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Ok => "ok",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Lifecycle state of a content item, as reported by the trigger source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Pending,
    Private,
    Future,
    Publish,
    Trash,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Pending => "pending",
            PostStatus::Private => "private",
            PostStatus::Future => "future",
            PostStatus::Publish => "publish",
            PostStatus::Trash => "trash",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "pending" => Some(PostStatus::Pending),
            "private" => Some(PostStatus::Private),
            "future" => Some(PostStatus::Future),
            "publish" => Some(PostStatus::Publish),
            "trash" => Some(PostStatus::Trash),
            _ => None,
        }
    }
}

/// A configured subscriber node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub key: String,
}

/// Only value of the `action` field on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadAction {
    Upsert,
}

/// Body of `POST /wsts/v1/receive`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPayload {
    pub action: PayloadAction,
    pub host_site: String,
    pub host_post_id: i64,
    pub post: Option<PostFields>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostFields {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub featured_image: String,
}

impl PostFields {
    /// No title, body or excerpt text at all.
    pub fn is_blank(&self) -> bool {
        [&self.title, &self.content, &self.excerpt]
            .iter()
            .all(|s| s.trim().is_empty())
    }
}

/// Content fields after translation. Never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedContent {
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub categories: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub featured_image: String,
}

/// Successful reply from a receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiveReply {
    pub status: String,
    pub target_post_id: i64,
}

/// Rejection reply from a receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReply {
    pub error: String,
}

/// Content item as exposed by the content store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentItem {
    pub id: i64,
    pub kind: String,
    pub status: PostStatus,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub categories: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub featured_image_url: Option<String>,
}

/// Fields written by an insert or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDraft {
    pub kind: String,
    pub status: PostStatus,
    pub title: String,
    pub content: String,
    pub excerpt: String,
}

/// One row of the delivery log, before insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryLogEntry {
    pub role: Role,
    pub action: SyncAction,
    pub host_post_id: Option<i64>,
    pub target_post_id: Option<i64>,
    pub url: String,
    pub status: SyncStatus,
    pub message: String,
    pub time_taken: f64,
    pub created_at: DateTime<Utc>,
}
