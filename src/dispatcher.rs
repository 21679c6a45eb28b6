//! Host role: push content items to every configured target.
//!
//! Each target is delivered independently. A slow or failing target never
//! holds up the others, and every outcome is logged against its own target.

use crate::config::{normalize_url, Config, ConfigProvider};
use crate::db::{self, Pool};
use crate::error::DeliveryError;
use crate::model::{
    ContentItem, DeliveryLogEntry, Mode, PayloadAction, PostFields, PostStatus, Role, SyncAction,
    SyncPayload, SyncStatus, Target, HEADER_DOMAIN, HEADER_KEY, HEADER_SIGNATURE, RECEIVE_PATH,
    SYNCED_KIND,
};
use crate::signer;
use crate::store::ContentStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::{Client, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Publish, or any change to a published item other than trashing it.
pub fn classify_transition(new_status: PostStatus, old_status: PostStatus) -> Option<SyncAction> {
    if new_status == PostStatus::Publish {
        Some(SyncAction::Publish)
    } else if old_status == PostStatus::Publish && new_status != PostStatus::Trash {
        Some(SyncAction::Update)
    } else {
        None
    }
}

pub fn build_payload(item: &ContentItem, host_site: &str, now: DateTime<Utc>) -> SyncPayload {
    SyncPayload {
        action: PayloadAction::Upsert,
        host_site: normalize_url(host_site),
        host_post_id: item.id,
        post: Some(PostFields {
            title: item.title.clone(),
            content: item.content.clone(),
            excerpt: item.excerpt.clone(),
            categories: item.categories.clone(),
            tags: item.tags.clone(),
            featured_image: item.featured_image_url.clone().unwrap_or_default(),
        }),
        timestamp: now.timestamp(),
    }
}

/// `<target base>/wsts/v1/receive`, keeping any path prefix of the base.
pub fn endpoint_url(target_url: &str) -> Result<Url> {
    let base = Url::parse(&format!("{}/", normalize_url(target_url)))
        .with_context(|| format!("invalid target url: {}", target_url))?;
    base.join(RECEIVE_PATH)
        .with_context(|| format!("invalid target url: {}", target_url))
}

/// Host part of the target URL, else of our own site URL.
pub fn signing_domain(target_url: &str, site_url: &str) -> String {
    let host_of = |u: &str| {
        Url::parse(u.trim())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    };
    host_of(target_url)
        .or_else(|| host_of(site_url))
        .unwrap_or_default()
}

/// `target_post_id` from a receiver reply, accepting numbers or numeric strings.
pub fn parse_target_post_id(body: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(body).ok()?;
    let id = match value.get("target_post_id")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

/// Result of one delivery to one target.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub target_url: String,
    pub endpoint: String,
    pub status: SyncStatus,
    pub http_status: Option<u16>,
    pub target_post_id: Option<i64>,
    pub message: String,
    pub elapsed: Duration,
}

impl DeliveryOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == SyncStatus::Ok
    }
}

/// Tuning knobs taken from the `app` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_retry_attempts: u32,
    pub max_backoff_seconds: i64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout: DELIVERY_TIMEOUT,
            max_retry_attempts: 0,
            max_backoff_seconds: 3600,
        }
    }
}

impl DispatchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            concurrency: cfg.app.dispatch_concurrency.max(1),
            timeout: DELIVERY_TIMEOUT,
            max_retry_attempts: cfg.app.max_retry_attempts,
            max_backoff_seconds: cfg.app.max_backoff_seconds as i64,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    store: Arc<dyn ContentStore>,
    config: Arc<dyn ConfigProvider>,
    http: Client,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ContentStore>,
        config: Arc<dyn ConfigProvider>,
        settings: DispatchSettings,
    ) -> Self {
        let http = Client::builder()
            .user_agent("post-sync/0.1")
            .timeout(settings.timeout)
            .build()
            .expect("reqwest client");
        Self {
            pool,
            store,
            config,
            http,
            settings,
        }
    }

    /// Entry point for the trigger source.
    #[instrument(skip(self))]
    pub async fn on_transition(
        &self,
        new_status: PostStatus,
        old_status: PostStatus,
        item_id: i64,
    ) -> Result<Vec<DeliveryOutcome>> {
        match classify_transition(new_status, old_status) {
            Some(action) => self.push_to_targets(item_id, action).await,
            None => {
                debug!("transition does not trigger a sync");
                Ok(Vec::new())
            }
        }
    }

    /// Deliver the current state of `item_id` to every configured target.
    #[instrument(skip(self))]
    pub async fn push_to_targets(
        &self,
        item_id: i64,
        action: SyncAction,
    ) -> Result<Vec<DeliveryOutcome>> {
        let opts = self.config.options();
        if opts.mode != Mode::Host {
            debug!("not in host mode; skipping push");
            return Ok(Vec::new());
        }
        let Some(item) = self.load_item(item_id).await? else {
            return Ok(Vec::new());
        };
        if opts.targets.is_empty() {
            info!(item_id, "no targets configured");
            return Ok(Vec::new());
        }

        let payload = build_payload(&item, &opts.site_url, Utc::now());
        let body = serde_json::to_vec(&payload).context("failed to serialize payload")?;
        let site_url = opts.site_url.as_str();

        let outcomes: Vec<DeliveryOutcome> = stream::iter(opts.targets.iter())
            .map(|target| self.deliver(target, item_id, action, &body, site_url, true))
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        info!(item_id, ok, failed = outcomes.len() - ok, "push finished");
        Ok(outcomes)
    }

    /// Redeliver one item to one configured target. `None` when the item or
    /// the target no longer exists.
    #[instrument(skip(self, target_url))]
    pub async fn deliver_to(
        &self,
        item_id: i64,
        target_url: &str,
        action: SyncAction,
    ) -> Result<Option<DeliveryOutcome>> {
        let opts = self.config.options();
        if opts.mode != Mode::Host {
            return Ok(None);
        }
        let wanted = normalize_url(target_url);
        let Some(target) = opts
            .targets
            .iter()
            .find(|t| normalize_url(&t.url) == wanted)
        else {
            return Ok(None);
        };
        let Some(item) = self.load_item(item_id).await? else {
            return Ok(None);
        };
        let payload = build_payload(&item, &opts.site_url, Utc::now());
        let body = serde_json::to_vec(&payload).context("failed to serialize payload")?;
        let outcome = self
            .deliver(target, item_id, action, &body, &opts.site_url, false)
            .await;
        Ok(Some(outcome))
    }

    async fn load_item(&self, item_id: i64) -> Result<Option<ContentItem>> {
        let item = self.store.get_item(item_id).await?;
        match item {
            Some(item) if item.kind == SYNCED_KIND => Ok(Some(item)),
            Some(item) => {
                debug!(item_id, kind = %item.kind, "item kind is not synced");
                Ok(None)
            }
            None => {
                warn!(item_id, "item not found; nothing to push");
                Ok(None)
            }
        }
    }

    async fn deliver(
        &self,
        target: &Target,
        item_id: i64,
        action: SyncAction,
        body: &[u8],
        site_url: &str,
        enqueue_on_failure: bool,
    ) -> DeliveryOutcome {
        let start = Instant::now();
        let result = self.send(target, body, site_url).await;
        let elapsed = start.elapsed();

        let endpoint = endpoint_url(&target.url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| target.url.clone());
        let mut outcome = DeliveryOutcome {
            target_url: normalize_url(&target.url),
            endpoint,
            status: SyncStatus::Failed,
            http_status: None,
            target_post_id: None,
            message: String::new(),
            elapsed,
        };

        match result {
            Ok((status, text)) if (200..300).contains(&status) => {
                outcome.http_status = Some(status);
                outcome.status = SyncStatus::Ok;
                outcome.target_post_id = parse_target_post_id(&text);
                outcome.message = format!("HTTP {}: {}", status, text);
            }
            Ok((status, body)) => {
                outcome.http_status = Some(status);
                outcome.message = DeliveryError::Upstream { status, body }.to_string();
            }
            Err(err) => {
                outcome.message = err.to_string();
            }
        }

        if let Some(target_post_id) = outcome.target_post_id {
            if let Err(err) =
                db::save_mapping(&self.pool, item_id, &target.url, target_post_id).await
            {
                warn!(?err, item_id, target = %outcome.target_url, "failed to save mapping");
            }
        }

        if outcome.is_ok() {
            info!(item_id, target = %outcome.target_url, target_post_id = ?outcome.target_post_id, "delivered");
        } else {
            warn!(item_id, target = %outcome.target_url, message = %outcome.message, "delivery failed");
        }

        let entry = DeliveryLogEntry {
            role: Role::Host,
            action,
            host_post_id: Some(item_id),
            target_post_id: outcome.target_post_id,
            url: outcome.endpoint.clone(),
            status: outcome.status,
            message: outcome.message.clone(),
            time_taken: elapsed.as_secs_f64(),
            created_at: Utc::now(),
        };
        if let Err(err) = db::append_log(&self.pool, &entry).await {
            warn!(?err, "failed to write delivery log");
        }

        if !outcome.is_ok() && enqueue_on_failure && self.settings.max_retry_attempts > 0 {
            let delay = db::backoff_secs(0, self.settings.max_backoff_seconds);
            let due_at = Utc::now() + chrono::Duration::seconds(delay);
            if let Err(err) = db::enqueue_retry(&self.pool, item_id, &target.url, action, due_at).await
            {
                warn!(?err, "failed to enqueue retry");
            }
        }

        outcome
    }

    /// POST the signed body; returns HTTP status and response text.
    async fn send(
        &self,
        target: &Target,
        body: &[u8],
        site_url: &str,
    ) -> Result<(u16, String), DeliveryError> {
        let endpoint = endpoint_url(&target.url)
            .map_err(|_| DeliveryError::InvalidTarget(target.url.clone()))?;
        let domain = signing_domain(&target.url, site_url);
        let signature = signer::sign(body, &target.key, &domain);

        let res = self
            .http
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_KEY, &target.key)
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_DOMAIN, domain)
            .body(body.to_vec())
            .send()
            .await?;
        let status = res.status().as_u16();
        let text = res.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn item() -> ContentItem {
        ContentItem {
            id: 42,
            kind: "post".into(),
            status: PostStatus::Publish,
            title: "Hello".into(),
            content: "<p>World</p>".into(),
            excerpt: "Short".into(),
            categories: ["News".to_string()].into_iter().collect(),
            tags: BTreeSet::new(),
            featured_image_url: Some("https://host.example/img/a.png".into()),
        }
    }

    #[test]
    fn transitions() {
        use PostStatus::*;
        assert_eq!(classify_transition(Publish, Draft), Some(SyncAction::Publish));
        assert_eq!(classify_transition(Publish, Publish), Some(SyncAction::Publish));
        assert_eq!(classify_transition(Draft, Publish), Some(SyncAction::Update));
        assert_eq!(classify_transition(Private, Publish), Some(SyncAction::Update));
        assert_eq!(classify_transition(Trash, Publish), None);
        assert_eq!(classify_transition(Draft, Pending), None);
        assert_eq!(classify_transition(Trash, Draft), None);
    }

    #[test]
    fn payload_carries_item_fields() {
        let now = Utc::now();
        let payload = build_payload(&item(), "https://host.example/", now);
        assert_eq!(payload.host_site, "https://host.example");
        assert_eq!(payload.host_post_id, 42);
        assert_eq!(payload.timestamp, now.timestamp());
        let post = payload.post.as_ref().unwrap();
        assert_eq!(post.featured_image, "https://host.example/img/a.png");
        assert!(post.categories.contains("News"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["action"], "upsert");
        assert_eq!(json["post"]["content"], "<p>World</p>");
    }

    #[test]
    fn endpoints_and_domains() {
        assert_eq!(
            endpoint_url("https://t.example").unwrap().as_str(),
            "https://t.example/wsts/v1/receive"
        );
        assert_eq!(
            endpoint_url("https://t.example/blog/").unwrap().as_str(),
            "https://t.example/blog/wsts/v1/receive"
        );
        assert!(endpoint_url("t.example").is_err());

        assert_eq!(signing_domain("https://t.example:8443/x", "https://h.example"), "t.example");
        assert_eq!(signing_domain("nonsense", "https://h.example"), "h.example");
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_target_post_id(r#"{"status":"ok","target_post_id":7}"#), Some(7));
        assert_eq!(parse_target_post_id(r#"{"target_post_id":"12"}"#), Some(12));
        assert_eq!(parse_target_post_id(r#"{"target_post_id":0}"#), None);
        assert_eq!(parse_target_post_id(r#"{"status":"ok"}"#), None);
        assert_eq!(parse_target_post_id("not json"), None);
    }
}
