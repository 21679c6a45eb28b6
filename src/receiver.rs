//! Target role: accept signed payloads and upsert translated copies.

use crate::chunker::strip_tags;
use crate::config::{normalize_url, ConfigProvider, SyncOptions};
use crate::db::{self, Pool};
use crate::error::{AuthError, PayloadError};
use crate::media::MediaFetcher;
use crate::model::{
    DeliveryLogEntry, ErrorReply, ItemDraft, Mode, PostFields, PostStatus, ReceiveReply, Role,
    SyncAction, SyncPayload, SyncStatus, TranslatedContent, HEADER_DOMAIN, HEADER_KEY,
    HEADER_SIGNATURE, HEALTH_PATH, RECEIVE_PATH, SYNCED_KIND,
};
use crate::signer;
use crate::store::ContentStore;
use crate::translate::TranslationClient;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use reqwest::Url;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

const SYNCED_MESSAGE: &str = "synced";

/// Why a receive request was rejected.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("not a target")]
    NotTarget,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("bad payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),
}

impl ReceiveError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReceiveError::NotTarget | ReceiveError::Payload(_) => StatusCode::BAD_REQUEST,
            ReceiveError::Auth(_) => StatusCode::UNAUTHORIZED,
            ReceiveError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short reason sent back to the host.
    pub fn reply_message(&self) -> String {
        match self {
            ReceiveError::NotTarget => "not a target".into(),
            ReceiveError::Auth(err) => err.to_string(),
            ReceiveError::Payload(_) => "bad payload".into(),
            ReceiveError::Store(_) => "store failure".into(),
        }
    }
}

impl IntoResponse for ReceiveError {
    fn into_response(self) -> Response {
        let body = ErrorReply {
            error: self.reply_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Raw request as it arrived on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub key: String,
    pub signature: String,
    pub domain: String,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn from_parts(headers: &HeaderMap, body: &[u8]) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        Self {
            key: header(HEADER_KEY),
            signature: header(HEADER_SIGNATURE),
            domain: header(HEADER_DOMAIN),
            body: body.to_vec(),
        }
    }
}

/// In-process mutex per (host item, host site) so concurrent deliveries of
/// the same item cannot both insert.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<(i64, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, host_post_id: i64, peer_url: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            // Entries only referenced by the map are idle.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry((host_post_id, peer_url.to_string()))
                .or_default()
                .clone()
        };
        slot.lock_owned().await
    }
}

pub struct Receiver {
    pool: Pool,
    store: Arc<dyn ContentStore>,
    config: Arc<dyn ConfigProvider>,
    translator: TranslationClient,
    media: Arc<dyn MediaFetcher>,
    locks: KeyedLocks,
}

impl Receiver {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ContentStore>,
        config: Arc<dyn ConfigProvider>,
        translator: TranslationClient,
        media: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self {
            pool,
            store,
            config,
            translator,
            media,
            locks: KeyedLocks::default(),
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(&format!("/{}", RECEIVE_PATH), post(receive_handler))
            .route(&format!("/{}", HEALTH_PATH), get(health_handler))
            .with_state(self)
    }

    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let router = self.router();
        info!(%addr, "receiver listening");
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Run one request through authentication, parsing, translation and
    /// persistence.
    #[instrument(skip_all, fields(domain = %req.domain))]
    pub async fn receive(&self, req: InboundRequest) -> Result<ReceiveReply, ReceiveError> {
        let start = Instant::now();
        let opts = self.config.options();
        if opts.mode != Mode::Target {
            return Err(ReceiveError::NotTarget);
        }

        if let Err(err) = authenticate(&opts, &req) {
            self.log_failure(None, &req.domain, &err.to_string(), start).await;
            return Err(err.into());
        }

        let payload = match parse_payload(&req.body) {
            Ok(payload) => payload,
            Err(err) => {
                self.log_failure(None, &req.domain, &format!("bad payload: {}", err), start)
                    .await;
                return Err(err.into());
            }
        };

        if opts.max_skew_seconds > 0 {
            let skew = Utc::now().timestamp().abs_diff(payload.timestamp);
            if skew > opts.max_skew_seconds {
                let err = AuthError::StalePayload;
                self.log_failure(Some(payload.host_post_id), &req.domain, &err.to_string(), start)
                    .await;
                return Err(err.into());
            }
        }

        let Some(post) = payload.post.as_ref() else {
            return Err(PayloadError::MissingPost.into());
        };
        let translated = self
            .translator
            .translate_content(post, &opts.translation_lang, &opts.chatgpt_key, opts.chunk_size)
            .await;

        let target_post_id = match self.persist(&payload, &translated).await {
            Ok(id) => id,
            Err(err) => {
                warn!(?err, host_post_id = payload.host_post_id, "failed to persist item");
                let message = format!("store failure: {:#}", err);
                self.log_failure(Some(payload.host_post_id), &opts.site_url, &message, start)
                    .await;
                return Err(ReceiveError::Store(err));
            }
        };

        self.log(DeliveryLogEntry {
            role: Role::Target,
            action: SyncAction::Upsert,
            host_post_id: Some(payload.host_post_id),
            target_post_id: Some(target_post_id),
            url: opts.site_url.clone(),
            status: SyncStatus::Ok,
            message: SYNCED_MESSAGE.into(),
            time_taken: start.elapsed().as_secs_f64(),
            created_at: Utc::now(),
        })
        .await;
        info!(
            host_post_id = payload.host_post_id,
            target_post_id,
            host_site = %payload.host_site,
            "item synced"
        );

        Ok(ReceiveReply {
            status: "ok".into(),
            target_post_id,
        })
    }

    /// Upsert under the keyed lock; returns the local item id.
    async fn persist(
        &self,
        payload: &SyncPayload,
        content: &TranslatedContent,
    ) -> anyhow::Result<i64> {
        let peer_url = normalize_url(&payload.host_site);
        let host_post_id = payload.host_post_id;
        let _guard = self.locks.lock(host_post_id, &peer_url).await;

        let draft = ItemDraft {
            kind: SYNCED_KIND.into(),
            status: PostStatus::Publish,
            title: strip_tags(&content.title).trim().to_string(),
            content: content.content.clone(),
            excerpt: content.excerpt.clone(),
        };

        let id = match db::get_mapping(&self.pool, host_post_id, &peer_url).await? {
            Some(id) if self.store.update_item(id, &draft).await? => {
                debug!(host_post_id, id, "updated mapped item");
                id
            }
            Some(stale) => {
                warn!(host_post_id, stale, "mapped item is gone; inserting a new one");
                self.store.insert_item(&draft).await?
            }
            None => self.store.insert_item(&draft).await?,
        };
        db::save_mapping(&self.pool, host_post_id, &peer_url, id).await?;

        self.store.set_categories(id, &content.categories).await?;
        self.store.set_tags(id, &content.tags).await?;

        let image_url = content.featured_image.trim();
        if !image_url.is_empty() {
            self.import_featured_image(id, image_url).await;
        }
        Ok(id)
    }

    /// Fetch and attach the featured image. Failures are logged and ignored.
    async fn import_featured_image(&self, id: i64, url: &str) -> bool {
        match self.store.get_item(id).await {
            Ok(Some(item)) if item.featured_image_url.as_deref() == Some(url) => {
                debug!(id, url, "featured image unchanged");
                return true;
            }
            Ok(_) => {}
            Err(err) => warn!(?err, id, "failed to read item before image import"),
        }
        let image = match self.media.fetch(url).await {
            Ok(image) => image,
            Err(err) => {
                warn!(?err, id, url, "featured image download failed");
                return false;
            }
        };
        match self.store.set_featured_image(id, &image).await {
            Ok(()) => true,
            Err(err) => {
                warn!(?err, id, url, "featured image attach failed");
                false
            }
        }
    }

    async fn log_failure(
        &self,
        host_post_id: Option<i64>,
        url: &str,
        message: &str,
        start: Instant,
    ) {
        warn!(url, message, "receive rejected");
        self.log(DeliveryLogEntry {
            role: Role::Target,
            action: SyncAction::Receive,
            host_post_id,
            target_post_id: None,
            url: url.to_string(),
            status: SyncStatus::Failed,
            message: message.to_string(),
            time_taken: start.elapsed().as_secs_f64(),
            created_at: Utc::now(),
        })
        .await;
    }

    async fn log(&self, entry: DeliveryLogEntry) {
        if let Err(err) = db::append_log(&self.pool, &entry).await {
            warn!(?err, "failed to write delivery log");
        }
    }
}

/// Key, signature and optional domain checks, in that order.
fn authenticate(opts: &SyncOptions, req: &InboundRequest) -> Result<(), AuthError> {
    if !signer::keys_match(&req.key, &opts.target_key) {
        return Err(AuthError::InvalidKey);
    }
    if !signer::verify(&req.body, &opts.target_key, &req.domain, &req.signature) {
        return Err(AuthError::SignatureMismatch);
    }
    if opts.enforce_domain {
        let own_host = Url::parse(&opts.site_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if !req.domain.eq_ignore_ascii_case(&own_host) {
            return Err(AuthError::DomainMismatch);
        }
    }
    Ok(())
}

fn parse_payload(body: &[u8]) -> Result<SyncPayload, PayloadError> {
    let payload: SyncPayload = serde_json::from_slice(body)?;
    if payload.post.as_ref().map_or(true, PostFields::is_blank) {
        return Err(PayloadError::MissingPost);
    }
    if payload.host_site.trim().is_empty() {
        return Err(PayloadError::Invalid("empty host_site"));
    }
    if payload.host_post_id <= 0 {
        return Err(PayloadError::Invalid("host_post_id must be positive"));
    }
    Ok(payload)
}

async fn receive_handler(
    State(receiver): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = InboundRequest::from_parts(&headers, &body);
    match receiver.receive(req).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn health_handler(State(receiver): State<Arc<Receiver>>) -> Json<serde_json::Value> {
    let mode = receiver.config.options().mode;
    Json(serde_json::json!({
        "status": "ok",
        "mode": mode.as_str(),
    }))
}
