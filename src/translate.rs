use crate::chunker;
use crate::config::TranslationSettings;
use crate::model::{PostFields, TranslatedContent};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

const SYSTEM_PROMPT: &str =
    "You translate HTML content preserving structure; do not add extra commentary.";

/// Body chunks translated at the same time for one item.
const CHUNK_CONCURRENCY: usize = 4;

/// Separator between translated body chunks; keeps blocks apart.
pub const CHUNK_JOINER: &str = "\n";

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("translation service returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("translation response has no message content")]
    MissingContent,
}

/// One call to the translation provider.
#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub text: &'a str,
    pub language_name: &'a str,
    pub credential: &'a str,
}

#[async_trait]
pub trait TranslationService: Send + Sync {
    /// Raw provider answer for one request.
    async fn complete(&self, request: TranslationRequest<'_>) -> Result<String, TranslateError>;
}

/// Full name of a supported language code; unknown codes fall back to French.
pub fn language_name(code: &str) -> &'static str {
    match code {
        "es" => "Spanish",
        "hi" => "Hindi",
        _ => "French",
    }
}

const FENCE_INFO: [&str; 2] = ["html", "HTML"];

/// Remove an enclosing Markdown code fence (```` ``` ```` or ```` ```html ````).
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return text.to_string();
    };
    // Drop the info string (e.g. `html`) on the opening line.
    let inner = match inner.split_once('\n') {
        Some((_info, body)) => body,
        None => FENCE_INFO
            .iter()
            .find_map(|info| inner.strip_prefix(info))
            .unwrap_or(inner),
    };
    let inner = inner.trim_end();
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim().to_string()
}

/// Chat-completion backed translation service.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    endpoint: Url,
    model: String,
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    pub fn new(endpoint: Url, model: String, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("post-sync/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint,
            model,
        }
    }

    pub fn from_settings(settings: &TranslationSettings) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&settings.endpoint)?;
        Ok(Self::new(
            endpoint,
            settings.model.clone(),
            Duration::from_secs(settings.timeout_seconds),
        ))
    }

    pub fn build_body(&self, request: &TranslationRequest<'_>) -> Value {
        let prompt = format!(
            "Translate the following HTML-preserving content to {}. Keep HTML structure intact; only translate visible text. Return only the translated HTML.\n\n{}",
            request.language_name, request.text
        );
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
            "temperature": 0.0,
        })
    }

    pub fn build_request(&self, request: &TranslationRequest<'_>) -> reqwest::Result<reqwest::Request> {
        self.http
            .post(self.endpoint.clone())
            .bearer_auth(request.credential)
            .json(&self.build_body(request))
            .build()
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl TranslationService for OpenAiClient {
    async fn complete(&self, request: TranslationRequest<'_>) -> Result<String, TranslateError> {
        let req = self.build_request(&request)?;
        debug!(url = %req.url(), chars = request.text.len(), "sending translation request");
        let res = self.http.execute(req).await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(TranslateError::Upstream { status, body });
        }
        let payload: ChatResponse = res.json().await?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(TranslateError::MissingContent)
    }
}

/// Translation with graceful degradation: any failure leaves the text as is.
#[derive(Clone)]
pub struct TranslationClient {
    service: Arc<dyn TranslationService>,
}

impl fmt::Debug for TranslationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationClient").finish_non_exhaustive()
    }
}

impl TranslationClient {
    pub fn new(service: Arc<dyn TranslationService>) -> Self {
        Self { service }
    }

    /// Translate one field or chunk. Never fails.
    pub async fn translate(&self, text: &str, target_language: &str, credential: &str) -> String {
        if credential.is_empty() || text.trim().is_empty() {
            return text.to_string();
        }
        let request = TranslationRequest {
            text,
            language_name: target_language,
            credential,
        };
        match self.service.complete(request).await {
            Ok(answer) => strip_code_fences(&answer),
            Err(err) => {
                warn!(%err, "translation failed; keeping source text");
                text.to_string()
            }
        }
    }

    /// Translate title and excerpt whole and the body chunk by chunk.
    #[instrument(skip_all, fields(lang = lang_code))]
    pub async fn translate_content(
        &self,
        post: &PostFields,
        lang_code: &str,
        credential: &str,
        chunk_size: usize,
    ) -> TranslatedContent {
        let language = language_name(lang_code);

        // `buffered` keeps results in chunk order.
        let pending: Vec<_> = chunker::chunk(&post.content, chunk_size)
            .map(|part| self.translate(part, language, credential))
            .collect();
        let body_parts: Vec<String> = stream::iter(pending)
            .buffered(CHUNK_CONCURRENCY)
            .collect()
            .await;

        let title = self.translate(&post.title, language, credential).await;
        let excerpt = self.translate(&post.excerpt, language, credential).await;

        TranslatedContent {
            title,
            content: body_parts.join(CHUNK_JOINER),
            excerpt,
            categories: post.categories.clone(),
            tags: post.tags.clone(),
            featured_image: post.featured_image.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TranslationService for Recording {
        async fn complete(&self, request: TranslationRequest<'_>) -> Result<String, TranslateError> {
            self.calls.lock().unwrap().push(request.text.to_string());
            if self.fail {
                return Err(TranslateError::MissingContent);
            }
            Ok(format!("```html\n[{}]{}\n```", request.language_name, request.text))
        }
    }

    fn client(fail: bool) -> (Arc<Recording>, TranslationClient) {
        let svc = Arc::new(Recording {
            fail,
            ..Default::default()
        });
        (svc.clone(), TranslationClient::new(svc))
    }

    #[tokio::test]
    async fn empty_credential_or_text_is_a_noop() {
        let (svc, tc) = client(false);
        assert_eq!(tc.translate("Hello", "French", "").await, "Hello");
        assert_eq!(tc.translate("   ", "French", "sk").await, "   ");
        assert_eq!(tc.translate("", "French", "sk").await, "");
        assert!(svc.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_returns_input() {
        let (svc, tc) = client(true);
        assert_eq!(tc.translate("<p>Hi</p>", "French", "sk").await, "<p>Hi</p>");
        assert_eq!(svc.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn success_strips_fences() {
        let (_svc, tc) = client(false);
        assert_eq!(tc.translate("<p>Hi</p>", "Spanish", "sk").await, "[Spanish]<p>Hi</p>");
    }

    #[tokio::test]
    async fn content_is_translated_per_chunk_in_order() {
        let (svc, tc) = client(false);
        let post = PostFields {
            title: "Title".into(),
            content: "<p>one</p><p>two</p><p>three</p>".into(),
            excerpt: "".into(),
            featured_image: "https://h/img.png".into(),
            ..Default::default()
        };
        let out = tc.translate_content(&post, "hi", "sk", 3).await;
        assert_eq!(
            out.content,
            "[Hindi]<p>one</p>\n[Hindi]<p>two</p>\n[Hindi]<p>three</p>"
        );
        assert_eq!(out.title, "[Hindi]Title");
        assert_eq!(out.excerpt, "");
        assert_eq!(out.featured_image, "https://h/img.png");
        // three chunks plus the title; the empty excerpt is skipped
        assert_eq!(svc.calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn fence_stripping_variants() {
        assert_eq!(strip_code_fences("```\n<p>a</p>\n```"), "<p>a</p>");
        assert_eq!(strip_code_fences("  ```html\n<p>a</p>\n```  "), "<p>a</p>");
        assert_eq!(strip_code_fences("<p>a</p>"), "<p>a</p>");
        assert_eq!(strip_code_fences("```<p>a</p>```"), "<p>a</p>");
        assert_eq!(strip_code_fences("```html<p>a</p>```"), "<p>a</p>");
        assert_eq!(strip_code_fences("```HTML <p>a</p> ```"), "<p>a</p>");
    }

    #[test]
    fn language_names() {
        assert_eq!(language_name("fr"), "French");
        assert_eq!(language_name("es"), "Spanish");
        assert_eq!(language_name("hi"), "Hindi");
        assert_eq!(language_name("xx"), "French");
    }

    #[test]
    fn build_request_sets_auth_and_body() {
        let client = OpenAiClient::new(
            Url::parse("https://api.openai.com/v1/chat/completions").unwrap(),
            "gpt-4o-mini".into(),
            Duration::from_secs(30),
        );
        let req = TranslationRequest {
            text: "<p>Hi</p>",
            language_name: "French",
            credential: "sk-test",
        };
        let request = client.build_request(&req).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v1/chat/completions");
        assert_eq!(
            request.headers().get("Authorization").and_then(|h| h.to_str().ok()),
            Some("Bearer sk-test")
        );
        let body = client.build_body(&req);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("French"));
        assert!(user.ends_with("<p>Hi</p>"));
    }
}
