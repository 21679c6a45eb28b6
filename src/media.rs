use crate::store::FeaturedImage;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;

static FILE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/([\w\-.]+)$").expect("valid file name regex"));

const FALLBACK_FILE_NAME: &str = "featured-image";

/// Downloads remote media referenced by a payload.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FeaturedImage>;
}

/// Last path segment of `url` if it looks like a file name.
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    FILE_NAME
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    http: Client,
}

impl HttpMediaFetcher {
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("post-sync/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { http }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<FeaturedImage> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to download {}", url))?;
        if !res.status().is_success() {
            return Err(anyhow!("download of {} failed with {}", url, res.status()));
        }
        let bytes = res.bytes().await.context("failed to read media body")?;
        Ok(FeaturedImage {
            source_url: url.to_string(),
            file_name: file_name_from_url(url),
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names() {
        assert_eq!(file_name_from_url("https://h.example/wp/cat-1.png"), "cat-1.png");
        assert_eq!(file_name_from_url("https://h.example/a/b.jpg?w=300"), "b.jpg");
        assert_eq!(file_name_from_url("https://h.example/"), FALLBACK_FILE_NAME);
        assert_eq!(file_name_from_url("https://h.example/weird name.png"), FALLBACK_FILE_NAME);
    }
}
