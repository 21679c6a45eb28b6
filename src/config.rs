//! Configuration loader and validator for the post sync node.
use crate::model::{Mode, Target};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 2000;
pub const SUPPORTED_LANGUAGES: &[&str] = &["fr", "es", "hi"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub mode: Mode,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub translation: TranslationSettings,
}

/// Node-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Public base URL of this node; sent as `host_site` when pushing.
    pub site_url: String,
    pub bind_addr: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    /// 0 disables the retry outbox.
    #[serde(default)]
    pub max_retry_attempts: u32,
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
}

/// Settings used in host mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSettings {
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// Settings used in target mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSettings {
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_translation_lang")]
    pub translation_lang: String,
    #[serde(default)]
    pub chatgpt_key: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub enforce_domain: bool,
    /// 0 disables the timestamp window check.
    #[serde(default)]
    pub max_skew_seconds: u64,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            key: String::new(),
            translation_lang: default_translation_lang(),
            chatgpt_key: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            enforce_domain: false,
            max_skew_seconds: 0,
        }
    }
}

/// Chat completion endpoint used for translation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslationSettings {
    #[serde(default = "default_translation_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_translation_model")]
    pub model: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            endpoint: default_translation_endpoint(),
            model: default_translation_model(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_backoff_seconds() -> u64 {
    3600
}

fn default_dispatch_concurrency() -> usize {
    4
}

fn default_translation_lang() -> String {
    "fr".into()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_translation_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".into()
}

fn default_translation_model() -> String {
    "gpt-4o-mini".into()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Default database location inside the data directory.
    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}/post_sync.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }

    /// Snapshot of everything the protocol reads from configuration.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            mode: self.mode,
            site_url: normalize_url(&self.app.site_url),
            targets: self.host.targets.clone(),
            target_key: self.target.key.clone(),
            translation_lang: self.target.translation_lang.clone(),
            chatgpt_key: self.target.chatgpt_key.clone(),
            chunk_size: self.target.chunk_size,
            enforce_domain: self.target.enforce_domain,
            max_skew_seconds: self.target.max_skew_seconds,
        }
    }
}

/// Values the dispatcher and receiver consult on every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub mode: Mode,
    pub site_url: String,
    pub targets: Vec<Target>,
    pub target_key: String,
    pub translation_lang: String,
    pub chatgpt_key: String,
    pub chunk_size: usize,
    pub enforce_domain: bool,
    pub max_skew_seconds: u64,
}

/// Source of the operating mode and credentials. Read fresh per operation.
pub trait ConfigProvider: Send + Sync {
    fn options(&self) -> SyncOptions;
}

/// Configuration held in memory and swappable at runtime.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cfg)),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, cfg: Config) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = cfg;
    }

    /// Re-read and validate the file; the current config is kept on error.
    pub fn reload(&self, path: &Path) -> Result<(), ConfigError> {
        let cfg = load(Some(path))?;
        self.replace(cfg);
        Ok(())
    }
}

impl ConfigProvider for SharedConfig {
    fn options(&self) -> SyncOptions {
        self.snapshot().sync_options()
    }
}

/// Strip trailing slashes so the same peer always yields the same key.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

const KEY_LEN: usize = 20;

/// Random 20 character alphanumeric key for a new target.
pub fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect()
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if Url::parse(cfg.app.site_url.trim()).is_err() {
        return Err(ConfigError::Invalid("app.site_url must be an absolute URL"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.dispatch_concurrency == 0 {
        return Err(ConfigError::Invalid("app.dispatch_concurrency must be > 0"));
    }

    match cfg.mode {
        Mode::Host => {
            for t in &cfg.host.targets {
                if Url::parse(t.url.trim()).is_err() {
                    return Err(ConfigError::Invalid("host.targets[].url must be an absolute URL"));
                }
                if t.key.trim().is_empty() {
                    return Err(ConfigError::Invalid("host.targets[].key must be non-empty"));
                }
            }
        }
        Mode::Target => {
            if cfg.target.key.trim().is_empty() {
                return Err(ConfigError::Invalid("target.key must be non-empty"));
            }
            if !SUPPORTED_LANGUAGES.contains(&cfg.target.translation_lang.as_str()) {
                return Err(ConfigError::Invalid(
                    "target.translation_lang must be one of fr, es, hi",
                ));
            }
            if cfg.target.chunk_size == 0 {
                return Err(ConfigError::Invalid("target.chunk_size must be > 0"));
            }
        }
    }

    if Url::parse(cfg.translation.endpoint.trim()).is_err() {
        return Err(ConfigError::Invalid("translation.endpoint must be an absolute URL"));
    }
    if cfg.translation.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("translation.timeout_seconds must be > 0"));
    }

    Ok(())
}

/// Example configuration for a host node.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  site_url: "https://host.example"
  bind_addr: "0.0.0.0:8080"
  poll_interval_ms: 500
  max_backoff_seconds: 3600
  max_retry_attempts: 0
  dispatch_concurrency: 4

mode: host

host:
  targets:
    - url: "https://t.example"
      key: "Ab3dE6gH9jK2mN5pQ8sT"
    - url: "https://es.t.example/"
      key: "Zy1xW4vU7tS0rQ3pO6nM"

target:
  key: ""
  translation_lang: "fr"
  chatgpt_key: ""
  chunk_size: 2000

translation:
  endpoint: "https://api.openai.com/v1/chat/completions"
  model: "gpt-4o-mini"
  timeout_seconds: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn target_cfg() -> Config {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mode = Mode::Target;
        cfg.target.key = "abc".into();
        cfg
    }

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.mode, Mode::Host);
        assert_eq!(cfg.host.targets.len(), 2);
    }

    #[test]
    fn optional_sections_default() {
        let yaml = r#"app:
  data_dir: "./data"
  site_url: "https://t.example"
  bind_addr: "127.0.0.1:0"
mode: target
target:
  key: "abc"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.target.translation_lang, "fr");
        assert_eq!(cfg.target.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.translation.timeout_seconds, 30);
        assert_eq!(cfg.app.max_retry_attempts, 0);
        assert!(cfg.host.targets.is_empty());
    }

    #[test]
    fn invalid_site_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.site_url = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("site_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_target_entries() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.host.targets[0].key = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("targets[].key")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.host.targets[1].url = "es.t.example".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn target_mode_requires_key_and_known_language() {
        let mut cfg = target_cfg();
        validate(&cfg).unwrap();

        cfg.target.key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("target.key")),
            _ => panic!("wrong error"),
        }

        let mut cfg = target_cfg();
        cfg.target.translation_lang = "de".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = target_cfg();
        cfg.target.chunk_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn sync_options_normalize_site_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.site_url = "https://host.example//".into();
        let opts = cfg.sync_options();
        assert_eq!(opts.site_url, "https://host.example");
        assert_eq!(opts.targets[1].url, "https://es.t.example/");
    }

    #[test]
    fn shared_config_replace_is_visible() {
        let shared = SharedConfig::new(serde_yaml::from_str(example()).unwrap());
        assert_eq!(shared.options().mode, Mode::Host);
        shared.replace(target_cfg());
        assert_eq!(shared.options().mode, Mode::Target);
        assert_eq!(shared.options().target_key, "abc");
    }

    #[test]
    fn generated_keys_are_twenty_alphanumerics() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), 20);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);

        // Letters of both cases and digits all show up over a batch.
        let batch: String = (0..50).map(|_| generate_key()).collect();
        assert!(batch.chars().any(|c| c.is_ascii_uppercase()));
        assert!(batch.chars().any(|c| c.is_ascii_lowercase() && !c.is_ascii_hexdigit()));
        assert!(batch.chars().any(|c| c.is_ascii_digit()));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.host.targets[0].url, "https://t.example");

        let shared = SharedConfig::new(target_cfg());
        shared.reload(&p).unwrap();
        assert_eq!(shared.options().mode, Mode::Host);
    }
}
