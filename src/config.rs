//! Configuration loader and validator for the doodle listener.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::extract::ExtractOptions;
use crate::fanout::IngestRules;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub bluesky: Bluesky,
    pub ingest: Ingest,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_seconds: u64,
}

/// Upstream account and service endpoint.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bluesky {
    pub service: String,
    #[serde(default)]
    pub identifier: String,
    /// Usually supplied through `BLUESKY_PASS` rather than the file.
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for Bluesky {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bluesky")
            .field("service", &self.service)
            .field("identifier", &self.identifier)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// What to search for and how to screen it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingest {
    pub hashtag: String,
    pub batch_size: u32,
    pub max_pages: u32,
    pub default_filter: String,
    #[serde(default = "default_skip_tags")]
    pub skip_tags: Vec<String>,
    #[serde(default = "default_skip_labels")]
    pub skip_labels: Vec<String>,
    #[serde(default)]
    pub video_thumbnails: bool,
}

fn default_skip_tags() -> Vec<String> {
    vec!["#nsfw".into(), "#noindex".into(), "#no-index".into()]
}

fn default_skip_labels() -> Vec<String> {
    vec!["sexual".into()]
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// SQLite URL for the store; `DATABASE_URL` wins when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/doodles.db", self.app.resolved_data_dir()))
    }

    pub fn ingest_rules(&self) -> IngestRules {
        IngestRules::new(
            &self.ingest.hashtag,
            &self.ingest.skip_tags,
            &self.ingest.skip_labels,
            ExtractOptions {
                video_thumbnails: self.ingest.video_thumbnails,
            },
        )
    }

    fn apply_env(&mut self) {
        if let Ok(ident) = std::env::var("BLUESKY_IDENT") {
            self.bluesky.identifier = ident;
        }
        if let Ok(pass) = std::env::var("BLUESKY_PASS") {
            self.bluesky.password = pass;
        }
        if let Some(secs) = std::env::var("DOODLE_POLLING_FREQ_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            self.app.poll_interval_seconds = secs;
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }
}

/// Expand a leading `~/` against `$HOME`; other paths are returned unchanged.
pub fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.to_string(),
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_seconds == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_seconds must be > 0"));
    }

    if cfg.bluesky.service.trim().is_empty() {
        return Err(ConfigError::Invalid("bluesky.service must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.bluesky.service).is_err() {
        return Err(ConfigError::Invalid("bluesky.service must be a valid URL"));
    }
    if cfg.bluesky.identifier.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "bluesky.identifier must be non-empty (or set BLUESKY_IDENT)",
        ));
    }
    if cfg.bluesky.password.is_empty() {
        return Err(ConfigError::Invalid(
            "bluesky.password must be non-empty (or set BLUESKY_PASS)",
        ));
    }

    if cfg.ingest.hashtag.trim().is_empty() {
        return Err(ConfigError::Invalid("ingest.hashtag must be non-empty"));
    }
    // searchPosts caps `limit` at 100
    if cfg.ingest.batch_size == 0 || cfg.ingest.batch_size > 100 {
        return Err(ConfigError::Invalid("ingest.batch_size must be within 1..=100"));
    }
    if cfg.ingest.max_pages == 0 {
        return Err(ConfigError::Invalid("ingest.max_pages must be > 0"));
    }
    if cfg.ingest.default_filter.trim().is_empty() {
        return Err(ConfigError::Invalid("ingest.default_filter must be non-empty"));
    }
    if cfg.ingest.skip_tags.iter().any(|t| t.trim().is_empty()) {
        return Err(ConfigError::Invalid("ingest.skip_tags must not contain empty entries"));
    }

    Ok(())
}

/// Returns the example YAML content shipped with the listener.
pub fn example() -> &'static str {
    r##"app:
  data_dir: "./data"
  poll_interval_seconds: 300

bluesky:
  service: "https://bsky.social"
  identifier: "doodles.example.com"
  password: "app-password-here"

ingest:
  hashtag: "#DailyDoodle"
  batch_size: 100
  max_pages: 20
  default_filter: "all-doodles"
  skip_tags:
    - "#nsfw"
    - "#noindex"
    - "#no-index"
  skip_labels:
    - "sexual"
  video_thumbnails: false
"##
}
