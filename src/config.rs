use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Base URL of the scraper gateway, e.g. `http://127.0.0.1:7700`.
    pub base_url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_page_size() -> usize {
    20
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Character budget per source query; oversized variant lists are
    /// split into sequential sub-queries under this limit.
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    /// Checkpoint the resume cursor every N examined tweets.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Bounded retry attempts for network/unknown errors per sub-query.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive rate-limit waits tolerated per sub-query before the
    /// session fails.
    #[serde(default = "default_max_rate_limit_waits")]
    pub max_rate_limit_waits: u32,
    /// Cap on any single backoff sleep, in seconds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_query_length: default_max_query_length(),
            checkpoint_interval: default_checkpoint_interval(),
            max_retries: default_max_retries(),
            max_rate_limit_waits: default_max_rate_limit_waits(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_max_query_length() -> usize {
    crate::query::MAX_QUERY_LENGTH
}
fn default_checkpoint_interval() -> u64 {
    50
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_rate_limit_waits() -> u32 {
    10
}
fn default_max_backoff_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, or `webhook` to notify an external embedding service
    /// when a session finishes with new tweets.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            webhook_url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.source.base_url.is_empty() {
        anyhow::bail!("source.base_url must be set");
    }
    if config.source.page_size == 0 {
        anyhow::bail!("source.page_size must be > 0");
    }
    if config.engine.checkpoint_interval == 0 {
        anyhow::bail!("engine.checkpoint_interval must be > 0");
    }
    if config.engine.max_query_length <= 100 {
        anyhow::bail!("engine.max_query_length must be > 100 to leave room for filters");
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "webhook" => {
            if config.embedding.webhook_url.is_none() {
                anyhow::bail!("embedding.webhook_url must be set when provider is 'webhook'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or webhook.",
            other
        ),
    }

    Ok(config)
}
