use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lastfm: LastfmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Upstream account, credentials and chunking policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastfmConfig {
    /// The logical user whose friends are tracked.
    #[serde(default)]
    pub username: String,
    /// One or more API keys. Chunks rotate across them once the roster
    /// grows past `rotate_threshold`.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_rotate_threshold")]
    pub rotate_threshold: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_inter_chunk_delay_ms")]
    pub inter_chunk_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Bounded retry policy for transient upstream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "default_activity_interval_secs")]
    pub activity_interval_secs: u64,
    #[serde(default = "default_statistics_interval_secs")]
    pub statistics_interval_secs: u64,
    #[serde(default = "default_roster_interval_secs")]
    pub roster_interval_secs: u64,
    /// Friends with no scrobble inside this window drop out of the live
    /// collection until they scrobble again.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    /// Poll interval while a refresh waits on the listener-fetch guard.
    #[serde(default = "default_busy_poll_ms")]
    pub busy_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default = "default_top_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_store_file")]
    pub store_file: PathBuf,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_recent_ttl_secs")]
    pub recent_ttl_secs: u64,
    #[serde(default = "default_top_ttl_secs")]
    pub top_ttl_secs: u64,
    #[serde(default = "default_listeners_ttl_secs")]
    pub listeners_ttl_secs: u64,
    #[serde(default = "default_preview_ttl_secs")]
    pub preview_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_preview_enabled")]
    pub enabled: bool,
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_hover_debounce_ms")]
    pub hover_debounce_ms: u64,
    /// Remembered positions beyond this restart the clip from zero.
    #[serde(default = "default_resume_limit_secs")]
    pub resume_limit_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for LastfmConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            api_keys: Vec::new(),
            api_base_url: default_api_base_url(),
            rotate_threshold: default_rotate_threshold(),
            chunk_size: default_chunk_size(),
            inter_chunk_delay_ms: default_inter_chunk_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            activity_interval_secs: default_activity_interval_secs(),
            statistics_interval_secs: default_statistics_interval_secs(),
            roster_interval_secs: default_roster_interval_secs(),
            lookback_secs: default_lookback_secs(),
            busy_poll_ms: default_busy_poll_ms(),
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            limit: default_top_limit(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store_file: default_store_file(),
            capacity_bytes: default_capacity_bytes(),
            max_entries: default_max_entries(),
            recent_ttl_secs: default_recent_ttl_secs(),
            top_ttl_secs: default_top_ttl_secs(),
            listeners_ttl_secs: default_listeners_ttl_secs(),
            preview_ttl_secs: default_preview_ttl_secs(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: default_preview_enabled(),
            search_url: default_search_url(),
            hover_debounce_ms: default_hover_debounce_ms(),
            resume_limit_secs: default_resume_limit_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://ws.audioscrobbler.com/2.0/".to_string()
}

fn default_rotate_threshold() -> usize {
    100
}

fn default_chunk_size() -> usize {
    200
}

fn default_inter_chunk_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_activity_interval_secs() -> u64 {
    60
}

fn default_statistics_interval_secs() -> u64 {
    3600
}

fn default_roster_interval_secs() -> u64 {
    6 * 3600
}

fn default_lookback_secs() -> u64 {
    24 * 3600
}

fn default_busy_poll_ms() -> u64 {
    250
}

fn default_period() -> String {
    "7day".to_string()
}

fn default_top_limit() -> u32 {
    50
}

fn default_store_file() -> PathBuf {
    platform::data_dir().join("store.json")
}

fn default_capacity_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_max_entries() -> usize {
    500
}

fn default_recent_ttl_secs() -> u64 {
    55
}

fn default_top_ttl_secs() -> u64 {
    3500
}

fn default_listeners_ttl_secs() -> u64 {
    3600
}

fn default_preview_ttl_secs() -> u64 {
    24 * 3600
}

fn default_preview_enabled() -> bool {
    true
}

fn default_search_url() -> String {
    "https://itunes.apple.com/search".to_string()
}

fn default_hover_debounce_ms() -> u64 {
    350
}

fn default_resume_limit_secs() -> f64 {
    28.0
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl LastfmConfig {
    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
