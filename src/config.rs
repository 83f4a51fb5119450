//! Configuration types for creator-dl

use crate::error::{Error, Result};
use crate::timer::CheckTimer;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Main configuration for the backend
///
/// Fields are organized into logical sub-configs:
/// - [`storage`](StorageConfig) - data and download directories
/// - [`scheduler`](SchedulerConfig) - worker pool, timeouts, checkpoint policy
/// - [`retry`](RetryConfig) - backoff for transient network failures
/// - [`proxy`](ProxyConfig) - proxy subscription and health thresholds
/// - [`platform`](PlatformConfig) - remote platform API client
/// - [`api`](ApiConfig) - HTTP relay for remote sessions
///
/// Loading the file is the caller's job; every field has a default so an
/// empty JSON object is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data and download directories
    #[serde(default)]
    pub storage: StorageConfig,

    /// Task scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry behavior for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Proxy pool settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Platform API client settings
    #[serde(default)]
    pub platform: PlatformConfig,

    /// HTTP relay settings
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Reject settings the backend cannot run with
    ///
    /// Zero durations would make every task time out or spin the proxy
    /// refresher and timer loops.
    pub fn validate(&self) -> Result<()> {
        let zero = |key: &str| Error::Config {
            message: format!("{} must be greater than zero", key),
            key: Some(key.to_string()),
        };

        if self.scheduler.task_timeout.is_zero() {
            return Err(zero("scheduler.task_timeout"));
        }
        if self.scheduler.timer_tick.is_zero() {
            return Err(zero("scheduler.timer_tick"));
        }
        if self.proxy.refresh_interval.is_some_and(|d| d.is_zero()) {
            return Err(zero("proxy.refresh_interval"));
        }
        if self.platform.request_timeout.is_zero() {
            return Err(zero("platform.request_timeout"));
        }
        if self.platform.page_size == 0 {
            return Err(zero("platform.page_size"));
        }
        if let Some(timer) = &self.scheduler.global_timer {
            timer.validate().map_err(|e| Error::Config {
                message: e.to_string(),
                key: Some("scheduler.global_timer".into()),
            })?;
        }
        Ok(())
    }
}

/// Where state and downloaded content live
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding per-artist artifacts and global overrides (default: "./data")
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root directory for downloaded files (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            download_dir: default_download_dir(),
        }
    }
}

/// Worker pool and task lifecycle settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of tasks executed in parallel (default: 3)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Hard per-attempt timeout; expiry takes the cancellation path (default: 600 seconds)
    #[serde(default = "default_task_timeout", with = "duration_serde")]
    pub task_timeout: Duration,

    /// Number of finished root task trees kept for `tasks` queries (default: 100)
    #[serde(default = "default_max_task_history")]
    pub max_task_history: usize,

    /// When the `last_date` checkpoint is advanced (default: per artist)
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,

    /// Timed checks for artists without their own timer (default: none)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_timer: Option<CheckTimer>,

    /// How often due timers are looked for (default: 60 seconds)
    #[serde(default = "default_timer_tick", with = "duration_serde")]
    pub timer_tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout: default_task_timeout(),
            max_task_history: default_max_task_history(),
            checkpoint: CheckpointPolicy::default(),
            global_timer: None,
            timer_tick: default_timer_tick(),
        }
    }
}

/// Granularity of `last_date` checkpoint updates
///
/// - `PerArtist` writes the checkpoint once, after the whole task tree for an
///   artist finishes. Fewer durable writes; an interrupted pass resumes from the
///   `done` flags but the checkpoint itself lags behind.
/// - `PerPost` advances the checkpoint every time a post completes. More durable
///   writes and a tighter resume point, and relies on the per-artist writer lock
///   because post completions race each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Advance after a full artist pass
    #[default]
    PerArtist,
    /// Advance after each completed post
    PerPost,
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 5 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Proxy pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Source of converted proxy endpoints (default: none, direct connections)
    #[serde(default)]
    pub subscription: SubscriptionConfig,

    /// Endpoints whose name contains any of these keywords are skipped
    #[serde(default = "default_skip_keywords")]
    pub skip_keywords: Vec<String>,

    /// Consecutive failures before an endpoint is degraded (default: 3)
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,

    /// Consecutive failures before an endpoint is dead until refresh (default: 6)
    #[serde(default = "default_dead_after")]
    pub dead_after: u32,

    /// Interval for re-converting the subscription (None = only on startup)
    #[serde(default, with = "option_duration_serde")]
    pub refresh_interval: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            subscription: SubscriptionConfig::default(),
            skip_keywords: default_skip_keywords(),
            degrade_after: default_degrade_after(),
            dead_after: default_dead_after(),
            refresh_interval: None,
        }
    }
}

/// Where converted proxy endpoints come from
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionConfig {
    /// No proxies, every request goes out directly
    #[default]
    None,
    /// Fixed list of proxy URLs (e.g. `http://127.0.0.1:7890`)
    Static {
        /// Proxy URLs
        endpoints: Vec<String>,
    },
    /// Plain-text endpoint list fetched from a URL, one proxy URL per line
    Url {
        /// Subscription URL
        url: String,
    },
}

/// Remote platform API client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Base URL of the platform (default: "https://kemono.cr")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout for API calls (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Number of posts returned per listing page (default: 50)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            page_size: default_page_size(),
            user_agent: default_user_agent(),
        }
    }
}

/// HTTP relay configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:18861)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Enable Swagger UI at /swagger-ui (default: false)
    #[serde(default)]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_workers() -> usize {
    3
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_max_task_history() -> usize {
    100
}

fn default_timer_tick() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_skip_keywords() -> Vec<String> {
    vec!["DIRECT".to_string(), "REJECT".to_string()]
}

fn default_degrade_after() -> u32 {
    3
}

fn default_dead_after() -> u32 {
    6
}

fn default_base_url() -> String {
    "https://kemono.cr".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_page_size() -> usize {
    50
}

fn default_user_agent() -> String {
    concat!("creator-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 18861))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
