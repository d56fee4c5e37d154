//! Kinobot configuration loader.

use kb_dispatch::queue::{DEFAULT_QUEUE_NAME, DEFAULT_REDIS_URL};
use kb_dispatch::{DEFAULT_MEDIA_UNAVAILABLE_NOTICE, RedisQueueConfig, WorkerConfig};
use kb_telegram::TELEGRAM_API_BASE;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KinobotConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_api_base_url() -> String {
    TELEGRAM_API_BASE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_pop_timeout_ms")]
    pub pop_timeout_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            queue_name: default_queue_name(),
            pop_timeout_ms: default_pop_timeout_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE_NAME.to_string()
}

fn default_pop_timeout_ms() -> u64 {
    1_000
}

fn default_error_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_single_consumer_lock")]
    pub single_consumer_lock: bool,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_media_unavailable_notice")]
    pub media_unavailable_notice: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            single_consumer_lock: default_single_consumer_lock(),
            lock_ttl_secs: default_lock_ttl_secs(),
            media_unavailable_notice: default_media_unavailable_notice(),
        }
    }
}

fn default_single_consumer_lock() -> bool {
    true
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_media_unavailable_notice() -> String {
    DEFAULT_MEDIA_UNAVAILABLE_NOTICE.to_string()
}

impl KinobotConfig {
    /// Reads the TOML file, applies environment overrides, validates.
    ///
    /// A missing file at the default location yields defaults; a missing
    /// file at an explicit path is an error.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("BOT_TOKEN").or_else(|| non_empty("TELEGRAM_BOT_TOKEN")) {
            self.telegram.bot_token = v;
        }
        if let Some(v) = non_empty("REDIS_URL") {
            self.queue.redis_url = v;
        }
        if let Some(v) = non_empty("QUEUE_NAME") {
            self.queue.queue_name = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.api_base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("telegram.api_base_url must not be empty"));
        }
        if self.telegram.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("telegram.request_timeout_secs must be > 0"));
        }
        if self.queue.redis_url.trim().is_empty() {
            return Err(anyhow::anyhow!("queue.redis_url must not be empty"));
        }
        if self.queue.queue_name.trim().is_empty() {
            return Err(anyhow::anyhow!("queue.queue_name must not be empty"));
        }
        if self.queue.pop_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "queue.pop_timeout_ms must be > 0; a zero timeout blocks forever"
            ));
        }
        if self.worker.single_consumer_lock && self.worker.lock_ttl_secs == 0 {
            return Err(anyhow::anyhow!("worker.lock_ttl_secs must be > 0"));
        }
        Ok(())
    }

    /// Token for calls that reach the platform.
    pub fn require_bot_token(&self) -> anyhow::Result<&str> {
        let token = self.telegram.bot_token.trim();
        if token.is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set BOT_TOKEN)"
            ));
        }
        Ok(token)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.telegram.request_timeout_secs)
    }

    pub fn redis_queue(&self) -> RedisQueueConfig {
        RedisQueueConfig {
            url: self.queue.redis_url.clone(),
            queue_name: self.queue.queue_name.clone(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            pop_timeout: Duration::from_millis(self.queue.pop_timeout_ms),
            error_backoff: Duration::from_millis(self.queue.error_backoff_ms),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.worker.lock_ttl_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".kinobot").join("config.toml")
}
