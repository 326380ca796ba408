use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for `store.abandoned_retention_days` (about a century)
const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    /// Server-side long-poll wait passed as `timeout` to getUpdates
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Added to the server wait to form the client-side request timeout
    #[serde(default = "default_request_grace_secs")]
    pub request_grace_secs: u64,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    /// Number of failed dispatches after which a record is abandoned
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
    #[serde(default = "default_failure_delay_ms")]
    pub failure_delay_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    /// Days to keep abandoned records; 0 keeps them forever
    #[serde(default)]
    pub abandoned_retention_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    #[serde(default = "default_heartbeat_cron")]
    pub heartbeat_cron: String,
}

/// Settings the poller loop is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub fetch_timeout: Duration,
    pub fetch_limit: u32,
    pub min_interval: Duration,
    pub error_backoff: Duration,
}

/// Settings the processor loop is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub retry_budget: u32,
    pub idle_delay: Duration,
    pub failure_delay: Duration,
    pub error_backoff: Duration,
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    25
}

fn default_request_grace_secs() -> u64 {
    10
}

fn default_fetch_limit() -> u32 {
    100
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_error_backoff_ms() -> u64 {
    5000
}

fn default_retry_budget() -> u32 {
    5
}

fn default_idle_delay_ms() -> u64 {
    100
}

fn default_failure_delay_ms() -> u64 {
    2000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("relaybot.db")
}

fn default_heartbeat_cron() -> String {
    "0 */5 * * * *".to_string()
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            request_grace_secs: default_request_grace_secs(),
            fetch_limit: default_fetch_limit(),
            min_interval_ms: default_min_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            idle_delay_ms: default_idle_delay_ms(),
            failure_delay_ms: default_failure_delay_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            abandoned_retention_days: 0,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            heartbeat_cron: default_heartbeat_cron(),
        }
    }
}

impl PollingConfig {
    /// Hard client-side timeout for one getUpdates request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs + self.request_grace_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        // Keep the token out of config files checked into deployments
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.is_empty() {
                config.telegram.bot_token = token;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token is empty (set it or TELEGRAM_BOT_TOKEN)");
        }
        if !(1..=100).contains(&self.polling.fetch_limit) {
            anyhow::bail!(
                "polling.fetch_limit must be between 1 and 100, got {}",
                self.polling.fetch_limit
            );
        }
        if self.processing.retry_budget == 0 {
            anyhow::bail!("processing.retry_budget must be at least 1");
        }
        if self.store.abandoned_retention_days > MAX_RETENTION_DAYS {
            anyhow::bail!(
                "store.abandoned_retention_days must be at most {}, got {}",
                MAX_RETENTION_DAYS,
                self.store.abandoned_retention_days
            );
        }
        Ok(())
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            fetch_timeout: Duration::from_secs(self.polling.fetch_timeout_secs),
            fetch_limit: self.polling.fetch_limit,
            min_interval: Duration::from_millis(self.polling.min_interval_ms),
            error_backoff: Duration::from_millis(self.polling.error_backoff_ms),
        }
    }

    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            retry_budget: self.processing.retry_budget,
            idle_delay: Duration::from_millis(self.processing.idle_delay_ms),
            failure_delay: Duration::from_millis(self.processing.failure_delay_ms),
            error_backoff: Duration::from_millis(self.processing.error_backoff_ms),
        }
    }
}
