use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::error::SyncError;

/// Timing and limit knobs shared by the reconnection controller and the
/// outbound queue. Tests pass compressed values instead of the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_max_queue_attempts")]
    pub max_queue_attempts: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_inter_item_delay_ms")]
    pub inter_item_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(scaled)
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_queue_attempts: default_max_queue_attempts(),
            batch_size: default_batch_size(),
            inter_item_delay_ms: default_inter_item_delay_ms(),
        }
    }
}

/// Sync client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the taskchat API (REST fallback and `/health`).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Websocket endpoint; derived from `server_url` when unset.
    #[serde(default)]
    pub socket_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_true")]
    pub suppress_rate_limit_errors: bool,
    #[serde(default = "default_true")]
    pub rest_fallback: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SyncConfig {
    /// Load configuration from `TASKCHAT__*` environment variables (after
    /// reading `.env` when present). Nested keys use `__`, e.g.
    /// `TASKCHAT__RETRY__BATCH_SIZE=3`.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TASKCHAT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<SyncConfig>())
            .map(SyncConfig::normalize)
            .unwrap_or_else(|err| {
                warn!(
                    target = "taskchat::config",
                    error = %err,
                    "invalid TASKCHAT__ environment; using defaults"
                );
                SyncConfig::default()
            })
    }

    fn normalize(mut self) -> Self {
        self.server_url = self.server_url.trim().trim_end_matches('/').to_string();
        if self.server_url.starts_with("localhost:") {
            self.server_url = self.server_url.replacen("localhost", "127.0.0.1", 1);
        }
        if !self.server_url.contains("://") {
            self.server_url = format!("http://{}", self.server_url);
        }
        self.socket_url = self
            .socket_url
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.auth_token = self.auth_token.take().filter(|s| !s.trim().is_empty());
        self.retry.batch_size = self.retry.batch_size.max(1);
        self
    }

    pub fn server_url(&self) -> Result<Url, SyncError> {
        Ok(Url::parse(&self.server_url)?)
    }

    /// Websocket endpoint: the explicit `socket_url`, or `server_url` with
    /// its scheme swapped to ws/wss and path `/ws`.
    pub fn socket_url(&self) -> Result<Url, SyncError> {
        if let Some(explicit) = &self.socket_url {
            return Ok(Url::parse(explicit)?);
        }
        let mut url = self.server_url()?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(SyncError::Scheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Scheme(scheme.to_string()))?;
        url.set_path("/ws");
        Ok(url)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            socket_url: None,
            auth_token: None,
            store_path: None,
            health_interval_secs: default_health_interval_secs(),
            suppress_rate_limit_errors: true,
            rest_fallback: true,
            retry: RetryPolicy::default(),
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_max_queue_attempts() -> u32 {
    10
}

fn default_batch_size() -> usize {
    5
}

fn default_inter_item_delay_ms() -> u64 {
    150
}
