use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct LocalQueueConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    /// Postgres-wire remote store.
    Pgwire,
    /// In-process log; nothing survives a restart. For local development.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub kind: RemoteKind,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub flush_interval_ms: u64,
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl DeliveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub local_queue: LocalQueueConfig,
    pub remote: RemoteConfig,
    pub delivery: DeliveryConfig,
    pub device: Option<DeviceConfig>,
    pub api: ApiConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("SYNC_CONFIG").unwrap_or_else(|_| "sync-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.remote.kind == RemoteKind::Pgwire && cfg.remote.uri.is_none() {
            anyhow::bail!("remote.uri is required when remote.kind = \"pgwire\"");
        }
        if cfg.delivery.flush_interval_ms == 0 {
            anyhow::bail!("delivery.flush_interval_ms must be greater than zero");
        }
        if cfg.delivery.attempt_timeout_ms == 0 {
            anyhow::bail!("delivery.attempt_timeout_ms must be greater than zero");
        }
        if let Some(device) = &cfg.device {
            if device.poll_interval_ms == 0 {
                anyhow::bail!("device.poll_interval_ms must be greater than zero");
            }
            if device.request_timeout_ms == 0 {
                anyhow::bail!("device.request_timeout_ms must be greater than zero");
            }
        }
        Ok(cfg)
    }
}
