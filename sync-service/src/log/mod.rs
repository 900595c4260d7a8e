//! Durable append log: the canonical, order-preserving history of confirmed
//! readings.

use std::{sync::Arc, time::Duration};

use reading_client::domain::{MetricKind, Reading, ReadingKey};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;

use crate::config::{RemoteConfig, RemoteKind};

pub mod memory;
pub mod pgwire;

pub use memory::MemoryAppendLog;
pub use pgwire::PgAppendLog;

#[derive(thiserror::Error, Debug, Clone)]
pub enum LogError {
    /// A reading with the same key is already stored. Callers treat this as a
    /// successful append.
    #[error("duplicate reading {0}")]
    DuplicateReading(ReadingKey),
    #[error("log unavailable: {0}")]
    Unavailable(String),
    #[error("log call timed out after {0:?}")]
    Timeout(Duration),
    #[error("log rejected reading: {0}")]
    Rejected(String),
}

impl LogError {
    /// Whether the failure concerns the connection rather than the record.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, LogError::Unavailable(_) | LogError::Timeout(_))
    }
}

#[async_trait::async_trait]
pub trait AppendLog: Send + Sync {
    /// Append a reading. Fails with [`LogError::DuplicateReading`] when the
    /// key is already present; existing records are never reordered.
    async fn append(&self, reading: &Reading) -> Result<(), LogError>;

    /// Most recent reading of a kind, if any.
    async fn latest(&self, metric_kind: MetricKind) -> Result<Option<Reading>, LogError>;

    /// Readings of a kind captured in `[from, to)`, oldest first.
    async fn history(
        &self,
        metric_kind: MetricKind,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Reading>, LogError>;
}

/// Build the configured log. The Postgres pool connects lazily so the
/// service starts, and keeps queueing, while the remote store is down.
pub fn from_config(cfg: &RemoteConfig) -> anyhow::Result<Arc<dyn AppendLog>> {
    match cfg.kind {
        RemoteKind::Pgwire => {
            let uri = cfg
                .uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("remote.uri is required for pgwire"))?;
            let pool = PgPoolOptions::new()
                .max_connections(cfg.max_connections)
                .acquire_timeout(Duration::from_millis(cfg.connect_timeout_ms))
                .connect_lazy(uri)?;
            Ok(Arc::new(PgAppendLog::new(pool)))
        }
        RemoteKind::Memory => {
            tracing::warn!("using in-memory append log; confirmed readings are lost on restart");
            Ok(Arc::new(MemoryAppendLog::new()))
        }
    }
}
