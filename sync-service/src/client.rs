//! Consumer-facing read and correction path.
//!
//! The "current" value of a metric is always a query over the append log and
//! the pending set; nothing here caches state.

use std::sync::Arc;

use reading_client::domain::{MetricKind, Reading, ReadingOrigin, SubmissionRecord};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    log::{AppendLog, LogError},
    pipeline::{Envelope, PipelineError},
    queue::{FlushReport, PendingSubmissionQueue, QueueError},
    transform::validate_reading,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Stored in the append log.
    Confirmed,
    /// Accepted locally, not yet in the log.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestReading {
    pub reading: Reading,
    pub sync_state: SyncState,
}

/// A manually entered value, e.g. read off the meter display.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualCorrection {
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub metric_kind: MetricKind,
    pub value: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("invalid reading: {0}")]
    Invalid(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Log(#[from] LogError),
}

pub struct SubmissionClient {
    log: Arc<dyn AppendLog>,
    queue: Arc<PendingSubmissionQueue>,
}

impl SubmissionClient {
    pub fn new(log: Arc<dyn AppendLog>, queue: Arc<PendingSubmissionQueue>) -> Self {
        Self { log, queue }
    }

    pub fn queue(&self) -> &Arc<PendingSubmissionQueue> {
        &self.queue
    }

    /// Newest known reading of a kind, confirmed or not.
    ///
    /// When the log cannot be reached the answer comes from the pending set
    /// alone.
    pub async fn latest(&self, metric_kind: MetricKind) -> Result<Option<LatestReading>, ClientError> {
        let confirmed = match self.log.latest(metric_kind).await {
            Ok(r) => r,
            Err(e) if e.is_connectivity() => {
                tracing::warn!(error = %e, kind = %metric_kind, "append log unreachable, serving pending readings only");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let pending = self.queue.latest_pending(metric_kind).await?;

        Ok(pick_latest(confirmed, pending))
    }

    pub async fn history(
        &self,
        metric_kind: MetricKind,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Reading>, ClientError> {
        Ok(self.log.history(metric_kind, from, to).await?)
    }

    /// Validate and enqueue a manual reading. It travels the same
    /// enqueue/flush path as device readings.
    pub async fn submit_correction(
        &self,
        correction: ManualCorrection,
    ) -> Result<SubmissionRecord, ClientError> {
        let reading = Reading::new(
            correction.captured_at,
            correction.metric_kind,
            correction.value,
            ReadingOrigin::Manual,
        );

        let env = validate_reading(Envelope::now(reading)).map_err(|e| match e {
            PipelineError::Transform(msg) => ClientError::Invalid(msg),
            other => ClientError::Invalid(other.to_string()),
        })?;

        let record = self.queue.enqueue(env.payload).await?;
        tracing::info!(reading = %record.reading.key(), value = record.reading.value, "manual correction accepted");
        Ok(record)
    }

    pub async fn pending(&self) -> Result<Vec<SubmissionRecord>, ClientError> {
        Ok(self.queue.pending().await?)
    }

    pub async fn failed(&self) -> Result<Vec<SubmissionRecord>, ClientError> {
        Ok(self.queue.failed().await?)
    }

    pub async fn retry_failed(&self, reading_id: &str) -> Result<SubmissionRecord, ClientError> {
        Ok(self.queue.retry_failed(reading_id).await?)
    }

    pub async fn flush_now(&self) -> Result<FlushReport, ClientError> {
        Ok(self.queue.flush().await?)
    }
}

/// Newer `captured_at` wins; at the same instant a manual reading wins, then
/// the confirmed copy.
fn pick_latest(confirmed: Option<Reading>, pending: Option<Reading>) -> Option<LatestReading> {
    match (confirmed, pending) {
        (None, None) => None,
        (Some(c), None) => Some(LatestReading {
            reading: c,
            sync_state: SyncState::Confirmed,
        }),
        (None, Some(p)) => Some(LatestReading {
            reading: p,
            sync_state: SyncState::Pending,
        }),
        (Some(c), Some(p)) => {
            if p.recency_rank() > c.recency_rank() {
                Some(LatestReading {
                    reading: p,
                    sync_state: SyncState::Pending,
                })
            } else {
                Some(LatestReading {
                    reading: c,
                    sync_state: SyncState::Confirmed,
                })
            }
        }
    }
}
