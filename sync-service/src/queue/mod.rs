//! Pending-submission queue.
//!
//! Readings are persisted locally on enqueue and delivered to the append log
//! by `flush`. Delivery is at-least-once; the log's duplicate rejection makes
//! re-delivery harmless, so a crash between a successful append and the
//! local removal only costs one redundant attempt.

use std::{sync::Arc, time::Duration};

use reading_client::domain::{
    MetricKind, ParseDomainError, Reading, SubmissionRecord, SubmissionStatus, TransitionError,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, futures::Notified, Mutex, Notify};

use crate::{
    log::{AppendLog, LogError},
    pipeline::{Envelope, PipelineError},
    transform::validate_reading,
};

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteQueueStore;
pub use store::{MemoryQueueStore, QueueStore};

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt queue record: {0}")]
    Decode(#[from] ParseDomainError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("no submission with id {0}")]
    NotFound(String),
    #[error("reading not accepted: {0}")]
    Invalid(String),
}

/// Outcome of a failed delivery attempt.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DeliveryError {
    /// Will be retried on a later flush.
    #[error("delivery of {reading_id} failed on attempt {attempt}: {source}")]
    Transient {
        reading_id: String,
        attempt: u32,
        source: LogError,
    },
    /// Retry budget exhausted; the record is marked failed and surfaced.
    #[error("delivery of {reading_id} abandoned after {attempts} attempts: {source}")]
    Permanent {
        reading_id: String,
        attempts: u32,
        source: LogError,
    },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(15 * 60),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Wait required after `attempts` consecutive failures.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exp = (attempts - 1).min(30);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Earliest time the record may be attempted again.
    pub fn next_attempt_at(&self, record: &SubmissionRecord) -> Option<OffsetDateTime> {
        let attempts = record.attempts_in_round();
        if attempts == 0 {
            return None;
        }
        record
            .last_attempt_at
            .map(|at| at + self.backoff_after(attempts))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    /// Records a delivery was attempted for.
    pub attempted: usize,
    /// Newly appended to the log.
    pub delivered: usize,
    /// Already present in the log; confirmed without a new append.
    pub duplicates: usize,
    /// Failed this pass, still pending.
    pub retrying: usize,
    /// Not attempted: still backing off, or the pass stopped early.
    pub deferred: usize,
    /// Marked failed this pass.
    pub exhausted: Vec<SubmissionRecord>,
    #[serde(skip)]
    pub failures: Vec<DeliveryError>,
}

impl FlushReport {
    pub fn confirmed(&self) -> usize {
        self.delivered + self.duplicates
    }
}

pub struct PendingSubmissionQueue {
    store: Arc<dyn QueueStore>,
    log: Arc<dyn AppendLog>,
    policy: RetryPolicy,
    flush_lock: Mutex<()>,
    wake: Notify,
    failures: broadcast::Sender<SubmissionRecord>,
}

impl PendingSubmissionQueue {
    pub fn new(store: Arc<dyn QueueStore>, log: Arc<dyn AppendLog>, policy: RetryPolicy) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            store,
            log,
            policy,
            flush_lock: Mutex::new(()),
            wake: Notify::new(),
            failures,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Accept a reading for delivery. The record is persisted before this
    /// returns. Re-enqueueing a reading whose key is already queued returns
    /// the existing record. Readings that fail `validate_reading` are refused
    /// with `QueueError::Invalid`.
    pub async fn enqueue(&self, reading: Reading) -> Result<SubmissionRecord, QueueError> {
        let reading = validate_reading(Envelope::now(reading))
            .map_err(|e| match e {
                PipelineError::Transform(msg) => QueueError::Invalid(msg),
                other => QueueError::Invalid(other.to_string()),
            })?
            .payload;
        let record = SubmissionRecord::new(reading, OffsetDateTime::now_utc());

        match self.store.insert_if_absent(&record).await? {
            None => {
                metrics::counter!("queue_enqueued_total").increment(1);
                tracing::debug!(
                    reading = %record.reading.key(),
                    value = record.reading.value,
                    "reading enqueued"
                );
                self.wake.notify_one();
                Ok(record)
            }
            Some(existing) => {
                metrics::counter!("queue_enqueue_duplicates_total").increment(1);
                if existing.reading.value != record.reading.value {
                    tracing::warn!(
                        reading = %record.reading.key(),
                        kept = existing.reading.value,
                        ignored = record.reading.value,
                        "conflicting value for a queued reading, keeping the first"
                    );
                }
                Ok(existing)
            }
        }
    }

    /// Wait until an enqueue or retry asks for a flush.
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<SubmissionRecord> {
        self.failures.subscribe()
    }

    pub async fn pending(&self) -> Result<Vec<SubmissionRecord>, QueueError> {
        self.store.list(SubmissionStatus::Pending).await
    }

    pub async fn failed(&self) -> Result<Vec<SubmissionRecord>, QueueError> {
        self.store.list(SubmissionStatus::Failed).await
    }

    /// Newest pending reading of a kind, by the same ranking the log uses.
    pub async fn latest_pending(&self, metric_kind: MetricKind) -> Result<Option<Reading>, QueueError> {
        let pending = self.pending().await?;
        Ok(pending
            .into_iter()
            .map(|r| r.reading)
            .filter(|r| r.metric_kind == metric_kind)
            .max_by_key(|r| r.recency_rank()))
    }

    /// Return a failed record to the pending set with a fresh retry budget.
    pub async fn retry_failed(&self, reading_id: &str) -> Result<SubmissionRecord, QueueError> {
        let mut record = self
            .store
            .get(reading_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(reading_id.to_string()))?;

        record.requeue()?;
        self.store.update(&record).await?;
        tracing::info!(reading = %record.reading.key(), "failed submission requeued");
        self.wake.notify_one();
        Ok(record)
    }

    pub async fn flush(&self) -> Result<FlushReport, QueueError> {
        self.flush_at(OffsetDateTime::now_utc()).await
    }

    /// Deliver every pending record that is due at `now`, oldest first.
    ///
    /// Only one flush runs at a time in this process. The pass works on the
    /// pending set as it was when the pass started; a record that disappears
    /// from the store mid-pass was settled by another flusher of the same
    /// store and is skipped.
    pub async fn flush_at(&self, now: OffsetDateTime) -> Result<FlushReport, QueueError> {
        let _guard = self.flush_lock.lock().await;
        let snapshot = self.store.list(SubmissionStatus::Pending).await?;
        let mut report = FlushReport::default();

        let mut records = snapshot.into_iter();
        while let Some(mut record) = records.next() {
            if let Some(due) = self.policy.next_attempt_at(&record) {
                if due > now {
                    report.deferred += 1;
                    continue;
                }
            }

            record.begin_attempt(now)?;
            if !self.persist(&record).await? {
                continue;
            }
            report.attempted += 1;

            match self.deliver(&record.reading).await {
                Ok(()) => {
                    self.confirm(record).await?;
                    report.delivered += 1;
                }
                Err(LogError::DuplicateReading(_)) => {
                    self.confirm(record).await?;
                    report.duplicates += 1;
                }
                Err(e) => {
                    let stop = e.is_connectivity();
                    self.record_failure(&mut record, e, &mut report).await?;
                    if stop {
                        let remaining = records.len();
                        report.deferred += remaining;
                        tracing::warn!(remaining, "append log unreachable, ending flush pass");
                        break;
                    }
                }
            }
        }

        let pending = self.store.list(SubmissionStatus::Pending).await?.len();
        metrics::gauge!("queue_pending_records").set(pending as f64);

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                delivered = report.delivered,
                duplicates = report.duplicates,
                retrying = report.retrying,
                exhausted = report.exhausted.len(),
                deferred = report.deferred,
                "flush pass complete"
            );
        }

        Ok(report)
    }

    /// Write back a record. `false` if it is no longer in the store.
    async fn persist(&self, record: &SubmissionRecord) -> Result<bool, QueueError> {
        match self.store.update(record).await {
            Ok(()) => Ok(true),
            Err(QueueError::NotFound(id)) => {
                tracing::debug!(reading_id = %id, "record settled elsewhere, skipping");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn deliver(&self, reading: &Reading) -> Result<(), LogError> {
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, self.log.append(reading)).await {
            Ok(res) => res,
            Err(_) => Err(LogError::Timeout(timeout)),
        }
    }

    async fn confirm(&self, mut record: SubmissionRecord) -> Result<(), QueueError> {
        record.confirm()?;
        self.store.remove(&record.reading_id()).await?;

        metrics::counter!("queue_confirmed_total").increment(1);
        let waited = OffsetDateTime::now_utc() - record.enqueued_at;
        if waited.is_positive() {
            metrics::histogram!("queue_sync_latency_seconds").record(waited.as_seconds_f64());
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        record: &mut SubmissionRecord,
        err: LogError,
        report: &mut FlushReport,
    ) -> Result<(), QueueError> {
        let reading_id = record.reading_id();

        if record.attempts_in_round() >= self.policy.max_attempts {
            record.mark_failed(err.to_string())?;
            if !self.persist(record).await? {
                return Ok(());
            }

            metrics::counter!("queue_delivery_failed_total").increment(1);
            tracing::error!(
                reading = %record.reading.key(),
                attempts = record.attempt_count,
                error = %err,
                "delivery abandoned, needs manual resolution"
            );

            // No subscriber is fine: failed records stay listed in the store.
            let _ = self.failures.send(record.clone());
            report.exhausted.push(record.clone());
            report.failures.push(DeliveryError::Permanent {
                reading_id,
                attempts: record.attempt_count,
                source: err,
            });
        } else {
            record.record_failure(err.to_string());
            if !self.persist(record).await? {
                return Ok(());
            }

            metrics::counter!("queue_delivery_retry_total").increment(1);
            tracing::warn!(
                reading = %record.reading.key(),
                attempt = record.attempt_count,
                backoff = ?self.policy.backoff_after(record.attempts_in_round()),
                error = %err,
                "delivery failed, will retry"
            );

            report.retrying += 1;
            report.failures.push(DeliveryError::Transient {
                reading_id,
                attempt: record.attempt_count,
                source: err,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryAppendLog;
    use reading_client::domain::ReadingOrigin;
    use time::macros::datetime;

    struct DownLog;

    #[async_trait::async_trait]
    impl AppendLog for DownLog {
        async fn append(&self, _reading: &Reading) -> Result<(), LogError> {
            Err(LogError::Unavailable("connection refused".to_string()))
        }

        async fn latest(&self, _kind: MetricKind) -> Result<Option<Reading>, LogError> {
            Err(LogError::Unavailable("connection refused".to_string()))
        }

        async fn history(
            &self,
            _kind: MetricKind,
            _from: OffsetDateTime,
            _to: OffsetDateTime,
        ) -> Result<Vec<Reading>, LogError> {
            Err(LogError::Unavailable("connection refused".to_string()))
        }
    }

    struct StalledLog;

    #[async_trait::async_trait]
    impl AppendLog for StalledLog {
        async fn append(&self, _reading: &Reading) -> Result<(), LogError> {
            futures::future::pending().await
        }

        async fn latest(&self, _kind: MetricKind) -> Result<Option<Reading>, LogError> {
            Ok(None)
        }

        async fn history(
            &self,
            _kind: MetricKind,
            _from: OffsetDateTime,
            _to: OffsetDateTime,
        ) -> Result<Vec<Reading>, LogError> {
            Ok(Vec::new())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
            attempt_timeout: Duration::from_millis(50),
        }
    }

    fn production(minute: i64, value: f64) -> Reading {
        Reading::new(
            datetime!(2024-06-01 10:00:00 UTC) + time::Duration::minutes(minute),
            MetricKind::Production,
            value,
            ReadingOrigin::Automatic,
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff_after(0), Duration::ZERO);
        assert_eq!(p.backoff_after(1), Duration::from_secs(10));
        assert_eq!(p.backoff_after(2), Duration::from_secs(20));
        assert_eq!(p.backoff_after(3), Duration::from_secs(40));
        assert_eq!(p.backoff_after(4), Duration::from_secs(60));
        assert_eq!(p.backoff_after(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let queue = PendingSubmissionQueue::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryAppendLog::new()),
            policy(3),
        );

        let report = queue.flush().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.confirmed(), 0);
        assert!(report.exhausted.is_empty());
    }

    #[tokio::test]
    async fn records_back_off_between_attempts() {
        let queue =
            PendingSubmissionQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(DownLog), policy(5));
        queue.enqueue(production(0, 5.0)).await.unwrap();

        let t0 = datetime!(2024-06-01 12:00:00 UTC);
        let first = queue.flush_at(t0).await.unwrap();
        assert_eq!(first.attempted, 1);
        assert_eq!(first.retrying, 1);

        // Inside the 10s backoff window: not attempted.
        let early = queue.flush_at(t0 + time::Duration::seconds(5)).await.unwrap();
        assert_eq!(early.attempted, 0);
        assert_eq!(early.deferred, 1);

        let due = queue.flush_at(t0 + time::Duration::seconds(10)).await.unwrap();
        assert_eq!(due.attempted, 1);

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending[0].attempt_count, 2);
        assert_eq!(pending[0].last_attempt_at, Some(t0 + time::Duration::seconds(10)));
        assert!(pending[0].last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn exceeding_max_attempts_marks_failed_and_surfaces() {
        let queue =
            PendingSubmissionQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(DownLog), policy(2));
        let mut failures = queue.subscribe_failures();
        let record = queue.enqueue(production(0, 5.0)).await.unwrap();

        let t0 = datetime!(2024-06-01 12:00:00 UTC);
        queue.flush_at(t0).await.unwrap();
        let report = queue.flush_at(t0 + time::Duration::minutes(5)).await.unwrap();

        assert_eq!(report.exhausted.len(), 1);
        assert!(matches!(
            report.failures.as_slice(),
            [DeliveryError::Permanent { attempts: 2, .. }]
        ));

        let surfaced = failures.try_recv().unwrap();
        assert_eq!(surfaced.reading_id(), record.reading_id());
        assert_eq!(surfaced.status, SubmissionStatus::Failed);

        assert!(queue.pending().await.unwrap().is_empty());
        assert_eq!(queue.failed().await.unwrap().len(), 1);

        // Failed records are not retried by later flushes.
        let later = queue.flush_at(t0 + time::Duration::hours(1)).await.unwrap();
        assert_eq!(later.attempted, 0);
    }

    #[tokio::test]
    async fn retry_failed_returns_record_to_pending() {
        let queue =
            PendingSubmissionQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(DownLog), policy(1));
        let record = queue.enqueue(production(0, 5.0)).await.unwrap();
        queue.flush().await.unwrap();
        assert_eq!(queue.failed().await.unwrap().len(), 1);

        let requeued = queue.retry_failed(&record.reading_id()).await.unwrap();
        assert_eq!(requeued.status, SubmissionStatus::Pending);
        assert_eq!(requeued.attempt_count, 1);

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(queue.policy().next_attempt_at(&pending[0]).is_none());
    }

    #[tokio::test]
    async fn retry_of_unknown_id_is_not_found() {
        let queue = PendingSubmissionQueue::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryAppendLog::new()),
            policy(1),
        );
        assert!(matches!(
            queue.retry_failed("nope").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn connectivity_failure_ends_the_pass() {
        let queue =
            PendingSubmissionQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(DownLog), policy(5));
        for minute in 0..3 {
            queue.enqueue(production(minute, 5.0)).await.unwrap();
        }

        let report = queue.flush().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.deferred, 2);

        let attempts: Vec<u32> = queue
            .pending()
            .await
            .unwrap()
            .iter()
            .map(|r| r.attempt_count)
            .collect();
        assert_eq!(attempts, vec![1, 0, 0]);
    }

    #[tokio::test]
    async fn stalled_log_times_out_as_retryable() {
        let queue = PendingSubmissionQueue::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(StalledLog),
            policy(5),
        );
        queue.enqueue(production(0, 5.0)).await.unwrap();

        let report = queue.flush().await.unwrap();
        assert_eq!(report.retrying, 1);
        assert!(matches!(
            report.failures.as_slice(),
            [DeliveryError::Transient {
                source: LogError::Timeout(_),
                ..
            }]
        ));
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_refuses_readings_outside_the_storable_range() {
        let queue = PendingSubmissionQueue::new(
            Arc::new(SqliteQueueStore::in_memory().await.unwrap()),
            Arc::new(MemoryAppendLog::new()),
            policy(3),
        );
        let far_future = Reading::new(
            datetime!(2300-01-01 00:00:00 UTC),
            MetricKind::Production,
            1.0,
            ReadingOrigin::Automatic,
        );

        assert!(matches!(queue.enqueue(far_future).await, Err(QueueError::Invalid(_))));
        assert!(matches!(
            queue.enqueue(production(0, f64::INFINITY)).await,
            Err(QueueError::Invalid(_))
        ));
        assert!(queue.pending().await.unwrap().is_empty());
    }

    /// Store that drops a record the moment it is first written back, as if
    /// another process had confirmed it.
    struct SettledElsewhere(MemoryQueueStore);

    #[async_trait::async_trait]
    impl QueueStore for SettledElsewhere {
        async fn insert_if_absent(
            &self,
            record: &SubmissionRecord,
        ) -> Result<Option<SubmissionRecord>, QueueError> {
            self.0.insert_if_absent(record).await
        }

        async fn get(&self, reading_id: &str) -> Result<Option<SubmissionRecord>, QueueError> {
            self.0.get(reading_id).await
        }

        async fn update(&self, record: &SubmissionRecord) -> Result<(), QueueError> {
            self.0.remove(&record.reading_id()).await?;
            Err(QueueError::NotFound(record.reading_id()))
        }

        async fn remove(&self, reading_id: &str) -> Result<(), QueueError> {
            self.0.remove(reading_id).await
        }

        async fn list(&self, status: SubmissionStatus) -> Result<Vec<SubmissionRecord>, QueueError> {
            self.0.list(status).await
        }
    }

    #[tokio::test]
    async fn record_removed_mid_pass_is_skipped() {
        let log = Arc::new(MemoryAppendLog::new());
        let queue = PendingSubmissionQueue::new(
            Arc::new(SettledElsewhere(MemoryQueueStore::new())),
            log.clone(),
            policy(3),
        );
        queue.enqueue(production(0, 5.0)).await.unwrap();
        queue.enqueue(production(1, 5.1)).await.unwrap();

        let report = queue.flush().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(log.is_empty().await);
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_pending_picks_newest_of_kind() {
        let queue = PendingSubmissionQueue::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryAppendLog::new()),
            policy(3),
        );
        queue.enqueue(production(5, 5.2)).await.unwrap();
        queue.enqueue(production(0, 5.0)).await.unwrap();

        let latest = queue.latest_pending(MetricKind::Production).await.unwrap().unwrap();
        assert_eq!(latest.value, 5.2);
        assert!(queue
            .latest_pending(MetricKind::Consumption)
            .await
            .unwrap()
            .is_none());
    }
}
