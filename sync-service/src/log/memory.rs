use std::collections::{HashMap, HashSet};

use reading_client::domain::{MetricKind, Reading, ReadingKey};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{AppendLog, LogError};

#[derive(Default)]
struct LogState {
    keys: HashSet<ReadingKey>,
    // Per kind, ordered by captured_at; equal timestamps keep arrival order.
    by_kind: HashMap<MetricKind, Vec<Reading>>,
}

/// In-process append log.
///
/// Used when no remote store is configured and as the log in tests. A record
/// becomes visible to readers only once fully inserted under the write lock.
#[derive(Default)]
pub struct MemoryAppendLog {
    state: RwLock<LogState>,
}

impl MemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored reading of a kind, oldest first.
    pub async fn readings(&self, metric_kind: MetricKind) -> Vec<Reading> {
        self.state
            .read()
            .await
            .by_kind
            .get(&metric_kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl AppendLog for MemoryAppendLog {
    async fn append(&self, reading: &Reading) -> Result<(), LogError> {
        let key = reading.key();
        let mut state = self.state.write().await;

        if !state.keys.insert(key) {
            return Err(LogError::DuplicateReading(key));
        }

        let entries = state.by_kind.entry(reading.metric_kind).or_default();
        let idx = entries.partition_point(|r| r.captured_at <= reading.captured_at);
        entries.insert(idx, reading.clone());

        Ok(())
    }

    async fn latest(&self, metric_kind: MetricKind) -> Result<Option<Reading>, LogError> {
        let state = self.state.read().await;
        let latest = state
            .by_kind
            .get(&metric_kind)
            .and_then(|entries| entries.iter().max_by_key(|r| r.recency_rank()))
            .cloned();
        Ok(latest)
    }

    async fn history(
        &self,
        metric_kind: MetricKind,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Reading>, LogError> {
        let state = self.state.read().await;
        let Some(entries) = state.by_kind.get(&metric_kind) else {
            return Ok(Vec::new());
        };

        let start = entries.partition_point(|r| r.captured_at < from);
        let end = entries.partition_point(|r| r.captured_at < to);
        Ok(entries[start..end.max(start)].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reading_client::domain::ReadingOrigin;
    use time::macros::datetime;

    fn production(ts: OffsetDateTime, value: f64) -> Reading {
        Reading::new(ts, MetricKind::Production, value, ReadingOrigin::Automatic)
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_and_stored_once() {
        let log = MemoryAppendLog::new();
        let r1 = production(datetime!(2024-06-01 10:00:00 UTC), 5.0);
        let r2 = production(datetime!(2024-06-01 10:00:00 UTC), 6.0);

        log.append(&r1).await.unwrap();
        let err = log.append(&r2).await.unwrap_err();

        assert!(matches!(err, LogError::DuplicateReading(k) if k == r1.key()));
        assert_eq!(log.len().await, 1);
        assert_eq!(log.latest(MetricKind::Production).await.unwrap().unwrap().value, 5.0);
    }

    #[tokio::test]
    async fn latest_is_none_for_empty_kind() {
        let log = MemoryAppendLog::new();
        log.append(&production(datetime!(2024-06-01 10:00:00 UTC), 5.0))
            .await
            .unwrap();

        assert!(log.latest(MetricKind::Consumption).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn out_of_order_appends_are_served_in_captured_order() {
        let log = MemoryAppendLog::new();
        log.append(&production(datetime!(2024-06-01 10:05:00 UTC), 5.2)).await.unwrap();
        log.append(&production(datetime!(2024-06-01 10:00:00 UTC), 5.0)).await.unwrap();
        log.append(&production(datetime!(2024-06-01 10:10:00 UTC), 5.4)).await.unwrap();

        let values: Vec<f64> = log
            .readings(MetricKind::Production)
            .await
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![5.0, 5.2, 5.4]);

        let latest = log.latest(MetricKind::Production).await.unwrap().unwrap();
        assert_eq!(latest.captured_at, datetime!(2024-06-01 10:10:00 UTC));
    }

    #[tokio::test]
    async fn manual_and_automatic_coexist_and_manual_wins_latest() {
        let log = MemoryAppendLog::new();
        let ts = datetime!(2024-06-01 10:00:00 UTC);
        log.append(&production(ts, 5.0)).await.unwrap();
        log.append(&Reading::new(ts, MetricKind::Production, 4.8, ReadingOrigin::Manual))
            .await
            .unwrap();

        assert_eq!(log.len().await, 2);
        let latest = log.latest(MetricKind::Production).await.unwrap().unwrap();
        assert_eq!(latest.source, ReadingOrigin::Manual);
        assert_eq!(latest.value, 4.8);
    }

    #[tokio::test]
    async fn history_is_half_open() {
        let log = MemoryAppendLog::new();
        for minute in [0, 5, 10, 15] {
            let ts = datetime!(2024-06-01 10:00:00 UTC) + time::Duration::minutes(minute);
            log.append(&production(ts, minute as f64)).await.unwrap();
        }

        let window = log
            .history(
                MetricKind::Production,
                datetime!(2024-06-01 10:05:00 UTC),
                datetime!(2024-06-01 10:15:00 UTC),
            )
            .await
            .unwrap();
        let values: Vec<f64> = window.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![5.0, 10.0]);

        let inverted = log
            .history(
                MetricKind::Production,
                datetime!(2024-06-01 10:15:00 UTC),
                datetime!(2024-06-01 10:05:00 UTC),
            )
            .await
            .unwrap();
        assert!(inverted.is_empty());
    }
}
