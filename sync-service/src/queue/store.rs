use std::collections::HashMap;

use reading_client::domain::{SubmissionRecord, SubmissionStatus};
use tokio::sync::Mutex;

use super::QueueError;

/// Local persistence for submission records.
///
/// An implementation must have durably stored a record before
/// `insert_if_absent` returns. Listings are ordered by `captured_at`, then by
/// enqueue order.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Store a new record unless one with the same reading id exists, in
    /// which case the existing record is returned untouched.
    async fn insert_if_absent(
        &self,
        record: &SubmissionRecord,
    ) -> Result<Option<SubmissionRecord>, QueueError>;

    async fn get(&self, reading_id: &str) -> Result<Option<SubmissionRecord>, QueueError>;

    async fn update(&self, record: &SubmissionRecord) -> Result<(), QueueError>;

    async fn remove(&self, reading_id: &str) -> Result<(), QueueError>;

    async fn list(&self, status: SubmissionStatus) -> Result<Vec<SubmissionRecord>, QueueError>;
}

#[derive(Default)]
struct MemoryState {
    next_seq: u64,
    records: HashMap<String, (u64, SubmissionRecord)>,
}

/// Non-persistent store, for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert_if_absent(
        &self,
        record: &SubmissionRecord,
    ) -> Result<Option<SubmissionRecord>, QueueError> {
        let mut state = self.state.lock().await;
        let id = record.reading_id();
        if let Some((_, existing)) = state.records.get(&id) {
            return Ok(Some(existing.clone()));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(id, (seq, record.clone()));
        Ok(None)
    }

    async fn get(&self, reading_id: &str) -> Result<Option<SubmissionRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.records.get(reading_id).map(|(_, r)| r.clone()))
    }

    async fn update(&self, record: &SubmissionRecord) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let id = record.reading_id();
        match state.records.get_mut(&id) {
            Some((_, slot)) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(QueueError::NotFound(id)),
        }
    }

    async fn remove(&self, reading_id: &str) -> Result<(), QueueError> {
        self.state.lock().await.records.remove(reading_id);
        Ok(())
    }

    async fn list(&self, status: SubmissionStatus) -> Result<Vec<SubmissionRecord>, QueueError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&(u64, SubmissionRecord)> = state
            .records
            .values()
            .filter(|(_, r)| r.status == status)
            .collect();
        matching.sort_by_key(|(seq, r)| (r.reading.captured_at, *seq));
        Ok(matching.into_iter().map(|(_, r)| r.clone()).collect())
    }
}
