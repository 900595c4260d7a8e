use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::reading::{ParseDomainError, Reading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Confirmed => "confirmed",
            SubmissionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubmissionStatus::Pending),
            "confirmed" => Ok(SubmissionStatus::Confirmed),
            "failed" => Ok(SubmissionStatus::Failed),
            other => Err(ParseDomainError::Status(other.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("submission {reading_id}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub reading_id: String,
    pub from: SubmissionStatus,
    pub to: SubmissionStatus,
}

/// Delivery bookkeeping for one reading.
///
/// Status only moves forward: pending -> confirmed, pending -> failed, and
/// failed -> pending through an explicit manual retry. `attempt_count` never
/// decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub reading: Reading,
    pub status: SubmissionStatus,
    pub attempt_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    /// Attempt count at the last manual retry; the retry budget is measured
    /// from here.
    pub attempt_base: u32,
}

impl SubmissionRecord {
    pub fn new(reading: Reading, enqueued_at: OffsetDateTime) -> Self {
        Self {
            reading,
            status: SubmissionStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            enqueued_at,
            attempt_base: 0,
        }
    }

    pub fn reading_id(&self) -> String {
        self.reading.reading_id()
    }

    /// Attempts made since the record last entered the pending state.
    pub fn attempts_in_round(&self) -> u32 {
        self.attempt_count.saturating_sub(self.attempt_base)
    }

    pub fn begin_attempt(&mut self, at: OffsetDateTime) -> Result<(), TransitionError> {
        self.expect_status(SubmissionStatus::Pending, SubmissionStatus::Pending)?;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(at);
        Ok(())
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
    }

    pub fn confirm(&mut self) -> Result<(), TransitionError> {
        self.expect_status(SubmissionStatus::Pending, SubmissionStatus::Confirmed)?;
        self.status = SubmissionStatus::Confirmed;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_status(SubmissionStatus::Pending, SubmissionStatus::Failed)?;
        self.status = SubmissionStatus::Failed;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Manual resolution: put a failed record back in line with a fresh
    /// retry budget.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.expect_status(SubmissionStatus::Failed, SubmissionStatus::Pending)?;
        self.status = SubmissionStatus::Pending;
        self.attempt_base = self.attempt_count;
        Ok(())
    }

    fn expect_status(
        &self,
        required: SubmissionStatus,
        to: SubmissionStatus,
    ) -> Result<(), TransitionError> {
        if self.status == required {
            Ok(())
        } else {
            Err(TransitionError {
                reading_id: self.reading_id(),
                from: self.status,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MetricKind, ReadingOrigin};
    use time::macros::datetime;

    fn record() -> SubmissionRecord {
        let reading = Reading::new(
            datetime!(2024-06-01 10:00:00 UTC),
            MetricKind::Production,
            5.0,
            ReadingOrigin::Automatic,
        );
        SubmissionRecord::new(reading, datetime!(2024-06-01 10:00:01 UTC))
    }

    #[test]
    fn new_record_is_pending_with_no_attempts() {
        let r = record();
        assert_eq!(r.status, SubmissionStatus::Pending);
        assert_eq!(r.attempt_count, 0);
        assert!(r.last_attempt_at.is_none());
    }

    #[test]
    fn attempts_increase_and_stamp_time() {
        let mut r = record();
        r.begin_attempt(datetime!(2024-06-01 10:01:00 UTC)).unwrap();
        r.begin_attempt(datetime!(2024-06-01 10:02:00 UTC)).unwrap();
        assert_eq!(r.attempt_count, 2);
        assert_eq!(r.last_attempt_at, Some(datetime!(2024-06-01 10:02:00 UTC)));
    }

    #[test]
    fn confirmed_never_returns_to_pending() {
        let mut r = record();
        r.confirm().unwrap();

        assert!(r.requeue().is_err());
        assert!(r.mark_failed("late").is_err());
        let err = r.begin_attempt(datetime!(2024-06-01 10:03:00 UTC)).unwrap_err();
        assert_eq!(err.from, SubmissionStatus::Confirmed);
        assert_eq!(r.status, SubmissionStatus::Confirmed);
    }

    #[test]
    fn requeue_keeps_attempt_count_and_resets_round() {
        let mut r = record();
        for minute in 1..=3 {
            r.begin_attempt(datetime!(2024-06-01 10:00:00 UTC) + time::Duration::minutes(minute))
                .unwrap();
        }
        r.mark_failed("remote rejected").unwrap();
        assert_eq!(r.attempts_in_round(), 3);

        r.requeue().unwrap();
        assert_eq!(r.status, SubmissionStatus::Pending);
        assert_eq!(r.attempt_count, 3);
        assert_eq!(r.attempts_in_round(), 0);
        assert_eq!(r.last_error.as_deref(), Some("remote rejected"));
    }

    #[test]
    fn status_names_round_trip() {
        for s in [
            SubmissionStatus::Pending,
            SubmissionStatus::Confirmed,
            SubmissionStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<SubmissionStatus>().unwrap(), s);
        }
    }
}
