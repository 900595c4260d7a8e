use reading_client::{
    db::{self, QueryError},
    domain::{MetricKind, Reading},
};
use sqlx::postgres::PgPool;
use time::OffsetDateTime;

use super::{AppendLog, LogError};

const UNIQUE_VIOLATION: &str = "23505";

/// Append log backed by a remote Postgres-wire store.
///
/// Duplicate detection relies on the `readings_key` unique constraint: the
/// insert uses `ON CONFLICT DO NOTHING`, so a re-delivered reading affects no
/// rows and is reported as [`LogError::DuplicateReading`].
pub struct PgAppendLog {
    pool: PgPool,
}

impl PgAppendLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn classify(err: QueryError) -> LogError {
    match err {
        QueryError::Sqlx(e) => classify_sqlx(e),
        QueryError::Decode(e) => LogError::Rejected(e.to_string()),
    }
}

fn classify_sqlx(err: sqlx::Error) -> LogError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => LogError::Unavailable(err.to_string()),
        sqlx::Error::Database(db) => LogError::Rejected(db.to_string()),
        other => LogError::Rejected(other.to_string()),
    }
}

fn is_unique_violation(err: &QueryError) -> bool {
    match err {
        QueryError::Sqlx(sqlx::Error::Database(db)) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[async_trait::async_trait]
impl AppendLog for PgAppendLog {
    async fn append(&self, reading: &Reading) -> Result<(), LogError> {
        match db::insert_reading(&self.pool, reading).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LogError::DuplicateReading(reading.key())),
            // A concurrent writer can still race past ON CONFLICT on some backends.
            Err(e) if is_unique_violation(&e) => Err(LogError::DuplicateReading(reading.key())),
            Err(e) => Err(classify(e)),
        }
    }

    async fn latest(&self, metric_kind: MetricKind) -> Result<Option<Reading>, LogError> {
        db::latest_reading(&self.pool, metric_kind.as_str())
            .await
            .map_err(classify)
    }

    async fn history(
        &self,
        metric_kind: MetricKind,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Reading>, LogError> {
        db::reading_history(&self.pool, metric_kind.as_str(), from, to)
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_connectivity_failures() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(classify_sqlx(io).is_connectivity());
        assert!(classify_sqlx(sqlx::Error::PoolTimedOut).is_connectivity());
    }

    #[test]
    fn other_errors_are_record_rejections() {
        let err = classify_sqlx(sqlx::Error::RowNotFound);
        assert!(matches!(err, LogError::Rejected(_)));
        assert!(!err.is_connectivity());
    }
}
