use std::{path::Path, time::Duration};

use reading_client::domain::{
    from_unix_nanos, to_unix_nanos, ParseDomainError, Reading, SubmissionRecord, SubmissionStatus,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use tracing::info;

use super::{store::QueueStore, QueueError};

const COLUMNS: &str = "captured_at_ns, metric_kind, value, source, status, attempt_count, \
                       attempt_base, last_attempt_at_ns, last_error, enqueued_at_ns";

/// SQLite-backed queue store. Records survive process restarts.
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    captured_at_ns: i64,
    metric_kind: String,
    value: f64,
    source: String,
    status: String,
    attempt_count: i64,
    attempt_base: i64,
    last_attempt_at_ns: Option<i64>,
    last_error: Option<String>,
    enqueued_at_ns: i64,
}

fn to_u32(v: i64) -> u32 {
    v.clamp(0, i64::from(u32::MAX)) as u32
}

impl TryFrom<SubmissionRow> for SubmissionRecord {
    type Error = ParseDomainError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        let reading = Reading::new(
            from_unix_nanos(row.captured_at_ns)?,
            row.metric_kind.parse()?,
            row.value,
            row.source.parse()?,
        );

        Ok(SubmissionRecord {
            reading,
            status: row.status.parse()?,
            attempt_count: to_u32(row.attempt_count),
            attempt_base: to_u32(row.attempt_base),
            last_attempt_at: row.last_attempt_at_ns.map(from_unix_nanos).transpose()?,
            last_error: row.last_error,
            enqueued_at: from_unix_nanos(row.enqueued_at_ns)?,
        })
    }
}

impl SqliteQueueStore {
    /// Open (creating if needed) the queue database at `path`.
    ///
    /// Every pooled connection gets WAL, `synchronous = FULL` and a busy
    /// timeout, so several processes may share one file; writers wait
    /// instead of failing with `SQLITE_BUSY`.
    pub async fn open(path: &Path) -> Result<Self, QueueError> {
        let newly_created = !path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        if newly_created {
            info!(path = %path.display(), "created pending-submission queue");
        } else {
            info!(path = %path.display(), "opened pending-submission queue");
        }

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. A single long-lived connection keeps the
    /// data alive.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_submissions (
                seq                INTEGER PRIMARY KEY AUTOINCREMENT,
                reading_id         TEXT    NOT NULL UNIQUE,
                captured_at_ns     INTEGER NOT NULL,
                metric_kind        TEXT    NOT NULL,
                value              REAL    NOT NULL,
                source             TEXT    NOT NULL,
                status             TEXT    NOT NULL,
                attempt_count      INTEGER NOT NULL DEFAULT 0,
                attempt_base       INTEGER NOT NULL DEFAULT 0,
                last_attempt_at_ns INTEGER,
                last_error         TEXT,
                enqueued_at_ns     INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS pending_submissions_status_ts \
             ON pending_submissions (status, captured_at_ns, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueStore for SqliteQueueStore {
    async fn insert_if_absent(
        &self,
        record: &SubmissionRecord,
    ) -> Result<Option<SubmissionRecord>, QueueError> {
        let id = record.reading_id();
        let last_attempt_at_ns = record.last_attempt_at.map(to_unix_nanos).transpose()?;

        let res = sqlx::query(
            r#"
            INSERT INTO pending_submissions (
                reading_id, captured_at_ns, metric_kind, value, source, status,
                attempt_count, attempt_base, last_attempt_at_ns, last_error, enqueued_at_ns
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(reading_id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(to_unix_nanos(record.reading.captured_at)?)
        .bind(record.reading.metric_kind.as_str())
        .bind(record.reading.value)
        .bind(record.reading.source.as_str())
        .bind(record.status.as_str())
        .bind(i64::from(record.attempt_count))
        .bind(i64::from(record.attempt_base))
        .bind(last_attempt_at_ns)
        .bind(&record.last_error)
        .bind(to_unix_nanos(record.enqueued_at)?)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            Ok(None)
        } else {
            self.get(&id).await
        }
    }

    async fn get(&self, reading_id: &str) -> Result<Option<SubmissionRecord>, QueueError> {
        let sql = format!("SELECT {COLUMNS} FROM pending_submissions WHERE reading_id = ?");
        let row = sqlx::query_as::<_, SubmissionRow>(&sql)
            .bind(reading_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(SubmissionRecord::try_from).transpose()?)
    }

    async fn update(&self, record: &SubmissionRecord) -> Result<(), QueueError> {
        let id = record.reading_id();
        let last_attempt_at_ns = record.last_attempt_at.map(to_unix_nanos).transpose()?;

        let res = sqlx::query(
            r#"
            UPDATE pending_submissions
            SET status = ?, attempt_count = ?, attempt_base = ?,
                last_attempt_at_ns = ?, last_error = ?
            WHERE reading_id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(i64::from(record.attempt_count))
        .bind(i64::from(record.attempt_base))
        .bind(last_attempt_at_ns)
        .bind(&record.last_error)
        .bind(&id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn remove(&self, reading_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM pending_submissions WHERE reading_id = ?")
            .bind(reading_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, status: SubmissionStatus) -> Result<Vec<SubmissionRecord>, QueueError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM pending_submissions WHERE status = ? ORDER BY captured_at_ns, seq"
        );
        let rows = sqlx::query_as::<_, SubmissionRow>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| SubmissionRecord::try_from(r).map_err(QueueError::from))
            .collect()
    }
}
