use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{ParseDomainError, Reading};

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("undecodable reading row: {0}")]
    Decode(#[from] ParseDomainError),
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReadingRow {
    captured_at: OffsetDateTime,
    metric_kind: String,
    value: f64,
    source: String,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = ParseDomainError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        Ok(Reading::new(
            row.captured_at,
            row.metric_kind.parse()?,
            row.value,
            row.source.parse()?,
        ))
    }
}

/// Insert a reading unless its key is already stored.
///
/// Returns `false` when the row already existed. The `readings` table carries
/// a unique constraint on `(captured_at, metric_kind, source)`; see
/// `sql/schema/01_readings.sql`.
pub async fn insert_reading(pool: &PgPool, reading: &Reading) -> Result<bool, QueryError> {
    let res = sqlx::query(
        r#"
        INSERT INTO readings (reading_id, captured_at, metric_kind, value, source)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(reading.reading_id())
    .bind(reading.captured_at)
    .bind(reading.metric_kind.as_str())
    .bind(reading.value)
    .bind(reading.source.as_str())
    .execute(pool)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Most recent reading of a kind. A manual reading outranks an automatic one
/// captured at the same instant.
pub async fn latest_reading(pool: &PgPool, metric_kind: &str) -> Result<Option<Reading>, QueryError> {
    let row = sqlx::query_as::<_, ReadingRow>(
        r#"
        SELECT captured_at, metric_kind, value, source
        FROM readings
        WHERE metric_kind = $1
        ORDER BY captured_at DESC,
                 CASE source WHEN 'manual' THEN 1 ELSE 0 END DESC
        LIMIT 1
        "#,
    )
    .bind(metric_kind)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Reading::try_from).transpose()?)
}

/// Time-ordered readings of a kind in `[start, end)`.
pub async fn reading_history(
    pool: &PgPool,
    metric_kind: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<Reading>, QueryError> {
    let rows = sqlx::query_as::<_, ReadingRow>(
        r#"
        SELECT captured_at, metric_kind, value, source
        FROM readings
        WHERE metric_kind = $1
          AND captured_at >= $2
          AND captured_at <  $3
        ORDER BY captured_at, source
        "#,
    )
    .bind(metric_kind)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| Reading::try_from(r).map_err(QueryError::from))
        .collect()
}
