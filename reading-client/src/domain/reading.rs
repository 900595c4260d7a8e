use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

/// What a reading measures. All kinds are energy in kWh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Production,
    Consumption,
    LifetimeTotal,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [
        MetricKind::Production,
        MetricKind::Consumption,
        MetricKind::LifetimeTotal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Production => "production",
            MetricKind::Consumption => "consumption",
            MetricKind::LifetimeTotal => "lifetime_total",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "production" => Ok(MetricKind::Production),
            "consumption" => Ok(MetricKind::Consumption),
            "lifetime_total" => Ok(MetricKind::LifetimeTotal),
            other => Err(ParseDomainError::MetricKind(other.to_string())),
        }
    }
}

/// Where a reading came from: polled off the device, or entered by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingOrigin {
    Automatic,
    Manual,
}

impl ReadingOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingOrigin::Automatic => "automatic",
            ReadingOrigin::Manual => "manual",
        }
    }
}

impl fmt::Display for ReadingOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingOrigin {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "automatic" => Ok(ReadingOrigin::Automatic),
            "manual" => Ok(ReadingOrigin::Manual),
            other => Err(ParseDomainError::Origin(other.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseDomainError {
    #[error("unknown metric kind '{0}'")]
    MetricKind(String),
    #[error("unknown reading source '{0}'")]
    Origin(String),
    #[error("unknown submission status '{0}'")]
    Status(String),
    #[error("timestamp out of range: {0}")]
    Timestamp(String),
}

/// A single timestamped energy measurement.
///
/// Readings are never mutated after construction. Two readings with the same
/// [`ReadingKey`] are the same logical reading, whatever their values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub metric_kind: MetricKind,
    pub value: f64,
    pub source: ReadingOrigin,
}

impl Reading {
    /// Build a reading, normalising `captured_at` to UTC.
    pub fn new(
        captured_at: OffsetDateTime,
        metric_kind: MetricKind,
        value: f64,
        source: ReadingOrigin,
    ) -> Self {
        Self {
            captured_at: captured_at.to_offset(UtcOffset::UTC),
            metric_kind,
            value,
            source,
        }
    }

    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            captured_at: self.captured_at,
            metric_kind: self.metric_kind,
            source: self.source,
        }
    }

    pub fn reading_id(&self) -> String {
        self.key().reading_id()
    }

    /// Ordering used when picking the "latest" reading of a kind: newer
    /// `captured_at` first, and at the same instant a manual correction
    /// outranks the automatic value.
    pub fn recency_rank(&self) -> (OffsetDateTime, bool) {
        (self.captured_at, self.source == ReadingOrigin::Manual)
    }
}

/// De-duplication identity of a reading.
///
/// At most one automatic and one manual reading can exist per metric kind and
/// instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadingKey {
    pub captured_at: OffsetDateTime,
    pub metric_kind: MetricKind,
    pub source: ReadingOrigin,
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

impl ReadingKey {
    /// Deterministic hex id derived from the key alone.
    pub fn reading_id(&self) -> String {
        let mut h = blake3::Hasher::new();
        h.update(&self.captured_at.unix_timestamp_nanos().to_le_bytes());
        hash_str(&mut h, self.metric_kind.as_str());
        hash_str(&mut h, self.source.as_str());
        h.finalize().to_hex().to_string()
    }
}

impl fmt::Display for ReadingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.metric_kind, self.source, self.captured_at)
    }
}

/// Convert a timestamp to the integer nanosecond form used by local storage.
pub fn to_unix_nanos(ts: OffsetDateTime) -> Result<i64, ParseDomainError> {
    i64::try_from(ts.unix_timestamp_nanos()).map_err(|_| ParseDomainError::Timestamp(ts.to_string()))
}

pub fn from_unix_nanos(nanos: i64) -> Result<OffsetDateTime, ParseDomainError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| ParseDomainError::Timestamp(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn key_ignores_value_and_offset() {
        let a = Reading::new(
            datetime!(2024-06-01 10:00:00 UTC),
            MetricKind::Production,
            5.0,
            ReadingOrigin::Automatic,
        );
        let b = Reading::new(
            datetime!(2024-06-01 12:00:00 +02:00),
            MetricKind::Production,
            7.5,
            ReadingOrigin::Automatic,
        );

        assert_eq!(a.key(), b.key());
        assert_eq!(a.reading_id(), b.reading_id());
        assert_eq!(b.captured_at.offset(), UtcOffset::UTC);
    }

    #[test]
    fn reading_id_differs_by_source_and_kind() {
        let ts = datetime!(2024-06-01 10:00:00 UTC);
        let auto = Reading::new(ts, MetricKind::Production, 5.0, ReadingOrigin::Automatic);
        let manual = Reading::new(ts, MetricKind::Production, 5.0, ReadingOrigin::Manual);
        let consumption = Reading::new(ts, MetricKind::Consumption, 5.0, ReadingOrigin::Automatic);

        assert_ne!(auto.reading_id(), manual.reading_id());
        assert_ne!(auto.reading_id(), consumption.reading_id());
        assert_eq!(auto.reading_id().len(), 64);
    }

    #[test]
    fn manual_outranks_automatic_at_same_instant() {
        let ts = datetime!(2024-06-01 10:00:00 UTC);
        let auto = Reading::new(ts, MetricKind::Production, 5.0, ReadingOrigin::Automatic);
        let manual = Reading::new(ts, MetricKind::Production, 4.0, ReadingOrigin::Manual);
        let later = Reading::new(
            datetime!(2024-06-01 10:05:00 UTC),
            MetricKind::Production,
            5.2,
            ReadingOrigin::Automatic,
        );

        assert!(manual.recency_rank() > auto.recency_rank());
        assert!(later.recency_rank() > manual.recency_rank());
    }

    #[test]
    fn reading_serializes_with_snake_case_enums_and_rfc3339() {
        let r = Reading::new(
            datetime!(2024-06-01 10:00:00 UTC),
            MetricKind::LifetimeTotal,
            1234.5,
            ReadingOrigin::Manual,
        );
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["metric_kind"], "lifetime_total");
        assert_eq!(json["source"], "manual");
        assert_eq!(json["captured_at"], "2024-06-01T10:00:00Z");

        let back: Reading = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn unix_nanos_conversion_keeps_subsecond_precision() {
        let ts = datetime!(2024-06-01 10:00:00.123456789 UTC);
        let nanos = to_unix_nanos(ts).unwrap();
        assert_eq!(from_unix_nanos(nanos).unwrap(), ts);
    }

    #[test]
    fn parses_kind_and_origin_names() {
        assert_eq!("lifetime_total".parse::<MetricKind>().unwrap(), MetricKind::LifetimeTotal);
        assert_eq!(" manual ".parse::<ReadingOrigin>().unwrap(), ReadingOrigin::Manual);
        assert!(matches!(
            "solar".parse::<MetricKind>(),
            Err(ParseDomainError::MetricKind(_))
        ));
    }
}
