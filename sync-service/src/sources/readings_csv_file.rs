use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use futures::Stream;
use reading_client::domain::{MetricKind, Reading, ReadingOrigin};
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, Source};

/// CSV import of readings, e.g. monthly meter values typed into a sheet.
///
/// Expected header columns (by name):
/// - captured_at (RFC3339 timestamp)
/// - metric_kind (production | consumption | lifetime_total)
/// - value
/// - source (optional; falls back to the source's default origin)
pub struct ReadingsCsvFileSource {
    path: PathBuf,
    default_origin: ReadingOrigin,
}

impl ReadingsCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P, default_origin: ReadingOrigin) -> Self {
        Self {
            path: path.into(),
            default_origin,
        }
    }
}

fn column<'r>(record: &'r StringRecord, headers: &StringRecord, name: &str) -> Option<&'r str> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .and_then(|idx| record.get(idx))
}

fn record_to_reading(
    record: &StringRecord,
    headers: &StringRecord,
    default_origin: ReadingOrigin,
) -> Result<Reading, PipelineError> {
    let require = |name: &str| {
        column(record, headers, name)
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };

    let ts_str = require("captured_at")?;
    let captured_at = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid captured_at '{ts_str}': {e}")))?;

    let metric_kind = require("metric_kind")?
        .parse::<MetricKind>()
        .map_err(|e| PipelineError::Source(format!("{e}")))?;

    let value_str = require("value")?;
    let value: f64 = value_str
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid value '{value_str}': {e}")))?;

    let source = match column(record, headers, "source").map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.parse::<ReadingOrigin>().map_err(|e| PipelineError::Source(format!("{e}")))?,
        None => default_origin,
    };

    Ok(Reading::new(captured_at, metric_kind, value, source))
}

#[async_trait::async_trait]
impl Source<Reading> for ReadingsCsvFileSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send>> {
        // Import files are small; the blocking reader runs inline.
        let path = self.path.clone();
        let default_origin = self.default_origin;
        let s = async_stream::stream! {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to open CSV file: {e}")));
                    return;
                }
            };
            let mut rdr = csv::Reader::from_reader(file);
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };

            for (line, result) in rdr.records().enumerate() {
                let parsed = result
                    .map_err(|e| PipelineError::Source(format!("failed to read CSV record: {e}")))
                    .and_then(|record| record_to_reading(&record, &headers, default_origin));

                match parsed {
                    Ok(reading) => {
                        yield Ok(Envelope::now(reading));
                    }
                    Err(e) => {
                        metrics::counter!("readings_csv_parse_errors_total").increment(1);
                        tracing::warn!(line = line + 2, error = %e, "skipping CSV row");
                        yield Err(e);
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use time::macros::datetime;

    #[test]
    fn row_without_source_uses_default_origin() {
        let headers = StringRecord::from(vec!["captured_at", "metric_kind", "value"]);
        let record = StringRecord::from(vec!["2024-06-01T10:00:00Z", "production", "5.0"]);

        let r = record_to_reading(&record, &headers, ReadingOrigin::Manual).unwrap();
        assert_eq!(r.captured_at, datetime!(2024-06-01 10:00:00 UTC));
        assert_eq!(r.metric_kind, MetricKind::Production);
        assert_eq!(r.source, ReadingOrigin::Manual);
    }

    #[test]
    fn row_with_unknown_kind_is_an_error() {
        let headers = StringRecord::from(vec!["captured_at", "metric_kind", "value"]);
        let record = StringRecord::from(vec!["2024-06-01T10:00:00Z", "irradiance", "5.0"]);
        assert!(matches!(
            record_to_reading(&record, &headers, ReadingOrigin::Manual),
            Err(PipelineError::Source(_))
        ));
    }

    #[tokio::test]
    async fn streams_rows_and_reports_bad_ones() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "captured_at,metric_kind,value,source").unwrap();
        writeln!(file, "2024-06-01T10:00:00Z,production,5.0,automatic").unwrap();
        writeln!(file, "2024-06-01T10:05:00Z,production,not-a-number,").unwrap();
        writeln!(file, "2024-06-01T10:05:00Z,consumption,1.25,").unwrap();
        file.flush().unwrap();

        let source = ReadingsCsvFileSource::new(file.path(), ReadingOrigin::Manual);
        let items: Vec<_> = source.stream().await.collect().await;

        assert_eq!(items.len(), 3);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.payload.source, ReadingOrigin::Automatic);
        assert!(items[1].is_err());
        let third = items[2].as_ref().unwrap();
        assert_eq!(third.payload.metric_kind, MetricKind::Consumption);
        assert_eq!(third.payload.source, ReadingOrigin::Manual);
    }
}
